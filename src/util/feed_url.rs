use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors produced while turning user or document supplied text into a
/// fetchable feed URL.
#[derive(Error, Debug)]
pub enum FeedUrlError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The host is known to refuse our fetches.
    #[error("Host {0} blocks this service")]
    BlockedHost(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Normalizes a feed URL into its canonical identity.
///
/// Text without a scheme (`example.com/rss`) is treated as `http://`. The
/// fragment is always stripped, since it never reaches the origin server and
/// two URLs differing only by fragment name the same feed.
pub fn normalize_feed_url(raw: &str) -> Result<Url, FeedUrlError> {
    let raw = raw.trim();
    let mut url = match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        // "example.com:8080/rss" parses with "example.com" as the scheme
        Ok(url) if !raw.contains("://") => {
            Url::parse(&format!("http://{raw}")).map_err(|_| {
                FeedUrlError::UnsupportedScheme(url.scheme().to_owned())
            })?
        }
        Ok(url) => return Err(FeedUrlError::UnsupportedScheme(url.scheme().to_owned())),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("http://{raw}"))?,
        Err(e) => return Err(e.into()),
    };

    if url.host_str().map_or(true, str::is_empty) {
        return Err(FeedUrlError::MissingHost);
    }
    url.set_fragment(None);
    Ok(url)
}

/// Checks whether a URL may be fetched under the given policy.
///
/// Rejects hosts on the blocklist (including their subdomains) and, unless
/// `allow_private` is set, localhost and private address ranges.
pub fn check_fetch_allowed(
    url: &Url,
    blocked_hosts: &[String],
    allow_private: bool,
) -> Result<(), FeedUrlError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(FeedUrlError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(FeedUrlError::MissingHost)?;
    let host_lower = host.to_ascii_lowercase();

    for blocked in blocked_hosts {
        let blocked = blocked.to_ascii_lowercase();
        if host_lower == blocked || host_lower.ends_with(&format!(".{blocked}")) {
            return Err(FeedUrlError::BlockedHost(host.to_owned()));
        }
    }

    if allow_private {
        return Ok(());
    }

    if host_lower == "localhost" {
        return Err(FeedUrlError::Localhost);
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(FeedUrlError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(FeedUrlError::PrivateIp(ip.to_string()));
        }
    }

    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

//! Task names are limited to `[0-9A-Za-z_-]`. Feed identities are URLs, so
//! every byte outside `[0-9A-Za-z-]` is written as `_` followed by two
//! uppercase hex digits. `_` itself is escaped so the encoding is reversible.

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn should_escape(c: u8) -> bool {
    !(c.is_ascii_alphanumeric() || c == b'-')
}

/// Hex-escapes bytes that are not allowed in task names.
///
/// Length limits are not enforced here.
pub fn task_name_escape(s: &str) -> String {
    let bytes = s.as_bytes();
    let escapes = bytes.iter().filter(|&&c| should_escape(c)).count();
    if escapes == 0 {
        return s.to_owned();
    }

    let mut out = String::with_capacity(bytes.len() + 2 * escapes);
    for &c in bytes {
        if should_escape(c) {
            out.push('_');
            out.push(HEX[(c >> 4) as usize] as char);
            out.push(HEX[(c & 0x0f) as usize] as char);
        } else {
            out.push(c as char);
        }
    }
    out
}

/// Reverses [`task_name_escape`]. Returns `None` for malformed input.
pub fn task_name_unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hi = hex_value(*bytes.get(i + 1)?)?;
            let lo = hex_value(*bytes.get(i + 2)?)?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_names_untouched() {
        assert_eq!(task_name_escape("abc-XYZ-019"), "abc-XYZ-019");
    }

    #[test]
    fn test_url_escaped() {
        assert_eq!(
            task_name_escape("http://a.b/c_d"),
            "http_3A_2F_2Fa_2Eb_2Fc_5Fd"
        );
    }

    #[test]
    fn test_non_ascii_escaped_per_byte() {
        assert_eq!(task_name_escape("é"), "_C3_A9");
        assert_eq!(task_name_unescape("_C3_A9").as_deref(), Some("é"));
    }

    #[test]
    fn test_unescape_rejects_truncated_sequence() {
        assert_eq!(task_name_unescape("abc_4"), None);
        assert_eq!(task_name_unescape("abc_zz"), None);
    }

    proptest! {
        #[test]
        fn escaped_names_use_task_alphabet(s in ".*") {
            let escaped = task_name_escape(&s);
            prop_assert!(escaped
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_'));
        }

        #[test]
        fn escape_is_reversible(s in ".*") {
            prop_assert_eq!(task_name_unescape(&task_name_escape(&s)), Some(s));
        }
    }
}

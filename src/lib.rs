//! feedsync keeps a store of RSS/Atom feeds current.
//!
//! Feeds are polled on an adaptive schedule, or pushed to us by their hub.
//! Either way the fetched document is reconciled against the stored stories,
//! and only new or changed stories are written.

pub mod config;
pub mod feed;
pub mod hub;
pub mod storage;
pub mod subscriptions;
pub mod sync;
pub mod tasks;
pub mod util;
pub mod web;

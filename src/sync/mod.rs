//! Reconciling fetched documents with the store and scheduling the next poll.
//!
//! [`reconcile`] and [`schedule`] are pure; [`Engine`] wires them to the
//! database and the fetcher.

mod content;
mod reconcile;
mod schedule;
mod service;

pub use content::{pack_content, unpack_content};
pub use reconcile::{is_already_current, reconcile, Decision, Flags};
pub use schedule::{backoff_delay, update_average, SchedulePolicy};
pub use service::{Engine, SyncError, UpdateOutcome};

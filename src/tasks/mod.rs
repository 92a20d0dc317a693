//! Named tasks on the SQLite queue: payloads, the periodic sweeps that fan
//! work out, and the worker that runs it.

pub mod fanout;
pub mod queue;
mod worker;

pub use fanout::{
    delete_old_feed, delete_old_feeds, import_opml, purge_tasks, update_feeds, ImportStep,
    PurgeOutcome, RetentionSweep,
};
pub use queue::{enqueue, update_task_name, Task, TaskError};
pub use worker::{retry_delay, Worker};

mod feeds;
mod schema;
mod stories;
mod tasks;
mod types;
mod users;

pub use feeds::DueFeed;
pub use schema::Database;
pub use tasks::{ClaimedTask, NewTask, TaskRecord, TaskState};
pub use types::{
    time_max, DatabaseError, Feed, Story, StoryContent, StoryWrite, TIME_MAX_SECS,
};

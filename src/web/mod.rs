//! HTTP surface: the push-hub callback.

pub mod push;
mod router;

pub use router::{create_router, serve};

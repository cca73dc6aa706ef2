pub mod error;
pub mod pipeline;
pub mod streamer_core;

pub use error::{Result, SyncError};

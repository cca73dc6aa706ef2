pub mod error_handler;
pub mod log_source;
pub mod metadata;

pub use error_handler::{retry_with_backoff, ExponentialBackoff};
pub use log_source::{JsonRpcLogSource, LogFilter, LogSource};
pub use metadata::{EntityMetadata, HttpMetadataFetcher, MetadataSource};

pub mod fast_import;
pub(crate) mod process_cache;
pub mod repository;

pub use fast_import::{ChannelFactory, SinkHandle, SinkRegistry, MAX_MARK};

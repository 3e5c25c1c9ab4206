//! Treepipe library
//!
//! Streams whole directory trees to and from a blob store as tar archives
//! compressed with xz or zstd, chosen by the object key's extension. The
//! archive only ever exists as bytes moving through in-memory pipes between
//! concurrent stages; nothing is staged on local disk.

pub mod archive;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extract;
pub mod log;
pub mod logger;
pub mod pipe;
pub mod session;
pub mod stage;
pub mod store;
pub mod transfer;
pub mod walk;

pub use cancel::CancelToken;
pub use error::TransferError;
pub use session::{Session, TransferHandle};
pub use transfer::{Direction, PipelineOptions, TransferStats};

pub mod cancel;
pub mod config;
pub mod error;
pub mod fingerprint;
#[cfg(feature = "distributed")]
pub mod http_source;
pub mod metadata_store;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod reconciler;
pub mod remote;
pub mod retry;
#[cfg(feature = "distributed")]
pub mod s3_remote;
pub mod source;
pub mod verifier;

pub use error::*;

//! Deposit Agent Library
//!
//! Streams data-grid collections into a remote research repository as a
//! single verified deposit: archives are encoded on the fly (never staged
//! on disk), uploaded with an exact declared length, and reconciled against
//! digests from both ends before the export counts as done.

pub mod bundle;
pub mod config;
pub mod deposit;
pub mod executor;
pub mod job;
pub mod ledger;
pub mod phase;
pub mod reconcile;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{ExportExecutor, ExportSummary};
pub use job::ExportJob;
pub use utils::errors::ExportError;
pub type Result<T> = std::result::Result<T, ExportError>;

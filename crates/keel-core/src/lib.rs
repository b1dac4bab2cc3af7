//! `keel-core`: configuration, error type and identifiers shared by the
//! scheduler library and the daemon.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DatabaseConfig, KeelConfig, SchedulerConfig};
pub use error::{KeelError, Result};
pub use types::{InstanceId, JobId};

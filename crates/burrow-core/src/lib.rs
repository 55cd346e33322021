pub mod config;
pub mod crypto;
pub mod error;
mod fsutil;
pub mod model;
pub mod storage;
pub mod workspace;

pub use error::CoreError;
pub use workspace::{Health, ReplayReport, Workspace, WriteScope, DATA_DIR};

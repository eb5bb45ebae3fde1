pub mod backup;
pub mod checksum;
pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod flags;
pub mod manifest;
pub mod package;
pub mod platform;
pub mod report;
pub mod source;
pub mod stakeholder;
pub mod state;
pub mod supervisor;
pub mod updater;

#[cfg(test)]
mod testing;

pub use config::CtlConfig;
pub use control::ControlReply;
pub use driver::Driver;
pub use error::{CtlError, Result};
pub use source::{HttpSource, PackageSource};

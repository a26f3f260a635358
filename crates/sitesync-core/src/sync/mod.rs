//! Sync passes: the driver and the report it produces.

mod driver;
mod report;

pub use driver::SyncDriver;
pub use report::{SkipReason, SyncReport};

pub(crate) use driver::{purge_record_in, settle_in};

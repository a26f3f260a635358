//! Local store for SiteSync

mod connection;
mod migrations;
mod store;

pub use connection::Database;
pub use migrations::CURRENT_VERSION as SCHEMA_VERSION;
pub use store::{Collection, Document, Documents, LocalStore};

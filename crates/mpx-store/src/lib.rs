//! Durable runtime state: upstream records in SQLite and the reconciliation
//! rule that merges them with the user-editable config.

mod db;
mod reconcile;

pub use db::{StateStore, UpstreamRecord};
pub use reconcile::reconcile_startup_mode;

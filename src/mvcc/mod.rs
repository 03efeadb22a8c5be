//! Revisioned key-value model.
//!
//! - [`record`] - Revision records and write outcomes
//! - [`backend`] - Create/Update/Delete/Get/List with compare-on-revision
//!   semantics

pub mod backend;
pub mod record;

pub use backend::Backend;
pub use record::{Record, WriteOutcome};

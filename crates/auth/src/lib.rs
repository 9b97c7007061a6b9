//! `riskbatch-auth`: access scope resolution for bulk jobs.
//!
//! Decoupled from transport and storage: callers hand in an already
//! authenticated [`Actor`] and get back the scope to stamp on new records or
//! the filter to apply on reads.

pub mod actor;
pub mod roles;
pub mod scope;

pub use actor::Actor;
pub use roles::Role;
pub use scope::{ReadFilter, read_filter, resolve};

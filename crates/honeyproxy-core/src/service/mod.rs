//! Services: the decoy endpoints a proxy forwards traffic to.
//!
//! - **[`base`]**: the [`Service`] trait and the [`BaseService`] record
//!   that plain and plugin-backed services hold privately.
//! - **[`manager`]**: the [`ServiceManager`] registry, including the lock
//!   check that guards deletion.

pub mod base;
pub mod manager;

pub use base::{BaseService, Service};
pub use manager::ServiceManager;

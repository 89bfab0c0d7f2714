//! Ratelink Common Types
//!
//! This crate contains shared types used across the Ratelink workspace,
//! including currency and money types, rate keys, session identifiers,
//! the error taxonomy and timing defaults.

pub mod identifiers;
pub mod monetary;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
pub use time::*;

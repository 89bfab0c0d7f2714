//! Ratelink Protocol Messages
//!
//! Text frames exchanged with the upstream server. Every frame is a JSON
//! object with a `type` field; `heartbeat` frames carry nothing else and
//! every other type is a conversion request.

pub mod messages;

pub use messages::*;

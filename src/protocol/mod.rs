//! Protocol health management
//!
//! Capability activation on an automation control channel can hang
//! indefinitely. This module wraps it with timeouts, bounded retries and a
//! per-(context, capability) state machine so one stuck capability never
//! blocks the others.

mod health;

pub use health::{ProtocolHealthManager, ProtocolSession};

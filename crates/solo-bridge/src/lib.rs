//! Typed event protocol and in-process event bus for daemon lifecycle
//! observability.

pub mod event_bus;
pub mod protocol;

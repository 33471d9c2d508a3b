//! Singleton daemon coordination: heartbeat-based leadership over a shared
//! agent-state row, a supervised service lifecycle, and a watchdog that
//! restarts the daemon when it dies without an intentional stop.

pub mod controller;
pub mod heartbeat;
pub mod services;
pub mod signals;
pub mod watchdog;

pub use controller::DaemonController;
pub use heartbeat::{HeartbeatManager, LeadershipClaim};
pub use services::{
    BootScriptReport, BootScriptRunner, RecoverySummary, Service, ServiceGate, SessionRecovery,
    SettingsProvider, ShutdownHook, StaticSettings,
};
pub use watchdog::{TickOutcome, Watchdog};

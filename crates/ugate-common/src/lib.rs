//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging for the gateway runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the UGate gateway workspace.
//! This crate exposes configuration loading and the tracing bootstrap
//! consumed by the daemon and the protocol crates.

pub mod config;
pub mod logging;

pub use config::{
    EofRule, GatewayConfig, ImageConfig, LoadedGatewayConfig, LoggingConfig, MailConfig,
    MetricsConfig, ProtocolLayout, RadioConfig, SubjectRole,
};
pub use logging::{init_tracing, LogFormat};

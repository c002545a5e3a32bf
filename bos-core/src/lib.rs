//! bOS toolbox core library.
//!
//! `bos-core` holds the device-facing building blocks the state machines in
//! `bos-workflow` are assembled from: configuration, per-host plans, mode detection,
//! partition layouts, backups and artifact staging.

pub mod backup;
pub mod config;
pub mod device;
pub mod factory;
pub mod hwid;
pub mod mode;
pub mod mtdparts;
pub mod netconf;
pub mod plan;
pub mod progress;
pub mod stage3;
pub mod staging;

pub use bos_error::{DomainStop, StopKind, StopPhase, ToolboxError, ToolboxResult};

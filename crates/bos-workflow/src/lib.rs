//! bOS workflow orchestration.
//!
//! This crate holds the per-host state machines (installer, restorer, updater), the
//! stage runner they are built on, and the batch runner that drives them across a
//! host list one device at a time.

pub mod batch;
pub mod cancel;
pub mod env;
pub mod installer;
pub mod reboot;
pub mod restorer;
pub mod stage_runner;
pub mod updater;

pub use batch::{read_host_list, BatchAbort, BatchReport, BatchRunner, HostOutcome, HostResult};
pub use cancel::CancelFlag;
pub use env::WorkflowEnv;
pub use installer::install;
pub use restorer::restore;
pub use updater::update;

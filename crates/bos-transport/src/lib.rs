//! Remote shell transport for the bOS toolbox.
//!
//! The orchestration engine never spawns `ssh` itself. Everything that touches a device
//! goes through the traits in [`transport`] so workflows can run against the recording
//! [`FakeTransport`] in tests and against [`OpenSshTransport`] in production.

pub mod quote;
pub mod transport;

pub use bos_error::{TransportError, TransportResult};
pub use quote::{join_argv, resolve_remote, shell_quote};
pub use transport::{
    connect_scoped, CommandOps, CommandOutput, ConnectTarget, DelayRange, FakeDevice,
    FakeResponse, FakeTransport, FileChannel, OpenSshOptions, OpenSshTransport, Operation,
    PortWaiter, Session, SessionGuard, TcpPortWaiter, Transport,
};

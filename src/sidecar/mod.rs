//! Persistence sidecar: the out-of-process state store, its socket protocol,
//! the in-process client and the restart supervisor.

pub mod client;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use client::{SidecarClient, SidecarClientStats, DEFAULT_RPC_TIMEOUT};
pub use protocol::{DirtyEntry, Request, Response};
pub use server::SidecarServer;
pub use supervisor::{SidecarSupervisor, SupervisorConfig, SupervisorStatus};

//! A software NIC.
//!
//! Emulates the pieces of RDMA and libfabric hardware the triport substrates
//! program against: protection domains and memory registration, queue pairs
//! with completion queues, a connection manager with event channels, and
//! reliable-datagram endpoints with tag matching. Every "DMA" is a copy
//! between registered ranges of this process's memory, validated against the
//! registration table the same way an HCA validates keys.

pub mod bridge;
pub mod cm;
pub mod cq;
pub mod fabric;
pub mod mr;
pub mod net;
pub mod verbs;

pub use cm::{CmEvent, CmEventKind, CmId, EventChannel, CM_PRIVATE_DATA_LEN};
pub use cq::{CompletionQueue, Signal, WcOpcode, WcStatus, WorkCompletion};
pub use fabric::{FabricAttr, RdmEndpoint, ADDR_UNSPEC};
pub use mr::{HwAccess, MemoryRegion, Sge};
pub use net::SoftNet;
pub use verbs::{Device, DeviceAttr, ProtectionDomain, QpCaps, QueuePair, SendOp, SendWr};

use thiserror::Error;

/// Synchronous failures of a hardware call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("work queue full ({0} entries)")]
    QueueFull(usize),

    #[error("{requested} scatter-gather entries exceed the limit of {limit}")]
    TooManySge { requested: usize, limit: usize },

    #[error("message of {len} bytes exceeds the limit of {limit}")]
    MessageTooLarge { len: usize, limit: usize },

    #[error("invalid memory key {0:#x}")]
    InvalidKey(u32),

    #[error("not connected")]
    NotConnected,

    #[error("address {0} already in use")]
    AddrInUse(String),

    /// Retry after progressing completions.
    #[error("resource temporarily unavailable")]
    Again,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of resources: {0}")]
    NoResources(String),
}

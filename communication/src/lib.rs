//! A transport-agnostic peer-to-peer messaging core.
//!
//! A fixed set of peers, indexed contiguously, exchange tagged byte
//! messages through whichever [`Rpc`] backend the configuration selects:
//! an in-process mesh of threads ([`Process`]) or a TCP mesh of processes
//! ([`Network`]). Sends are non-blocking and report completion through
//! [`Request`] handles; receives block until a message of the expected
//! length arrives.
//!
//! The crate also carries the small amount of arithmetic shared by users
//! of the transport: ordered peer sets ([`ProcessGroup`]) and the
//! deterministic shard partition ([`ShardCalc`]).

pub mod group;
pub mod initialize;
mod mailbox;
pub mod net;
pub mod process;
pub mod rpc;
pub mod shard;

pub use group::{Endpoint, ProcessGroup};
pub use initialize::{initialize, Config, Generic, WorkerGuards};
pub use net::{initialize_networking, Network};
pub use process::Process;
pub use rpc::{CompleteRequest, Request, RequestGroup, Rpc, Tag};
pub use shard::ShardCalc;

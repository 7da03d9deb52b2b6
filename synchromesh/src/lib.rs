//! A parameter-synchronization runtime for data-parallel workers.
//!
//! Every peer of a fixed group holds local copies of a set of named
//! variables. A round of [`Synchromesh::update`] ships a worker's variables
//! to a background syncer on every peer, runs a registered update function
//! against each peer's authoritative global table, and refills the worker's
//! copies from the result.
//!
//! Payloads are marshalled through a closed set of variants (scalars,
//! arrays, sequences, maps, sharded arrays, value sequences) identified by
//! ids from a process-wide registry; see [`bootstrap`]. The transport
//! underneath is pluggable: an in-process mesh of threads for single-machine
//! runs and tests, or a TCP mesh for clusters.

pub mod marshal;
pub mod registry;
pub mod strategy;
pub mod sync;
pub mod vars;

pub use synchromesh_communication as communication;

pub use marshal::{recv_pod, recv_with_id, send_pod, send_with_id, TagSeq, Value};
pub use registry::{bootstrap, DataId, Registry, UpdateFnId};
pub use strategy::CommStrategy;
pub use sync::{Noop, SyncFn, Synchromesh};
pub use vars::VarTable;

//! The synchronization engine.
//!
//! Each peer runs two flows over the same transport: the worker flow, which
//! the application drives through [`Synchromesh::update`], and a background
//! syncer task servicing incoming updates. The two share nothing but
//! messages, even on the same peer: the worker owns the `local` variable
//! table, the syncer owns the `tmp` scratch table and the authoritative
//! `global` table, and every hand-off travels through tagged sends.
//!
//! For shardable variables the syncer holds the whole array but receives
//! only this peer's fragment of a requester's payload; an update function
//! is expected to fold the region its requester owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, trace};

use synchromesh_communication::group::ProcessGroup;
use synchromesh_communication::rpc::{Request, RequestGroup, Rpc, Tag};

use crate::marshal::{recv_pod, send_pod, TagSeq, Value};
use crate::registry::{registry, UpdateFnId};
use crate::strategy::CommStrategy;
use crate::vars::VarTable;

/// Registration barrier during initialization.
pub const INIT_BARRIER: Tag = 1000;
/// Reserved for future initialization handshakes; currently unused.
pub const INIT_START: Tag = 1001;
/// Syncer-to-worker completion of initialization.
pub const INIT_DONE: Tag = 1002;
/// Base tag of the initial payload sequence.
pub const INIT_DATA: Tag = 1003;
/// Announces one update request.
pub const UPDATE_START: Tag = 1100;
/// Base tag of the worker-to-syncer payload sequence.
pub const WORKER_DATA: Tag = 1101;
/// Base tag of the syncer-to-worker reply sequence.
pub const SYNCER_DATA: Tag = 1200;
/// Shutdown collective.
pub const BARRIER: Tag = 1300;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct InitOptions {
    init_fn_id: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SyncOptions {
    wait_for_all: u64,
    update_fn_id: u64,
    worker_id: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct InitFinished {
    worker_id: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct Barrier {
    worker_id: u64,
}

/// A user update function.
///
/// The receiving syncer constructs a fresh instance through the registry,
/// pulls any bound arguments with `read_values`, and invokes `apply` once
/// the payload has landed in `tmp`. `apply` runs on the syncer thread; it
/// must not touch anything but the two tables it is given.
pub trait SyncFn: Send {
    /// Sends bound arguments to `dst`. Must mirror `read_values`.
    fn write_values(&self, _rpc: &dyn Rpc, _dst: usize, _tags: &mut TagSeq) {}

    /// Receives bound arguments from `src`. Must mirror `write_values`.
    fn read_values(&mut self, _rpc: &dyn Rpc, _src: usize, _tags: &mut TagSeq) {}

    /// Folds the received payload in `tmp` into the authoritative `global`.
    fn apply(&mut self, tmp: &VarTable, global: &mut VarTable);
}

/// The update function that does nothing.
#[derive(Default)]
pub struct Noop;

impl SyncFn for Noop {
    fn apply(&mut self, _tmp: &VarTable, _global: &mut VarTable) {}
}

/// Per-worker handle to the synchronization runtime.
///
/// Variables are registered before [`init`](Self::init); afterwards the
/// table is frozen and every peer drives rounds with
/// [`update`](Self::update). Dropping the handle runs a collective
/// shutdown, so no peer finishes its teardown before every peer has begun
/// one.
pub struct Synchromesh {
    rpc: Arc<dyn Rpc>,
    local: VarTable,
    initialized: bool,
    stop: Arc<AtomicBool>,
    syncer: Option<JoinHandle<()>>,
}

impl Synchromesh {
    pub fn new<R: Rpc + 'static>(rpc: R) -> Self {
        Synchromesh {
            rpc: Arc::new(rpc),
            local: VarTable::new(),
            initialized: false,
            stop: Arc::new(AtomicBool::new(false)),
            syncer: None,
        }
    }

    pub fn rpc(&self) -> &dyn Rpc {
        &*self.rpc
    }

    /// Registers a scalar variable. Only legal before `init`.
    pub fn register_pod<T: Pod + 'static>(&mut self, name: &str, value: T) {
        assert!(
            !self.initialized,
            "cannot register {:?} after initialization",
            name
        );
        self.local.insert(name, Value::pod(value));
    }

    /// Registers an array variable, seeded from `data`. Shardable arrays
    /// are scattered across the group during updates; everything else
    /// travels as full copies.
    pub fn register_array<T: Pod + 'static>(&mut self, name: &str, data: &[T], shardable: bool) {
        assert!(
            !self.initialized,
            "cannot register {:?} after initialization",
            name
        );
        let value = if shardable {
            Value::sharded(data)
        } else {
            Value::seq(data)
        };
        self.local.insert(name, value);
    }

    /// This worker's copies of the registered variables.
    pub fn local(&self) -> &VarTable {
        &self.local
    }

    /// Mutable access to this worker's copies. Holding the borrow keeps
    /// `update` from running, which is exactly the stability the protocol
    /// needs.
    pub fn local_mut(&mut self) -> &mut VarTable {
        &mut self.local
    }

    /// Collective initialization.
    ///
    /// Spawns the syncer, barriers on registration, ships every variable to
    /// every peer, and waits until each syncer has seeded its global table
    /// (from the first peer's payload) and applied `F` to it.
    pub fn init<F: SyncFn + 'static>(&mut self) {
        assert!(!self.initialized, "already initialized");
        let init_fn_id = registry().update_fn_id::<F>();

        let rpc = Arc::clone(&self.rpc);
        let templates = self.local.clone();
        let stop = Arc::clone(&self.stop);
        self.syncer = Some(
            thread::Builder::new()
                .name(format!("synchromesh:sync-{}", self.rpc.id()))
                .spawn(move || syncer_loop(rpc, templates, init_fn_id, stop))
                .expect("failed to spawn syncer"),
        );

        let rpc = &*self.rpc;
        let group = ProcessGroup::all(rpc);
        let mut reqs = RequestGroup::new();

        // registration barrier: data may not flow until every peer is done
        // registering, and every peer must name the same init function
        let opts = InitOptions { init_fn_id };
        for dst in group.iter() {
            reqs.add(send_pod(rpc, dst, INIT_BARRIER, &opts));
        }
        for src in group.iter() {
            let (_, peer_opts) = recv_pod::<InitOptions>(rpc, Some(src), INIT_BARRIER);
            assert_eq!(
                peer_opts.init_fn_id, init_fn_id,
                "peers disagree on the init function"
            );
        }

        // full copies of every variable to every syncer
        let base = TagSeq::new(INIT_DATA);
        for dst in group.iter() {
            let mut tags = base;
            for (_name, value) in self.local.iter() {
                reqs.merge(value.send(rpc, dst, &mut tags));
            }
        }
        reqs.wait();

        for src in group.iter() {
            let (_, _finished) = recv_pod::<InitFinished>(rpc, Some(src), INIT_DONE);
        }
        self.initialized = true;
        info!(worker = rpc.id(), vars = self.local.len(), "initialized");
    }

    /// One synchronization round.
    ///
    /// Ships `f`'s bound arguments and every local variable to each peer's
    /// syncer, then refills the local table with the fresh global copy.
    /// The round returns once the reply from every peer has landed.
    pub fn update<F: SyncFn + 'static>(&mut self, f: F) {
        assert!(self.initialized, "update before initialization");
        let rpc = &*self.rpc;
        let group = ProcessGroup::all(rpc);

        let opts = SyncOptions {
            wait_for_all: 0,
            update_fn_id: registry().update_fn_id::<F>(),
            worker_id: rpc.id() as u64,
        };
        let mut reqs = RequestGroup::new();
        for dst in group.iter() {
            reqs.add(send_pod(rpc, dst, UPDATE_START, &opts));
        }

        // bound arguments, then every variable, on the worker-data sequence
        let base = TagSeq::new(WORKER_DATA);
        let mut tags = base;
        for dst in group.iter() {
            let mut replay = base;
            f.write_values(rpc, dst, &mut replay);
            tags = replay;
        }
        for (_name, value) in self.local.iter() {
            let strategy = if value.shardable() {
                CommStrategy::Sharded
            } else {
                CommStrategy::All
            };
            reqs.merge(strategy.send(value, rpc, &group, &mut tags));
        }
        reqs.wait();

        // collect the fresh global copy
        let mut tags = TagSeq::new(SYNCER_DATA);
        for (_name, value) in self.local.iter_mut() {
            if value.shardable() {
                CommStrategy::Sharded.recv(value, rpc, &group, &mut tags);
            } else {
                // every syncer replies with a full copy; the copies are
                // identical, so the last write wins harmlessly
                let base = tags;
                let mut after = base;
                for src in group.iter() {
                    let mut replay = base;
                    value.recv(rpc, src, &mut replay);
                    after = replay;
                }
                tags = after;
            }
        }
        trace!(worker = rpc.id(), "update round complete");
    }
}

impl Drop for Synchromesh {
    fn drop(&mut self) {
        let rpc = &*self.rpc;
        let group = ProcessGroup::all(rpc);
        let record = Barrier {
            worker_id: rpc.id() as u64,
        };

        // quiesce: once every peer is here, no update is in flight
        // anywhere, so the syncers can stop without stranding a request
        let mut reqs = RequestGroup::new();
        for dst in group.iter() {
            reqs.add(send_pod(rpc, dst, BARRIER, &record));
        }
        reqs.wait();
        for src in group.iter() {
            let (_, _peer) = recv_pod::<Barrier>(rpc, Some(src), BARRIER);
        }

        self.stop.store(true, Ordering::Release);
        if let Some(syncer) = self.syncer.take() {
            syncer.join().expect("syncer panicked");
        }

        // release: keep the transport alive until every peer has torn down
        // its syncer
        let mut reqs = RequestGroup::new();
        for dst in group.iter() {
            reqs.add(send_pod(rpc, dst, BARRIER, &record));
        }
        reqs.wait();
        for src in group.iter() {
            let (_, _peer) = recv_pod::<Barrier>(rpc, Some(src), BARRIER);
        }
        debug!(worker = rpc.id(), "shutdown complete");
    }
}

/// The background task servicing one peer's share of every update.
fn syncer_loop(rpc: Arc<dyn Rpc>, templates: VarTable, init_fn_id: UpdateFnId, stop: Arc<AtomicBool>) {
    let rpc = &*rpc;
    let group = ProcessGroup::all(rpc);
    let me = rpc.id();
    let slot = group.position(me).expect("syncer not in its own group");

    // initialization: one full set per peer, received in peer order; the
    // first peer's set seeds the global copy
    let mut tmp = templates.clone();
    let mut global = templates;
    for src in group.iter() {
        let mut tags = TagSeq::new(INIT_DATA);
        for (_name, value) in tmp.iter_mut() {
            value.recv(rpc, src, &mut tags);
        }
        if src == group.member(0) {
            global = tmp.clone();
        }
    }
    registry().update_fn(init_fn_id).apply(&tmp, &mut global);

    let finished = InitFinished { worker_id: me as u64 };
    let mut reqs = RequestGroup::new();
    for dst in group.iter() {
        reqs.add(send_pod(rpc, dst, INIT_DONE, &finished));
    }
    reqs.wait();
    debug!(worker = me, "syncer ready");

    // service loop: drain update requests until the owner stops us
    while !stop.load(Ordering::Acquire) {
        if !rpc.poll(None, Some(UPDATE_START)) {
            thread::yield_now();
            continue;
        }
        let (src, opts) = recv_pod::<SyncOptions>(rpc, None, UPDATE_START);
        assert_eq!(opts.wait_for_all, 0, "wait_for_all updates are not supported");
        assert_eq!(opts.worker_id as usize, src, "update request misidentifies its worker");
        let mut update = registry().update_fn(opts.update_fn_id);

        let mut tags = TagSeq::new(WORKER_DATA);
        update.read_values(rpc, src, &mut tags);
        for (_name, value) in tmp.iter_mut() {
            if value.shardable() {
                value
                    .as_sharded_mut()
                    .recv_fragment(rpc, src, group.count(), slot, &mut tags);
            } else {
                value.recv(rpc, src, &mut tags);
            }
        }
        update.apply(&tmp, &mut global);

        let mut tags = TagSeq::new(SYNCER_DATA);
        let mut reqs = RequestGroup::new();
        for (_name, value) in global.iter() {
            if value.shardable() {
                reqs.merge(
                    value
                        .as_sharded()
                        .send_fragment(rpc, src, group.count(), slot, &mut tags),
                );
            } else {
                reqs.merge(value.send(rpc, src, &mut tags));
            }
        }
        reqs.wait();
        trace!(worker = me, requester = src, "serviced update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bootstrap_for_tests, Offset, Sum};
    use synchromesh_communication::Process;

    fn solo_mesh() -> Synchromesh {
        bootstrap_for_tests();
        Synchromesh::new(Process::new_vector(1).remove(0))
    }

    #[test]
    fn init_seeds_global_and_update_folds() {
        let mut mesh = solo_mesh();
        mesh.register_array("x", &[1.0_f64, 2.0], false);
        mesh.init::<Noop>();
        mesh.update(Sum::default());
        assert_eq!(mesh.local().array::<f64>("x"), &[2.0, 4.0]);
        mesh.update(Sum::default());
        assert_eq!(mesh.local().array::<f64>("x"), &[4.0, 8.0]);
    }

    #[test]
    fn noop_round_returns_the_initial_payload() {
        let mut mesh = solo_mesh();
        mesh.register_array("w", &[5_i64, 6, 7], true);
        mesh.register_pod("count", 3_u64);
        mesh.init::<Noop>();
        // scribble locally; the fresh global copy overwrites it
        mesh.local_mut().array_mut::<i64>("w")[0] = -1;
        mesh.update(Noop);
        assert_eq!(mesh.local().array::<i64>("w"), &[5, 6, 7]);
        assert_eq!(mesh.local().pod::<u64>("count"), 3);
    }

    #[test]
    fn bound_arguments_reach_the_update_function() {
        let mut mesh = solo_mesh();
        mesh.register_array("x", &[0.0_f64; 3], false);
        mesh.init::<Noop>();
        mesh.update(Offset { amount: 10.0 });
        assert_eq!(mesh.local().array::<f64>("x"), &[10.0, 10.0, 10.0]);
    }

    #[test]
    fn drop_without_init_is_clean() {
        let mesh = solo_mesh();
        drop(mesh);
    }

    #[test]
    #[should_panic(expected = "after initialization")]
    fn registration_freezes_at_init() {
        let mut mesh = solo_mesh();
        mesh.register_pod("early", 1_u32);
        mesh.init::<Noop>();
        mesh.register_pod("late", 2_u32);
    }

    #[test]
    #[should_panic(expected = "update before initialization")]
    fn update_requires_init() {
        let mut mesh = solo_mesh();
        mesh.register_pod("x", 1_u32);
        mesh.update(Noop);
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn init_is_single_use() {
        let mut mesh = solo_mesh();
        mesh.register_pod("x", 1_u32);
        mesh.init::<Noop>();
        mesh.init::<Noop>();
    }
}

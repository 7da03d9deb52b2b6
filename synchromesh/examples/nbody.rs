//! A toy n-body computation driven through the synchronization runtime.
//!
//! Every worker owns a contiguous range of particles, integrates it against
//! the full particle set, and folds the result into the replicated global
//! state once per round.
//!
//! Run with `-w 4` for four in-process workers, or with `-n`, `-p` and a
//! hostfile for one worker per process over TCP.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use synchromesh::communication::{initialize, Config, Rpc, ShardCalc, Tag};
use synchromesh::{bootstrap, recv_pod, send_pod, Noop, SyncFn, Synchromesh, TagSeq, VarTable};

const N: usize = 480;
const ROUNDS: usize = 5;
const DT: f64 = 1e-3;
const SOFTENING: f64 = 1e-2;

const VARS: [&str; 6] = ["vx", "vy", "vz", "x", "y", "z"];

/// Folds the requesting worker's particle range into the global state.
#[derive(Default)]
struct FoldOwned {
    worker: u64,
    workers: u64,
}

impl SyncFn for FoldOwned {
    fn write_values(&self, rpc: &dyn Rpc, dst: usize, tags: &mut TagSeq) {
        send_pod(rpc, dst, tags.next(), &self.worker);
        send_pod(rpc, dst, tags.next(), &self.workers);
    }

    fn read_values(&mut self, rpc: &dyn Rpc, src: usize, tags: &mut TagSeq) {
        self.worker = recv_pod::<u64>(rpc, Some(src), tags.next()).1;
        self.workers = recv_pod::<u64>(rpc, Some(src), tags.next()).1;
    }

    fn apply(&mut self, tmp: &VarTable, global: &mut VarTable) {
        let calc = ShardCalc::new(N, 8, self.workers as usize);
        let range = calc.start_elem(self.worker as usize)..calc.end_elem(self.worker as usize);
        for name in VARS {
            let incoming = tmp.array::<f64>(name)[range.clone()].to_vec();
            global.array_mut::<f64>(name)[range.clone()].copy_from_slice(&incoming);
        }
    }
}

fn checkpoint(rpc: &dyn Rpc, tag: Tag) {
    let token = rpc.id() as u64;
    for dst in rpc.first()..=rpc.last() {
        send_pod(rpc, dst, tag, &token);
    }
    for src in rpc.first()..=rpc.last() {
        recv_pod::<u64>(rpc, Some(src), tag);
    }
}

fn step(local: &mut VarTable, range: std::ops::Range<usize>) {
    let x = local.array::<f64>("x").to_vec();
    let y = local.array::<f64>("y").to_vec();
    let z = local.array::<f64>("z").to_vec();

    for i in range {
        let (mut ax, mut ay, mut az) = (0.0, 0.0, 0.0);
        for j in 0..N {
            if i == j {
                continue;
            }
            let dx = x[j] - x[i];
            let dy = y[j] - y[i];
            let dz = z[j] - z[i];
            let dist2 = dx * dx + dy * dy + dz * dz + SOFTENING;
            let inv = 1.0 / (dist2 * dist2.sqrt());
            ax += dx * inv;
            ay += dy * inv;
            az += dz * inv;
        }
        local.array_mut::<f64>("vx")[i] += ax * DT;
        local.array_mut::<f64>("vy")[i] += ay * DT;
        local.array_mut::<f64>("vz")[i] += az * DT;
        let vx = local.array::<f64>("vx")[i];
        let vy = local.array::<f64>("vy")[i];
        let vz = local.array::<f64>("vz")[i];
        local.array_mut::<f64>("x")[i] += vx * DT;
        local.array_mut::<f64>("y")[i] += vy * DT;
        local.array_mut::<f64>("z")[i] += vz * DT;
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    bootstrap(|reg| {
        reg.register_update::<FoldOwned>();
    });

    let config = Config::from_args(std::env::args()).expect("bad arguments");
    let guards = initialize(config, |peer| {
        let mut rng = StdRng::seed_from_u64(42);
        let mut mesh = Synchromesh::new(peer.clone());
        for name in VARS {
            let data: Vec<f64> = (0..N).map(|_| rng.gen_range(-1.0..1.0)).collect();
            mesh.register_array(name, &data, false);
        }
        mesh.init::<Noop>();

        let calc = ShardCalc::new(N, 8, peer.num_workers());
        let range = calc.start_elem(peer.id())..calc.end_elem(peer.id());
        for round in 0..ROUNDS {
            step(mesh.local_mut(), range.clone());
            mesh.update(FoldOwned {
                worker: peer.id() as u64,
                workers: peer.num_workers() as u64,
            });
            checkpoint(&peer, 9000);
            mesh.update(Noop);
            checkpoint(&peer, 9000);

            if peer.id() == 0 {
                let x = mesh.local().array::<f64>("x");
                let spread = x.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
                println!("round {}: max |x| = {:.6}", round, spread);
            }
        }
    })
    .expect("failed to start workers");

    for result in guards.join() {
        result.expect("worker failed");
    }
}

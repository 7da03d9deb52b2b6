//! Configuration and startup for the communication infrastructure.

#[cfg(feature = "getopts")]
use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use tracing::info;

use crate::net::{initialize_networking, Network};
use crate::process::Process;
use crate::rpc::{Request, Rpc, Tag};

/// Possible configurations for the communication infrastructure.
#[derive(Clone, Debug)]
pub enum Config {
    /// Use one process with an indicated number of thread-backed peers.
    Process(usize),
    /// Expect multiple processes, one peer each.
    Cluster {
        /// Identity of this process
        process: usize,
        /// Addresses of all processes
        addresses: Vec<String>,
        /// Verbosely report connection process
        report: bool,
    },
}

impl Config {
    /// Installs options into a [`getopts::Options`] struct that corresponds
    /// to the parameters in the configuration.
    ///
    /// It is the caller's responsibility to ensure that the installed options
    /// do not conflict with any other options that may exist in `opts`, or
    /// that may be installed into `opts` in the future.
    ///
    /// This method is only available if the `getopts` feature is enabled,
    /// which it is by default.
    #[cfg(feature = "getopts")]
    pub fn install_options(opts: &mut getopts::Options) {
        opts.optopt("w", "workers", "number of in-process peers", "NUM");
        opts.optopt("p", "process", "identity of this process", "IDX");
        opts.optopt("n", "processes", "number of processes", "NUM");
        opts.optopt("h", "hostfile", "text file whose lines are process addresses", "FILE");
        opts.optflag("r", "report", "reports connection progress");
    }

    /// Instantiates a configuration based upon the parsed options in
    /// `matches`.
    ///
    /// The `matches` object must have been constructed from a
    /// [`getopts::Options`] which contained at least the options installed
    /// by [`Self::install_options`].
    ///
    /// This method is only available if the `getopts` feature is enabled,
    /// which it is by default.
    #[cfg(feature = "getopts")]
    pub fn from_matches(matches: &getopts::Matches) -> Result<Config, String> {
        let workers = matches.opt_get_default("w", 1_usize).map_err(|e| e.to_string())?;
        let process = matches.opt_get_default("p", 0_usize).map_err(|e| e.to_string())?;
        let processes = matches.opt_get_default("n", 1_usize).map_err(|e| e.to_string())?;
        let report = matches.opt_present("report");

        if processes > 1 {
            let mut addresses = Vec::new();
            if let Some(hosts) = matches.opt_str("h") {
                let file = ::std::fs::File::open(hosts.clone()).map_err(|e| e.to_string())?;
                let reader = ::std::io::BufReader::new(file);
                for line in reader.lines().take(processes) {
                    addresses.push(line.map_err(|e| e.to_string())?);
                }
                if addresses.len() < processes {
                    return Err(format!(
                        "could only read {} addresses from {}, but -n: {}",
                        addresses.len(),
                        hosts,
                        processes
                    ));
                }
            } else {
                for index in 0..processes {
                    addresses.push(format!("localhost:{}", 2101 + index));
                }
            }

            assert_eq!(processes, addresses.len());
            Ok(Config::Cluster {
                process,
                addresses,
                report,
            })
        } else {
            Ok(Config::Process(workers))
        }
    }

    /// Constructs a new configuration by parsing the supplied text arguments.
    ///
    /// Most commonly, callers supply `std::env::args()` as the iterator.
    ///
    /// This method is only available if the `getopts` feature is enabled,
    /// which it is by default.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Config, String> {
        let mut opts = getopts::Options::new();
        Config::install_options(&mut opts);
        let matches = opts.parse(args).map_err(|e| e.to_string())?;
        Config::from_matches(&matches)
    }
}

/// A peer of whichever backend the configuration selected.
#[derive(Clone)]
pub enum Generic {
    Process(Process),
    Cluster(Network),
}

impl Rpc for Generic {
    fn send_data(&self, dst: usize, tag: Tag, data: &[u8]) -> Box<dyn Request> {
        match self {
            Generic::Process(p) => p.send_data(dst, tag, data),
            Generic::Cluster(n) => n.send_data(dst, tag, data),
        }
    }

    fn recv_data(&self, src: Option<usize>, tag: Option<Tag>, buf: &mut [u8]) -> (usize, Tag) {
        match self {
            Generic::Process(p) => p.recv_data(src, tag, buf),
            Generic::Cluster(n) => n.recv_data(src, tag, buf),
        }
    }

    fn poll(&self, src: Option<usize>, tag: Option<Tag>) -> bool {
        match self {
            Generic::Process(p) => p.poll(src, tag),
            Generic::Cluster(n) => n.poll(src, tag),
        }
    }

    fn first(&self) -> usize {
        match self {
            Generic::Process(p) => p.first(),
            Generic::Cluster(n) => n.first(),
        }
    }

    fn last(&self) -> usize {
        match self {
            Generic::Process(p) => p.last(),
            Generic::Cluster(n) => n.last(),
        }
    }

    fn id(&self) -> usize {
        match self {
            Generic::Process(p) => p.id(),
            Generic::Cluster(n) => n.id(),
        }
    }
}

/// Initializes communication and executes a collective computation.
///
/// This method constructs one peer per local worker, spawns a thread for
/// each, and invokes the supplied function with the peer handle. The method
/// returns a `WorkerGuards<T>` which can be `join`ed to retrieve the return
/// values of the workers.
///
/// # Examples
/// ```
/// use synchromesh_communication::{initialize, Config, Request, Rpc};
///
/// let guards = initialize(Config::Process(2), |peer| {
///     peer.send_data((peer.id() + 1) % 2, 100, &[peer.id() as u8]).wait();
///     let mut buf = [0u8; 1];
///     let (src, _) = peer.recv_data(None, Some(100), &mut buf);
///     (src, buf[0])
/// });
///
/// for result in guards.unwrap().join() {
///     let (src, byte) = result.unwrap();
///     assert_eq!(src as u8, byte);
/// }
/// ```
pub fn initialize<T, F>(config: Config, func: F) -> Result<WorkerGuards<T>, String>
where
    T: Send + 'static,
    F: Fn(Generic) -> T + Send + Sync + 'static,
{
    let peers = match config {
        Config::Process(workers) => {
            if workers == 0 {
                return Err("at least one worker required".to_string());
            }
            Process::new_vector(workers)
                .into_iter()
                .map(Generic::Process)
                .collect()
        }
        Config::Cluster {
            process,
            addresses,
            report,
        } => {
            if process >= addresses.len() {
                return Err(format!("process {} not in the address list", process));
            }
            let network = initialize_networking(addresses, process, report)
                .map_err(|err| format!("failed to initialize networking: {}", err))?;
            info!(process, "networking established");
            vec![Generic::Cluster(network)]
        }
    };

    let logic = Arc::new(func);
    let mut guards = Vec::with_capacity(peers.len());
    for peer in peers {
        let clone = Arc::clone(&logic);
        let index = peer.id();
        guards.push(
            thread::Builder::new()
                .name(format!("synchromesh:work-{}", index))
                .spawn(move || (*clone)(peer))
                .map_err(|e| format!("{:?}", e))?,
        );
    }

    Ok(WorkerGuards { guards })
}

/// Maintains `JoinHandle`s for worker threads.
pub struct WorkerGuards<T: Send + 'static> {
    guards: Vec<thread::JoinHandle<T>>,
}

impl<T: Send + 'static> WorkerGuards<T> {
    /// Returns a reference to the indexed guard.
    pub fn guards(&self) -> &[thread::JoinHandle<T>] {
        &self.guards[..]
    }

    /// Waits on the worker threads and returns the results they produce.
    pub fn join(mut self) -> Vec<Result<T, String>> {
        self.guards
            .drain(..)
            .map(|guard| guard.join().map_err(|e| format!("{:?}", e)))
            .collect()
    }
}

impl<T: Send + 'static> Drop for WorkerGuards<T> {
    fn drop(&mut self) {
        for guard in self.guards.drain(..) {
            guard.join().expect("Worker panic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_config_runs_workers() {
        let guards = initialize(Config::Process(3), |peer| peer.id()).unwrap();
        let mut ids: Vec<usize> = guards.join().into_iter().map(|r| r.unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn zero_workers_is_an_error() {
        assert!(initialize(Config::Process(0), |_peer| ()).is_err());
    }

    #[cfg(feature = "getopts")]
    #[test]
    fn args_select_process_mode() {
        let args = ["-w", "4"].iter().map(|s| s.to_string());
        match Config::from_args(args).unwrap() {
            Config::Process(workers) => assert_eq!(workers, 4),
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[cfg(feature = "getopts")]
    #[test]
    fn args_select_cluster_mode_with_default_addresses() {
        let args = ["-n", "3", "-p", "1"].iter().map(|s| s.to_string());
        match Config::from_args(args).unwrap() {
            Config::Cluster {
                process, addresses, ..
            } => {
                assert_eq!(process, 1);
                assert_eq!(addresses.len(), 3);
                assert_eq!(addresses[0], "localhost:2101");
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }
}

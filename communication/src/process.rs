//! An in-process transport: every peer is a thread, messages move through
//! shared mailboxes.
//!
//! This backend exists to run collective code on one machine, tests
//! included. Sends complete immediately (the payload is copied straight
//! into the destination mailbox), so the returned requests are already
//! done.

use std::sync::Arc;
use std::thread;

use tracing::trace;

use crate::mailbox::Mailboxes;
use crate::rpc::{CompleteRequest, Request, Rpc, Tag};

/// One peer of an in-process mesh.
///
/// Cheap to clone; clones address the same peer, which lets a worker hand a
/// handle to its background tasks.
#[derive(Clone)]
pub struct Process {
    index: usize,
    mailboxes: Arc<Vec<Mailboxes>>,
}

impl Process {
    /// Allocates a mesh of `count` connected peers.
    pub fn new_vector(count: usize) -> Vec<Process> {
        assert!(count > 0, "a mesh needs at least one peer");
        let mailboxes = Arc::new((0..count).map(|_| Mailboxes::new(count)).collect::<Vec<_>>());
        (0..count)
            .map(|index| Process {
                index,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }

    /// Constructs `count` peers, invokes `logic` on each from its own
    /// thread, and joins them all before returning.
    pub fn run<F>(count: usize, logic: F)
    where
        F: Fn(Process) + Send + Sync + 'static,
    {
        let logic = Arc::new(logic);
        let mut guards = Vec::with_capacity(count);
        for peer in Self::new_vector(count) {
            let logic = Arc::clone(&logic);
            guards.push(
                thread::Builder::new()
                    .name(format!("synchromesh:work-{}", peer.index))
                    .spawn(move || logic(peer))
                    .expect("failed to spawn peer thread"),
            );
        }
        for guard in guards {
            guard.join().expect("Worker panic");
        }
    }
}

impl Rpc for Process {
    fn send_data(&self, dst: usize, tag: Tag, data: &[u8]) -> Box<dyn Request> {
        assert!(dst < self.mailboxes.len(), "destination {} out of range", dst);
        trace!(src = self.index, dst, tag, bytes = data.len(), "send");
        self.mailboxes[dst].push(self.index, tag, data.to_vec());
        Box::new(CompleteRequest)
    }

    fn recv_data(&self, src: Option<usize>, tag: Option<Tag>, buf: &mut [u8]) -> (usize, Tag) {
        if let Some(s) = src {
            assert!(s < self.mailboxes.len(), "source {} out of range", s);
        }
        let (s, t, payload) = self.mailboxes[self.index].recv(src, tag);
        assert_eq!(
            payload.len(),
            buf.len(),
            "length mismatch receiving from {} tag {}",
            s,
            t
        );
        buf.copy_from_slice(&payload);
        trace!(src = s, dst = self.index, tag = t, bytes = buf.len(), "recv");
        (s, t)
    }

    fn poll(&self, src: Option<usize>, tag: Option<Tag>) -> bool {
        self.mailboxes[self.index].poll(src, tag)
    }

    fn first(&self) -> usize {
        0
    }

    fn last(&self) -> usize {
        self.mailboxes.len() - 1
    }

    fn id(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn self_send_round_trip() {
        let peers = Process::new_vector(1);
        let peer = &peers[0];
        let mut req = peer.send_data(0, 42, b"hello");
        assert!(req.done());
        req.wait();
        let mut buf = [0u8; 5];
        let (src, tag) = peer.recv_data(Some(0), Some(42), &mut buf);
        assert_eq!((src, tag), (0, 42));
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn peer_identities() {
        let peers = Process::new_vector(3);
        for (i, peer) in peers.iter().enumerate() {
            assert_eq!(peer.id(), i);
            assert_eq!(peer.first(), 0);
            assert_eq!(peer.last(), 2);
            assert_eq!(peer.num_workers(), 3);
        }
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn length_mismatch_is_fatal() {
        let peers = Process::new_vector(1);
        peers[0].send_data(0, 1, &[1, 2, 3]);
        let mut buf = [0u8; 2];
        peers[0].recv_data(Some(0), Some(1), &mut buf);
    }

    #[test]
    fn run_joins_every_peer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        Process::run(4, move |peer| {
            // everyone tells peer 0 who they are
            peer.send_data(0, 10, &[peer.id() as u8]);
            if peer.id() == 0 {
                let mut ids = Vec::new();
                for _ in 0..peer.num_workers() {
                    let mut buf = [0u8; 1];
                    peer.recv_data(None, Some(10), &mut buf);
                    ids.push(buf[0]);
                }
                record.lock().unwrap().extend(ids);
            }
        });
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}

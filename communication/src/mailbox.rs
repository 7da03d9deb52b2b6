//! Per-peer queues of undelivered messages, shared by both backends.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex};

use crate::rpc::Tag;

type TagQueues = BTreeMap<Tag, VecDeque<Vec<u8>>>;

/// Undelivered messages for one peer, keyed by source and tag.
///
/// Wildcard matching scans sources in index order and tags in ascending
/// order. The scan is deterministic but not fair; a chatty low-indexed peer
/// can shadow a quiet high-indexed one.
pub(crate) struct Mailboxes {
    queues: Mutex<Vec<TagQueues>>,
    arrived: Condvar,
}

impl Mailboxes {
    pub fn new(num_peers: usize) -> Self {
        Mailboxes {
            queues: Mutex::new((0..num_peers).map(|_| TagQueues::new()).collect()),
            arrived: Condvar::new(),
        }
    }

    pub fn push(&self, src: usize, tag: Tag, payload: Vec<u8>) {
        let mut queues = self.queues.lock().unwrap();
        queues[src].entry(tag).or_default().push_back(payload);
        self.arrived.notify_all();
    }

    /// True iff a message matching `src` and `tag` is queued. Takes the
    /// lock, but never waits for a message.
    pub fn poll(&self, src: Option<usize>, tag: Option<Tag>) -> bool {
        let queues = self.queues.lock().unwrap();
        Self::find(&queues, src, tag).is_some()
    }

    /// Blocks until a matching message is queued, then dequeues it. The
    /// concrete source and tag are chosen under the same lock as the
    /// dequeue.
    pub fn recv(&self, src: Option<usize>, tag: Option<Tag>) -> (usize, Tag, Vec<u8>) {
        let mut queues = self.queues.lock().unwrap();
        loop {
            if let Some((s, t)) = Self::find(&queues, src, tag) {
                let queue = queues[s].get_mut(&t).unwrap();
                let payload = queue.pop_front().unwrap();
                if queue.is_empty() {
                    queues[s].remove(&t);
                }
                return (s, t, payload);
            }
            queues = self.arrived.wait(queues).unwrap();
        }
    }

    fn find(queues: &[TagQueues], src: Option<usize>, tag: Option<Tag>) -> Option<(usize, Tag)> {
        let sources = match src {
            Some(s) => s..s + 1,
            None => 0..queues.len(),
        };
        for s in sources {
            match tag {
                Some(t) => {
                    if queues[s].contains_key(&t) {
                        return Some((s, t));
                    }
                }
                None => {
                    if let Some((&t, _)) = queues[s].iter().next() {
                        return Some((s, t));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_stream() {
        let boxes = Mailboxes::new(2);
        boxes.push(1, 7, vec![1]);
        boxes.push(1, 7, vec![2]);
        boxes.push(1, 7, vec![3]);
        assert_eq!(boxes.recv(Some(1), Some(7)).2, vec![1]);
        assert_eq!(boxes.recv(Some(1), Some(7)).2, vec![2]);
        assert_eq!(boxes.recv(Some(1), Some(7)).2, vec![3]);
        assert!(!boxes.poll(Some(1), Some(7)));
    }

    #[test]
    fn wildcard_scans_sources_in_index_order() {
        let boxes = Mailboxes::new(3);
        boxes.push(2, 5, vec![2]);
        boxes.push(0, 5, vec![0]);
        let (src, tag, payload) = boxes.recv(None, Some(5));
        assert_eq!((src, tag, payload), (0, 5, vec![0]));
        let (src, _, _) = boxes.recv(None, Some(5));
        assert_eq!(src, 2);
    }

    #[test]
    fn wildcard_tag_takes_lowest() {
        let boxes = Mailboxes::new(1);
        boxes.push(0, 9, vec![9]);
        boxes.push(0, 3, vec![3]);
        let (_, tag, payload) = boxes.recv(Some(0), None);
        assert_eq!((tag, payload), (3, vec![3]));
    }

    #[test]
    fn poll_distinguishes_tags() {
        let boxes = Mailboxes::new(2);
        boxes.push(0, 1, vec![]);
        assert!(boxes.poll(Some(0), Some(1)));
        assert!(!boxes.poll(Some(0), Some(2)));
        assert!(!boxes.poll(Some(1), None));
        assert!(boxes.poll(None, None));
    }
}

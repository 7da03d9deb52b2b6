//! The transport contract every backend implements.

use smallvec::SmallVec;

/// A message tag. Together with the (source, destination) pair, a tag names
/// one FIFO stream of messages.
pub type Tag = u64;

/// A handle to an in-flight transfer.
///
/// `done` must never block; `wait` returns once the underlying transfer has
/// completed. Both are idempotent, and both may be called in any order.
pub trait Request: Send {
    /// True iff the transfer has completed. Never blocks.
    fn done(&mut self) -> bool;
    /// Blocks until the transfer has completed.
    fn wait(&mut self);
}

/// A request whose transfer completed before `send_data` returned.
pub struct CompleteRequest;

impl Request for CompleteRequest {
    fn done(&mut self) -> bool {
        true
    }
    fn wait(&mut self) {}
}

/// A batch of requests: complete exactly when every member is.
///
/// Sub-requests are waited in the order they were added; no ordering is
/// imposed on their actual completions.
#[derive(Default)]
pub struct RequestGroup {
    reqs: SmallVec<[Box<dyn Request>; 8]>,
}

impl RequestGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, req: Box<dyn Request>) {
        self.reqs.push(req);
    }

    /// Absorbs every sub-request of `other`, preserving order.
    pub fn merge(&mut self, mut other: RequestGroup) {
        self.reqs.extend(other.reqs.drain(..));
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }
}

impl Request for RequestGroup {
    fn done(&mut self) -> bool {
        self.reqs.iter_mut().all(|r| r.done())
    }

    fn wait(&mut self) {
        for req in self.reqs.iter_mut() {
            req.wait();
        }
    }
}

/// Tagged point-to-point byte transport over a fixed set of peers.
///
/// Peers are indexed contiguously over `[first(), last()]`. Passing `None`
/// as a source or tag matches any peer or any tag. Delivery is FIFO per
/// `(source, destination, tag)` stream; nothing is guaranteed across
/// streams.
///
/// Transport failures are fatal. The runtime is a tightly coupled
/// collective: there is no retry and no partial-delivery state, so every
/// error panics where it is detected.
pub trait Rpc: Send + Sync {
    /// Enqueues `data` for delivery to `dst` under `tag`.
    ///
    /// The buffer contents are captured before the call returns; the caller
    /// may reuse the buffer immediately. Completion is observed through the
    /// returned request.
    fn send_data(&self, dst: usize, tag: Tag, data: &[u8]) -> Box<dyn Request>;

    /// Blocks until a message of exactly `buf.len()` bytes matching `src`
    /// and `tag` arrives, copying it into `buf`.
    ///
    /// The concrete source and tag are chosen atomically with the dequeue
    /// and returned. A length mismatch between the queued message and `buf`
    /// panics.
    fn recv_data(&self, src: Option<usize>, tag: Option<Tag>, buf: &mut [u8]) -> (usize, Tag);

    /// True iff a message matching `src` and `tag` is queued. Never blocks.
    fn poll(&self, src: Option<usize>, tag: Option<Tag>) -> bool;

    /// The lowest peer id.
    fn first(&self) -> usize;
    /// The highest peer id.
    fn last(&self) -> usize;
    /// The id of this peer.
    fn id(&self) -> usize;

    fn num_workers(&self) -> usize {
        self.last() - self.first() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlagRequest {
        remaining: usize,
    }

    impl Request for FlagRequest {
        fn done(&mut self) -> bool {
            self.remaining == 0
        }
        fn wait(&mut self) {
            self.remaining = 0;
        }
    }

    #[test]
    fn group_completes_with_members() {
        let mut group = RequestGroup::new();
        group.add(Box::new(CompleteRequest));
        group.add(Box::new(FlagRequest { remaining: 1 }));
        assert!(!group.done());
        group.wait();
        assert!(group.done());
        // a second wait is a no-op
        group.wait();
        assert!(group.done());
    }

    #[test]
    fn empty_group_is_done() {
        let mut group = RequestGroup::new();
        assert!(group.is_empty());
        assert!(group.done());
        group.wait();
    }

    #[test]
    fn merge_preserves_members() {
        let mut a = RequestGroup::new();
        a.add(Box::new(CompleteRequest));
        let mut b = RequestGroup::new();
        b.add(Box::new(FlagRequest { remaining: 1 }));
        b.add(Box::new(CompleteRequest));
        a.merge(b);
        assert_eq!(a.len(), 3);
        assert!(!a.done());
        a.wait();
        assert!(a.done());
    }
}

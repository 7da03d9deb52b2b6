//! Group-aware communication strategies.
//!
//! A strategy turns one logical send or receive of a marshalled value into
//! concrete point-to-point transfers over a peer group. Fan-out replays the
//! same tag sequence toward every member, so each destination observes the
//! tags a point-to-point transfer would have used; the caller's sequence
//! advances once.

use std::thread;

use synchromesh_communication::group::ProcessGroup;
use synchromesh_communication::rpc::{RequestGroup, Rpc};

use crate::marshal::{TagSeq, Value};

/// How a value travels between one peer and a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommStrategy {
    /// Send a full copy to every member. Receiving is a user-level
    /// reduction and is not provided.
    All,
    /// Receive from whichever member is ready first, polling in group
    /// order. Sending needs a destination and is not provided.
    Any,
    /// Send to or receive from one fixed peer.
    One(usize),
    /// Scatter shards across the members, or gather them back. Member `i`
    /// always holds shard `i`; self-fragments traverse the transport like
    /// any other.
    Sharded,
}

impl CommStrategy {
    /// Sends `value` over `group`. Returns the aggregate request.
    pub fn send(
        &self,
        value: &Value,
        rpc: &dyn Rpc,
        group: &ProcessGroup,
        tags: &mut TagSeq,
    ) -> RequestGroup {
        match *self {
            CommStrategy::All => {
                let base = *tags;
                let mut after = base;
                let mut reqs = RequestGroup::new();
                for dst in group.iter() {
                    let mut replay = base;
                    reqs.merge(value.send(rpc, dst, &mut replay));
                    after = replay;
                }
                *tags = after;
                reqs
            }
            CommStrategy::Any => {
                panic!("the any strategy cannot send; pick a destination")
            }
            CommStrategy::One(dst) => value.send(rpc, dst, tags),
            CommStrategy::Sharded => {
                let sharded = value.as_sharded();
                let base = *tags;
                let mut after = base;
                let mut reqs = RequestGroup::new();
                for (slot, dst) in group.iter().enumerate() {
                    let mut replay = base;
                    reqs.merge(sharded.send_fragment(rpc, dst, group.count(), slot, &mut replay));
                    after = replay;
                }
                *tags = after;
                reqs
            }
        }
    }

    /// Receives into `value` from `group`, returning the concrete source
    /// (for sharded gathers, the last member).
    pub fn recv(
        &self,
        value: &mut Value,
        rpc: &dyn Rpc,
        group: &ProcessGroup,
        tags: &mut TagSeq,
    ) -> usize {
        match *self {
            CommStrategy::All => {
                panic!("receiving on the all strategy is not implemented; reduce at the caller")
            }
            CommStrategy::Any => {
                let src = loop {
                    let ready = group.iter().find(|&peer| rpc.poll(Some(peer), Some(tags.peek())));
                    match ready {
                        Some(peer) => break peer,
                        None => thread::yield_now(),
                    }
                };
                value.recv(rpc, src, tags);
                src
            }
            CommStrategy::One(src) => {
                value.recv(rpc, src, tags);
                src
            }
            CommStrategy::Sharded => {
                let sharded = value.as_sharded_mut();
                let base = *tags;
                let mut after = base;
                let mut last = group.member(0);
                for (slot, src) in group.iter().enumerate() {
                    let mut replay = base;
                    sharded.recv_fragment(rpc, src, group.count(), slot, &mut replay);
                    after = replay;
                    last = src;
                }
                *tags = after;
                last
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::TagSeq;
    use crate::testing::bootstrap_for_tests;
    use std::sync::{Arc, Mutex};
    use synchromesh_communication::{Endpoint, Process, Request};

    #[test]
    fn one_is_a_self_trip_on_a_singleton_group() {
        bootstrap_for_tests();
        let peer = Process::new_vector(1).remove(0);
        let ep = Endpoint::new(ProcessGroup::range(0, 0), 3000);

        let value = Value::seq(&[5_u32, 6, 7]);
        let mut tags = TagSeq::new(ep.tag());
        CommStrategy::One(0).send(&value, &peer, ep.group(), &mut tags).wait();

        let mut out = Value::seq::<u32>(&[]);
        let mut tags = TagSeq::new(ep.tag());
        let src = CommStrategy::One(0).recv(&mut out, &peer, ep.group(), &mut tags);
        assert_eq!(src, 0);
        assert_eq!(out.as_slice::<u32>(), &[5, 6, 7]);
    }

    #[test]
    fn all_replays_the_same_tags_to_each_member() {
        bootstrap_for_tests();
        let peers = Process::new_vector(3);
        let group = ProcessGroup::range(0, 2);

        let value = Value::seq(&[1.0_f64, 2.0]);
        let mut tags = TagSeq::new(3100);
        CommStrategy::All.send(&value, &peers[0], &group, &mut tags).wait();
        // one count word and one payload, regardless of fan-out
        assert_eq!(tags.peek(), 3102);

        for peer in &peers {
            let mut out = Value::seq::<f64>(&[]);
            let mut tags = TagSeq::new(3100);
            let src = CommStrategy::One(0).recv(&mut out, peer, &group, &mut tags);
            assert_eq!(src, 0);
            assert_eq!(out.as_slice::<f64>(), &[1.0, 2.0]);
        }
    }

    #[test]
    fn sharded_scatter_gather_reconstructs_the_array() {
        bootstrap_for_tests();
        let data: Vec<i32> = (0..100).collect();
        let expected = data.clone();
        let gathered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&gathered);

        Process::run(4, move |peer| {
            let group = ProcessGroup::all(&peer);
            if peer.id() == 0 {
                let value = Value::sharded(&data);
                let mut tags = TagSeq::new(3200);
                CommStrategy::Sharded.send(&value, &peer, &group, &mut tags).wait();
                assert_eq!(tags.peek(), 3202);
            }
            // every member, peer 0 included, holds one fragment
            let mut mine = Value::sharded(&vec![0_i32; 100]);
            let slot = peer.id();
            let mut tags = TagSeq::new(3200);
            mine.as_sharded_mut().recv_fragment(&peer, 0, 4, slot, &mut tags);

            // members return their fragments to peer 0, which reassembles
            let fragment = Value::seq(&mine.as_slice::<i32>()[slot * 25..(slot + 1) * 25]);
            let mut tags = TagSeq::new(3300);
            CommStrategy::One(0).send(&fragment, &peer, &group, &mut tags).wait();
            if peer.id() == 0 {
                let mut whole = vec![0_i32; 100];
                for src in group.iter() {
                    let mut part = Value::seq::<i32>(&[]);
                    let mut tags = TagSeq::new(3300);
                    part.recv(&peer, src, &mut tags);
                    whole[src * 25..(src + 1) * 25].copy_from_slice(part.as_slice::<i32>());
                }
                sink.lock().unwrap().extend(whole);
            }
        });

        assert_eq!(&*gathered.lock().unwrap(), &expected);
    }

    #[test]
    fn any_receives_from_a_ready_member() {
        bootstrap_for_tests();
        let done = Arc::new(Mutex::new(0_usize));
        let sum = Arc::clone(&done);
        Process::run(3, move |peer| {
            let group = ProcessGroup::all(&peer);
            if peer.id() == 2 {
                let value = Value::pod(41_u64);
                let mut tags = TagSeq::new(3400);
                CommStrategy::One(0).send(&value, &peer, &group, &mut tags).wait();
            }
            if peer.id() == 0 {
                let mut out = Value::pod(0_u64);
                let mut tags = TagSeq::new(3400);
                let src = CommStrategy::Any.recv(&mut out, &peer, &group, &mut tags);
                assert_eq!(src, 2);
                *sum.lock().unwrap() += out.get::<u64>() as usize;
            }
        });
        assert_eq!(*done.lock().unwrap(), 41);
    }

    #[test]
    #[should_panic(expected = "cannot send")]
    fn any_send_is_unimplemented() {
        bootstrap_for_tests();
        let peer = Process::new_vector(1).remove(0);
        let group = ProcessGroup::range(0, 0);
        let value = Value::pod(0_u8);
        CommStrategy::Any.send(&value, &peer, &group, &mut TagSeq::new(1));
    }

    #[test]
    #[should_panic(expected = "not implemented")]
    fn all_recv_is_unimplemented() {
        bootstrap_for_tests();
        let peer = Process::new_vector(1).remove(0);
        let group = ProcessGroup::range(0, 0);
        let mut value = Value::pod(0_u8);
        CommStrategy::All.recv(&mut value, &peer, &group, &mut TagSeq::new(1));
    }

    #[test]
    #[should_panic(expected = "sharding scalar values is not supported")]
    fn sharding_a_scalar_is_unimplemented() {
        bootstrap_for_tests();
        let peer = Process::new_vector(1).remove(0);
        let group = ProcessGroup::range(0, 0);
        let value = Value::pod(0_u8);
        CommStrategy::Sharded.send(&value, &peer, &group, &mut TagSeq::new(1));
    }
}

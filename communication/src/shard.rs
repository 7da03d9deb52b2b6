//! Deterministic partitioning of contiguous elements across workers.

/// Splits `num_elems` elements of `elem_size` bytes into one contiguous
/// shard per worker.
///
/// Every worker takes `num_elems / num_workers` elements; the last worker
/// absorbs the remainder. Shards are disjoint and cover the whole range, so
/// every peer computing the same `ShardCalc` agrees on the partition.
#[derive(Clone, Copy, Debug)]
pub struct ShardCalc {
    elements: usize,
    elem_size: usize,
    workers: usize,
}

impl ShardCalc {
    pub fn new(num_elems: usize, elem_size: usize, num_workers: usize) -> Self {
        assert!(num_workers >= 1, "cannot shard across zero workers");
        ShardCalc {
            elements: num_elems,
            elem_size,
            workers: num_workers,
        }
    }

    pub fn start_elem(&self, worker: usize) -> usize {
        assert!(worker < self.workers, "worker {} out of range", worker);
        (worker * (self.elements / self.workers)).min(self.elements)
    }

    pub fn end_elem(&self, worker: usize) -> usize {
        assert!(worker < self.workers, "worker {} out of range", worker);
        if worker == self.workers - 1 {
            self.elements
        } else {
            ((worker + 1) * (self.elements / self.workers)).min(self.elements)
        }
    }

    pub fn num_elems(&self, worker: usize) -> usize {
        self.end_elem(worker) - self.start_elem(worker)
    }

    pub fn start_byte(&self, worker: usize) -> usize {
        self.start_elem(worker) * self.elem_size
    }

    pub fn end_byte(&self, worker: usize) -> usize {
        self.end_elem(worker) * self.elem_size
    }

    pub fn num_bytes(&self, worker: usize) -> usize {
        self.num_elems(worker) * self.elem_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn even_split() {
        let calc = ShardCalc::new(100, 4, 4);
        for w in 0..4 {
            assert_eq!(calc.start_elem(w), w * 25);
            assert_eq!(calc.end_elem(w), (w + 1) * 25);
            assert_eq!(calc.num_elems(w), 25);
            assert_eq!(calc.num_bytes(w), 100);
        }
    }

    #[test]
    fn last_worker_absorbs_remainder() {
        let calc = ShardCalc::new(100, 4, 7);
        for w in 0..6 {
            assert_eq!(calc.num_elems(w), 14);
        }
        assert_eq!(calc.num_elems(6), 16);
        assert_eq!(calc.end_elem(6), 100);
    }

    #[test]
    fn single_worker_owns_everything() {
        let calc = ShardCalc::new(33, 8, 1);
        assert_eq!(calc.start_elem(0), 0);
        assert_eq!(calc.end_elem(0), 33);
        assert_eq!(calc.num_bytes(0), 264);
    }

    #[test]
    fn fewer_elements_than_workers() {
        // per-worker quota rounds down to zero, so the last worker owns all
        let calc = ShardCalc::new(3, 4, 8);
        for w in 0..7 {
            assert_eq!(calc.num_elems(w), 0);
        }
        assert_eq!(calc.num_elems(7), 3);
    }

    #[test]
    fn empty_range() {
        let calc = ShardCalc::new(0, 4, 3);
        for w in 0..3 {
            assert_eq!(calc.num_elems(w), 0);
            assert_eq!(calc.start_elem(w), 0);
        }
    }

    #[test]
    #[should_panic(expected = "zero workers")]
    fn zero_workers_rejected() {
        ShardCalc::new(10, 4, 0);
    }

    proptest! {
        #[test]
        fn shards_cover_range_disjointly(n in 0usize..10_000, k in 1usize..64) {
            let calc = ShardCalc::new(n, 8, k);
            let mut covered = 0;
            for w in 0..k {
                prop_assert!(calc.start_elem(w) <= calc.end_elem(w));
                prop_assert!(calc.end_elem(w) <= n);
                // contiguous with the previous shard
                if w > 0 {
                    prop_assert_eq!(calc.start_elem(w), calc.end_elem(w - 1));
                }
                covered += calc.num_elems(w);
            }
            prop_assert_eq!(covered, n);
        }

        #[test]
        fn remainder_concentrates_on_last_worker(n in 0usize..10_000, k in 1usize..64) {
            let calc = ShardCalc::new(n, 8, k);
            let quota = n / k;
            for w in 0..k - 1 {
                prop_assert_eq!(calc.num_elems(w), quota);
            }
            prop_assert_eq!(calc.num_elems(k - 1), n - quota * (k - 1));
        }
    }
}

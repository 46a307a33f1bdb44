//! Typed free-lists for hot-path objects.
//!
//! A pool is an unbounded multi-producer/multi-consumer bag with no fairness
//! and no retention guarantee. `get` hands back a previously stored item or
//! nothing; call sites construct a fresh item on a miss, so correctness never
//! depends on the hit rate.

use crossbeam::queue::SegQueue;

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct Pool<T> {
    bag: SegQueue<T>,

    #[cfg(test)]
    starved: AtomicBool,
}

impl<T> Pool<T> {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            bag: SegQueue::new(),

            #[cfg(test)]
            starved: AtomicBool::new(false),
        }
    }

    /// Returns a previously stored item, if any survived.
    #[inline(always)]
    pub(crate) fn get(&self) -> Option<T> {
        #[cfg(test)]
        if self.starved.load(Ordering::Relaxed) {
            return None;
        }

        self.bag.pop()
    }

    /// Makes `item` eligible for reuse. The caller must have reset it.
    #[inline(always)]
    pub(crate) fn put(&self, item: T) {
        #[cfg(test)]
        if self.starved.load(Ordering::Relaxed) {
            return;
        }

        self.bag.push(item);
    }

    /// Forces every subsequent `get` to miss. Exercises the
    /// fresh-item-per-request path.
    #[cfg(test)]
    pub(crate) fn starve(&self) {
        self.starved.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    #[test]
    fn get_put_roundtrip() {
        let pool: Pool<Vec<u8>> = Pool::new();

        assert_eq!(pool.get(), None);

        pool.put(vec![1, 2, 3]);
        pool.put(vec![4]);

        let mut seen = vec![pool.get().unwrap(), pool.get().unwrap()];
        seen.sort();
        assert_eq!(seen, [vec![1, 2, 3], vec![4]]);
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn starved_pool_always_misses() {
        let pool: Pool<Vec<u8>> = Pool::new();
        pool.starve();

        pool.put(vec![1]);
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn concurrent_get_put() {
        use std::sync::Arc;

        let pool: Arc<Pool<usize>> = Arc::new(Pool::new());
        let mut tasks = Vec::new();

        for n in 0..8 {
            let pool = pool.clone();
            tasks.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    pool.put(n * 1000 + i);
                    pool.get();
                }
            }));
        }
        for task in tasks {
            task.join().unwrap();
        }
    }
}

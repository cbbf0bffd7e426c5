//! Bounded least-recently-used cache over a preallocated node arena.
//!
//! Every node lives in a fixed slot arena and is threaded onto exactly one of
//! two singly-linked index lists: `free` (unused) or `active`
//! (most-recently-used first). Lookup walks the active list comparing the
//! 64-bit hash first and the full key only on a hash match, promotes hits to
//! the head, and on a miss recycles a free node or evicts the oldest
//! evictable one. No allocation happens after construction.
//!
//! Specialization is supplied per call through [`CachePolicy`], which carries
//! whatever context (backend handles, guest memory) construction and
//! destruction need. Policies must not re-enter the cache they were invoked
//! from.

/// Handle to a slot in the cache arena. Stable for the lifetime of the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHandle(u32);

/// Lifecycle hooks for one cache specialization.
pub trait CachePolicy<T> {
    type Key;

    /// Full key comparison, called only when the 64-bit hashes match.
    fn matches(&self, payload: &T, key: &Self::Key) -> bool;

    /// Populate a recycled node for `key`. The expensive build (decode,
    /// compile, upload) happens here.
    fn construct(&mut self, payload: &mut T, key: &Self::Key);

    /// Release whatever `construct` acquired.
    fn destroy(&mut self, payload: &mut T);

    /// Eviction veto for resources still referenced outside the cache.
    /// The eviction scan skips vetoed nodes and tries the next-oldest.
    fn can_evict(&self, _payload: &T) -> bool {
        true
    }
}

/// Outcome of a [`Lru::lookup`], for callers that need to distinguish a
/// freshly constructed node from a reused one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    Hit,
    /// Miss served from the free list.
    Miss,
    /// Miss that had to evict the least recently used evictable node.
    MissEvicted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub collisions: u64,
}

struct Node<T> {
    hash: u64,
    next: Option<u32>,
    payload: T,
}

pub struct Lru<T> {
    nodes: Vec<Node<T>>,
    free_head: Option<u32>,
    active_head: Option<u32>,
    active_len: usize,
    stats: LruStats,
}

impl<T: Default> Lru<T> {
    /// Capacity must be at least 1; a cache that can hold nothing cannot
    /// satisfy `lookup` and is a configuration error.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "lru capacity must be >= 1");
        let mut nodes = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity {
                Some((i + 1) as u32)
            } else {
                None
            };
            nodes.push(Node {
                hash: 0,
                next,
                payload: T::default(),
            });
        }
        Lru {
            nodes,
            free_head: Some(0),
            active_head: None,
            active_len: 0,
            stats: LruStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn active_len(&self) -> usize {
        self.active_len
    }

    pub fn stats(&self) -> LruStats {
        self.stats
    }

    pub fn get(&self, handle: NodeHandle) -> &T {
        &self.nodes[handle.0 as usize].payload
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> &mut T {
        &mut self.nodes[handle.0 as usize].payload
    }

    /// Single entry point for hit and miss paths.
    ///
    /// `hash` must be derived from `key` alone; two keys differing in any
    /// bit must not be considered interchangeable even when hashes collide,
    /// which is what `CachePolicy::matches` guarantees.
    pub fn lookup<P: CachePolicy<T>>(
        &mut self,
        hash: u64,
        key: &P::Key,
        policy: &mut P,
    ) -> (NodeHandle, LookupOutcome) {
        // Walk active MRU-first, tracking the predecessor for the unlink.
        let mut prev: Option<u32> = None;
        let mut cur = self.active_head;
        while let Some(i) = cur {
            let node = &self.nodes[i as usize];
            if node.hash == hash {
                if policy.matches(&node.payload, key) {
                    self.stats.hits += 1;
                    if let Some(p) = prev {
                        // Unlink and promote. Already-head hits are a no-op.
                        self.nodes[p as usize].next = self.nodes[i as usize].next;
                        self.nodes[i as usize].next = self.active_head;
                        self.active_head = Some(i);
                    }
                    return (NodeHandle(i), LookupOutcome::Hit);
                }
                self.stats.collisions += 1;
            }
            prev = cur;
            cur = node.next;
        }

        self.stats.misses += 1;

        let (idx, outcome) = if let Some(f) = self.free_head {
            self.free_head = self.nodes[f as usize].next;
            (f, LookupOutcome::Miss)
        } else {
            let (evict_prev, evict_idx) = self
                .find_eviction_candidate(policy)
                .expect("lru: no evictable node");
            match evict_prev {
                Some(p) => self.nodes[p as usize].next = self.nodes[evict_idx as usize].next,
                None => self.active_head = self.nodes[evict_idx as usize].next,
            }
            self.active_len -= 1;
            self.stats.evictions += 1;
            policy.destroy(&mut self.nodes[evict_idx as usize].payload);
            (evict_idx, LookupOutcome::MissEvicted)
        };

        policy.construct(&mut self.nodes[idx as usize].payload, key);
        self.nodes[idx as usize].hash = hash;
        self.nodes[idx as usize].next = self.active_head;
        self.active_head = Some(idx);
        self.active_len += 1;
        (NodeHandle(idx), outcome)
    }

    /// Oldest active node whose eviction is not vetoed, with its
    /// predecessor. Scans the whole list; the last match is the least
    /// recently used candidate.
    fn find_eviction_candidate<P: CachePolicy<T>>(
        &self,
        policy: &P,
    ) -> Option<(Option<u32>, u32)> {
        let mut found: Option<(Option<u32>, u32)> = None;
        let mut prev: Option<u32> = None;
        let mut cur = self.active_head;
        while let Some(i) = cur {
            if policy.can_evict(&self.nodes[i as usize].payload) {
                found = Some((prev, i));
            }
            prev = cur;
            cur = self.nodes[i as usize].next;
        }
        found
    }

    /// Destroy every active entry the policy allows and return the nodes to
    /// the free list. Pinned entries stay active.
    pub fn flush<P: CachePolicy<T>>(&mut self, policy: &mut P) {
        let mut kept: Option<u32> = None;
        let mut kept_tail: Option<u32> = None;
        let mut cur = self.active_head;
        while let Some(i) = cur {
            cur = self.nodes[i as usize].next;
            if policy.can_evict(&self.nodes[i as usize].payload) {
                policy.destroy(&mut self.nodes[i as usize].payload);
                self.nodes[i as usize].next = self.free_head;
                self.free_head = Some(i);
                self.active_len -= 1;
            } else {
                self.nodes[i as usize].next = None;
                match kept_tail {
                    Some(t) => self.nodes[t as usize].next = Some(i),
                    None => kept = Some(i),
                }
                kept_tail = Some(i);
            }
        }
        self.active_head = kept;
    }

    /// Unlink one active node, destroy its payload, and return the slot to
    /// the free list. For backing out a construction that failed and must
    /// not keep occupying capacity.
    pub fn remove<P: CachePolicy<T>>(&mut self, handle: NodeHandle, policy: &mut P) {
        let mut prev: Option<u32> = None;
        let mut cur = self.active_head;
        while let Some(i) = cur {
            if i == handle.0 {
                match prev {
                    Some(p) => self.nodes[p as usize].next = self.nodes[i as usize].next,
                    None => self.active_head = self.nodes[i as usize].next,
                }
                policy.destroy(&mut self.nodes[i as usize].payload);
                self.nodes[i as usize].next = self.free_head;
                self.free_head = Some(i);
                self.active_len -= 1;
                return;
            }
            prev = cur;
            cur = self.nodes[i as usize].next;
        }
        panic!("lru: remove of a node that is not active");
    }

    /// Visit every active payload, oldest last. Used for out-of-band state
    /// like the texture cache's possibly-dirty marking.
    pub fn visit_active_mut(&mut self, mut f: impl FnMut(&mut T)) {
        let mut cur = self.active_head;
        while let Some(i) = cur {
            cur = self.nodes[i as usize].next;
            f(&mut self.nodes[i as usize].payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Entry {
        key: u32,
        live: bool,
        pinned: bool,
    }

    #[derive(Default)]
    struct TestPolicy {
        constructed: Vec<u32>,
        destroyed: Vec<u32>,
    }

    impl CachePolicy<Entry> for TestPolicy {
        type Key = u32;

        fn matches(&self, payload: &Entry, key: &u32) -> bool {
            payload.live && payload.key == *key
        }

        fn construct(&mut self, payload: &mut Entry, key: &u32) {
            payload.key = *key;
            payload.live = true;
            payload.pinned = false;
            self.constructed.push(*key);
        }

        fn destroy(&mut self, payload: &mut Entry) {
            self.destroyed.push(payload.key);
            payload.live = false;
        }

        fn can_evict(&self, payload: &Entry) -> bool {
            !payload.pinned
        }
    }

    fn hash_of(key: u32) -> u64 {
        crate::hash::content_hash(&key.to_le_bytes())
    }

    fn lookup(cache: &mut Lru<Entry>, policy: &mut TestPolicy, key: u32) -> LookupOutcome {
        cache.lookup(hash_of(key), &key, policy).1
    }

    #[test]
    fn capacity_two_scenario() {
        // A,B,A,C: miss, miss, hit (promoting A), miss evicting B.
        let mut cache = Lru::<Entry>::new(2);
        let mut p = TestPolicy::default();

        assert_eq!(lookup(&mut cache, &mut p, 0xa), LookupOutcome::Miss);
        assert_eq!(lookup(&mut cache, &mut p, 0xb), LookupOutcome::Miss);
        assert_eq!(lookup(&mut cache, &mut p, 0xa), LookupOutcome::Hit);
        assert_eq!(lookup(&mut cache, &mut p, 0xc), LookupOutcome::MissEvicted);

        assert_eq!(p.destroyed, vec![0xb]);
        // Active set is {C, A}.
        assert_eq!(lookup(&mut cache, &mut p, 0xa), LookupOutcome::Hit);
        assert_eq!(lookup(&mut cache, &mut p, 0xc), LookupOutcome::Hit);
        assert_eq!(cache.active_len(), 2);
    }

    #[test]
    fn repeated_lookup_is_idempotent() {
        let mut cache = Lru::<Entry>::new(4);
        let mut p = TestPolicy::default();

        let (h1, _) = cache.lookup(hash_of(7), &7, &mut p);
        let (h2, o2) = cache.lookup(hash_of(7), &7, &mut p);
        assert_eq!(h1, h2);
        assert_eq!(o2, LookupOutcome::Hit);
        assert_eq!(p.constructed, vec![7]);
        assert_eq!(p.destroyed, Vec::<u32>::new());
    }

    #[test]
    fn classic_eviction_order() {
        let mut cache = Lru::<Entry>::new(3);
        let mut p = TestPolicy::default();
        for k in 1..=3 {
            lookup(&mut cache, &mut p, k);
        }
        // k=4 evicts k=1.
        assert_eq!(lookup(&mut cache, &mut p, 4), LookupOutcome::MissEvicted);
        assert_eq!(p.destroyed, vec![1]);
    }

    #[test]
    fn pinned_tail_is_skipped() {
        let mut cache = Lru::<Entry>::new(3);
        let mut p = TestPolicy::default();
        let (h1, _) = cache.lookup(hash_of(1), &1, &mut p);
        lookup(&mut cache, &mut p, 2);
        lookup(&mut cache, &mut p, 3);

        cache.get_mut(h1).pinned = true;
        assert_eq!(lookup(&mut cache, &mut p, 4), LookupOutcome::MissEvicted);
        // 1 was oldest but pinned; 2 goes instead.
        assert_eq!(p.destroyed, vec![2]);
        assert_eq!(lookup(&mut cache, &mut p, 1), LookupOutcome::Hit);
    }

    #[test]
    fn flush_keeps_pinned_entries() {
        let mut cache = Lru::<Entry>::new(3);
        let mut p = TestPolicy::default();
        lookup(&mut cache, &mut p, 1);
        let (h2, _) = cache.lookup(hash_of(2), &2, &mut p);
        cache.get_mut(h2).pinned = true;

        cache.flush(&mut p);
        assert_eq!(p.destroyed, vec![1]);
        assert_eq!(cache.active_len(), 1);
        assert_eq!(lookup(&mut cache, &mut p, 2), LookupOutcome::Hit);
    }

    #[test]
    fn hash_collisions_fall_back_to_key_compare() {
        struct CollidingPolicy(TestPolicy);
        impl CachePolicy<Entry> for CollidingPolicy {
            type Key = u32;
            fn matches(&self, payload: &Entry, key: &u32) -> bool {
                self.0.matches(payload, key)
            }
            fn construct(&mut self, payload: &mut Entry, key: &u32) {
                self.0.construct(payload, key)
            }
            fn destroy(&mut self, payload: &mut Entry) {
                self.0.destroy(payload)
            }
        }

        let mut cache = Lru::<Entry>::new(2);
        let mut p = CollidingPolicy(TestPolicy::default());
        // Same hash, different keys: both must get distinct nodes.
        let (h1, _) = cache.lookup(42, &1, &mut p);
        let (h2, o2) = cache.lookup(42, &2, &mut p);
        assert_ne!(h1, h2);
        assert_eq!(o2, LookupOutcome::Miss);
        assert_eq!(cache.stats().collisions, 1);
    }

    #[test]
    fn removed_node_returns_to_the_free_list() {
        let mut cache = Lru::<Entry>::new(1);
        let mut p = TestPolicy::default();

        let (h, _) = cache.lookup(hash_of(1), &1, &mut p);
        cache.remove(h, &mut p);
        assert_eq!(p.destroyed, vec![1]);
        assert_eq!(cache.active_len(), 0);

        // The slot is free again: the next miss needs no eviction.
        assert_eq!(lookup(&mut cache, &mut p, 2), LookupOutcome::Miss);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn zero_capacity_is_a_programming_error() {
        let _ = Lru::<Entry>::new(0);
    }

    proptest! {
        /// Active size never exceeds capacity, and a key that was looked up
        /// more recently than the last N-1 other distinct keys is a hit.
        #[test]
        fn lru_recency_property(keys in proptest::collection::vec(0u32..16, 1..200)) {
            const CAP: usize = 4;
            let mut cache = Lru::<Entry>::new(CAP);
            let mut p = TestPolicy::default();
            let mut recent: Vec<u32> = Vec::new();

            for &k in &keys {
                let expected_hit = recent.iter().position(|&r| r == k).is_some_and(|pos| pos < CAP);
                let outcome = lookup(&mut cache, &mut p, k);
                prop_assert_eq!(outcome == LookupOutcome::Hit, expected_hit);
                prop_assert!(cache.active_len() <= CAP);

                recent.retain(|&r| r != k);
                recent.insert(0, k);
            }
        }
    }
}

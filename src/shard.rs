//! Shards: disjoint per-thread slices of the cyclic permutation.
//!
//! With `S` sender threads on each of `T` machine shards, the exponent line
//! is striped with stride `D = S*T`: the sub-shard at offset
//! `b = thread_id + S*machine_shard` owns exponent offsets `b, b+D, b+2D, ..`
//! Every offset below the group order belongs to exactly one sub-shard, so
//! the union of all shards is the full permutation with no duplicates.
//!
//! A shard carries only its current group element plus counters - no list,
//! no visited set. It is owned by a single sender thread; nothing here
//! locks.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::cyclic::{mulmod, Cycle};
use crate::targets::{AddressOracle, PagedBitmap, PortList};

/// One (address, port) pair produced by the iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// The decoded target space a shard draws from.
pub struct TargetSpace {
    pub oracle: Arc<dyn AddressOracle>,
    pub ports: PortList,
}

impl TargetSpace {
    /// Total number of (address, port) targets, `N = |A| * |P|`.
    pub fn total(&self) -> u64 {
        self.oracle.count_allowed() * self.ports.len() as u64
    }

    fn decode(&self, index: u64) -> Target {
        let ports = self.ports.len() as u64;
        Target {
            ip: self.oracle.rank((index - 1) / ports),
            port: self.ports.get(((index - 1) % ports) as usize),
        }
    }
}

/// Mutable per-shard counters, advanced only by the owning sender thread.
#[derive(Debug, Default)]
pub struct ShardState {
    pub targets_scanned: u64,
    pub packets_sent: u64,
    pub packets_failed: u64,
    pub max_targets: Option<u64>,
    pub max_packets: Option<u64>,
    pub first_scanned: Option<Ipv4Addr>,
    pub last_scanned: Option<Ipv4Addr>,
}

/// Callback invoked exactly once when the owning thread finishes the shard.
pub type ShardCallback = Box<dyn FnOnce(u8) + Send>;

/// A sender thread's slice of the iterator.
pub struct Shard {
    thread_id: u8,
    prime: u64,
    n: u64,
    factor: u64,
    current: u64,
    stop: u64,
    exhausted: bool,
    space: Arc<TargetSpace>,
    ip_filter: Option<Arc<PagedBitmap>>,
    pub state: ShardState,
    done_cb: Option<ShardCallback>,
}

impl Shard {
    /// Build the sub-shard at `offset` with stride `stride` over `cycle`.
    ///
    /// `offset` must be below `stride`, and `stride` must not exceed the
    /// number of targets (the orchestrator rejects oversubscription before
    /// shards are built).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cycle: &Cycle,
        offset: u64,
        stride: u64,
        thread_id: u8,
        space: Arc<TargetSpace>,
        ip_filter: Option<Arc<PagedBitmap>>,
        max_targets: Option<u64>,
        max_packets: Option<u64>,
        done_cb: Option<ShardCallback>,
    ) -> Self {
        debug_assert!(offset < stride);
        debug_assert!(stride <= cycle.order());
        // The walk ends at the first exponent offset >= order in our stripe.
        // That element is distinct from everything the shard emits, so a
        // plain equality check detects completion.
        let steps = (cycle.order() - offset).div_ceil(stride);
        let mut shard = Self {
            thread_id,
            prime: cycle.prime(),
            n: cycle.target_count(),
            factor: cycle.stride_factor(stride),
            current: cycle.element(offset),
            stop: cycle.element(offset + steps * stride),
            exhausted: false,
            space,
            ip_filter,
            state: ShardState {
                max_targets,
                max_packets,
                ..ShardState::default()
            },
            done_cb,
        };
        if !shard.is_current_valid() {
            shard.advance();
        }
        shard
    }

    /// Shard offset for sender `thread_id` on machine shard `machine_shard`.
    pub fn sub_shard_offset(thread_id: u8, senders: u8, machine_shard: u16) -> u64 {
        thread_id as u64 + senders as u64 * machine_shard as u64
    }

    pub fn thread_id(&self) -> u8 {
        self.thread_id
    }

    /// Peek the current position without advancing. `None` means done.
    pub fn current_target(&self) -> Option<Target> {
        if self.exhausted {
            None
        } else {
            Some(self.space.decode(self.current))
        }
    }

    /// Advance to the next target and return it. `None` means the shard
    /// is depleted; every later call also returns `None`.
    pub fn next_target(&mut self) -> Option<Target> {
        if self.exhausted {
            return None;
        }
        self.advance();
        self.current_target()
    }

    fn is_current_valid(&self) -> bool {
        if self.current > self.n {
            return false;
        }
        match &self.ip_filter {
            Some(filter) => {
                let t = self.space.decode(self.current);
                filter.check(u32::from(t.ip))
            }
            None => true,
        }
    }

    /// Step the group element until it lands on a valid index or hits the
    /// stop element. Holes (values above N) and filtered addresses count
    /// as iterator steps, not as scanned targets.
    fn advance(&mut self) {
        loop {
            self.current = mulmod(self.current, self.factor, self.prime);
            if self.current == self.stop {
                self.exhausted = true;
                return;
            }
            if self.is_current_valid() {
                return;
            }
        }
    }

    /// Record the outcome of one submitted batch: `submitted` slots were
    /// handed to the transport, `accepted` of them went out.
    pub fn record_batch(&mut self, submitted: u64, accepted: u64) {
        debug_assert!(accepted <= submitted);
        self.state.packets_sent += accepted;
        self.state.packets_failed += submitted - accepted;
    }

    /// Record that all probes for one target have been built.
    pub fn mark_scanned(&mut self, target: &Target) {
        if self.state.first_scanned.is_none() {
            self.state.first_scanned = Some(target.ip);
        }
        self.state.last_scanned = Some(target.ip);
        self.state.targets_scanned += 1;
    }

    /// Whether the configured per-shard target cap has been reached.
    pub fn hit_max_targets(&self) -> bool {
        self.state
            .max_targets
            .is_some_and(|m| self.state.targets_scanned >= m)
    }

    /// Whether the configured per-shard packet cap has been reached.
    pub fn hit_max_packets(&self) -> bool {
        self.state
            .max_packets
            .is_some_and(|m| self.state.packets_sent >= m)
    }

    /// Fire the completion callback. Safe to call more than once; only the
    /// first call reaches the orchestrator.
    pub fn complete(&mut self) {
        if let Some(cb) = self.done_cb.take() {
            cb(self.thread_id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::CidrOracle;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Target space of exactly `n` targets: n addresses, one port.
    fn space(n: u64) -> Arc<TargetSpace> {
        assert!(n <= 1 << 16);
        let base = u32::from(Ipv4Addr::new(10, 0, 0, 0));
        let oracle = CidrOracle::from_ranges(vec![(base, base + n as u32 - 1)], &[]).unwrap();
        Arc::new(TargetSpace {
            oracle: Arc::new(oracle),
            ports: PortList::from_ports(vec![443]),
        })
    }

    fn cycle_for(space: &TargetSpace, seed: u64) -> Cycle {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        Cycle::new(space.total(), &mut rng).unwrap()
    }

    fn drain(shard: &mut Shard) -> Vec<Target> {
        let mut out = Vec::new();
        let mut cur = shard.current_target();
        while let Some(t) = cur {
            out.push(t);
            cur = shard.next_target();
        }
        out
    }

    fn collect_all_shards(n: u64, senders: u8, total_shards: u16, seed: u64) -> Vec<Vec<Target>> {
        let space = space(n);
        let cycle = cycle_for(&space, seed);
        let stride = senders as u64 * total_shards as u64;
        let mut all = Vec::new();
        for machine in 0..total_shards {
            for tid in 0..senders {
                let offset = Shard::sub_shard_offset(tid, senders, machine);
                let mut shard = Shard::new(
                    &cycle,
                    offset,
                    stride,
                    tid,
                    Arc::clone(&space),
                    None,
                    None,
                    None,
                    None,
                );
                all.push(drain(&mut shard));
            }
        }
        all
    }

    #[test]
    fn test_single_shard_covers_space() {
        for n in [1u64, 2, 7, 255, 1000] {
            let emitted = collect_all_shards(n, 1, 1, 3).remove(0);
            assert_eq!(emitted.len() as u64, n, "N={n}");
            let unique: HashSet<_> = emitted.iter().map(|t| t.ip).collect();
            assert_eq!(unique.len() as u64, n, "duplicates for N={n}");
        }
    }

    #[test]
    fn test_two_shards_partition_thousand() {
        let shards = collect_all_shards(1000, 1, 2, 5);
        let a: HashSet<_> = shards[0].iter().map(|t| t.ip).collect();
        let b: HashSet<_> = shards[1].iter().map(|t| t.ip).collect();
        assert_eq!(a.intersection(&b).count(), 0, "shards must be disjoint");
        assert_eq!(a.len() + b.len(), 1000, "shards must cover the space");
    }

    #[test]
    fn test_shard_union_various_configurations() {
        for (n, senders, total) in [(7u64, 2u8, 2u16), (255, 3, 1), (255, 2, 3), (1000, 4, 4)] {
            let shards = collect_all_shards(n, senders, total, 11);
            let mut seen: HashSet<Ipv4Addr> = HashSet::new();
            let mut count = 0u64;
            for shard in &shards {
                for t in shard {
                    assert!(
                        seen.insert(t.ip),
                        "duplicate target across shards (N={n}, S={senders}, T={total})"
                    );
                    count += 1;
                }
            }
            assert_eq!(count, n, "union must equal the space (N={n}, S={senders}, T={total})");
        }
    }

    #[test]
    fn test_ports_cycle_within_address() {
        let base = u32::from(Ipv4Addr::new(10, 0, 0, 0));
        let oracle = CidrOracle::from_ranges(vec![(base, base + 3)], &[]).unwrap();
        let space = Arc::new(TargetSpace {
            oracle: Arc::new(oracle),
            ports: PortList::from_ports(vec![80, 443]),
        });
        let cycle = cycle_for(&space, 2);
        let mut shard = Shard::new(&cycle, 0, 1, 0, Arc::clone(&space), None, None, None, None);
        let emitted = drain(&mut shard);
        assert_eq!(emitted.len(), 8, "4 addresses x 2 ports");
        let pairs: HashSet<_> = emitted.iter().map(|t| (t.ip, t.port)).collect();
        assert_eq!(pairs.len(), 8, "every (ip, port) pair exactly once");
    }

    #[test]
    fn test_ip_filter_skips_nonmembers() {
        let space = space(16);
        let cycle = cycle_for(&space, 7);
        let mut filter = PagedBitmap::new();
        let want_a = Ipv4Addr::new(10, 0, 0, 3);
        let want_b = Ipv4Addr::new(10, 0, 0, 12);
        filter.set(u32::from(want_a));
        filter.set(u32::from(want_b));
        let mut shard = Shard::new(
            &cycle,
            0,
            1,
            0,
            Arc::clone(&space),
            Some(Arc::new(filter)),
            None,
            None,
            None,
        );
        let emitted = drain(&mut shard);
        let ips: HashSet<_> = emitted.iter().map(|t| t.ip).collect();
        assert_eq!(ips, HashSet::from([want_a, want_b]));
    }

    #[test]
    fn test_batch_accounting() {
        let space = space(4);
        let cycle = cycle_for(&space, 1);
        let mut shard = Shard::new(&cycle, 0, 1, 0, space, None, None, None, None);
        shard.record_batch(64, 64);
        shard.record_batch(64, 60);
        assert_eq!(shard.state.packets_sent, 124);
        assert_eq!(shard.state.packets_failed, 4);
    }

    #[test]
    fn test_mark_scanned_tracks_first_and_last() {
        let space = space(4);
        let cycle = cycle_for(&space, 1);
        let mut shard = Shard::new(&cycle, 0, 1, 0, space, None, Some(2), None, None);
        let a = shard.current_target().unwrap();
        shard.mark_scanned(&a);
        assert!(!shard.hit_max_targets());
        let b = shard.next_target().unwrap();
        shard.mark_scanned(&b);
        assert!(shard.hit_max_targets());
        assert_eq!(shard.state.first_scanned, Some(a.ip));
        assert_eq!(shard.state.last_scanned, Some(b.ip));
    }

    #[test]
    fn test_completion_callback_fires_once() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let space = space(1);
        let cycle = cycle_for(&space, 1);
        let mut shard = Shard::new(
            &cycle,
            0,
            1,
            3,
            space,
            None,
            None,
            None,
            Some(Box::new(|tid| {
                assert_eq!(tid, 3);
                CALLS.fetch_add(1, Ordering::SeqCst);
            })),
        );
        shard.complete();
        shard.complete();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_depleted_shard_stays_done() {
        let space = space(1);
        let cycle = cycle_for(&space, 1);
        let mut shard = Shard::new(&cycle, 0, 1, 0, space, None, None, None, None);
        assert!(shard.current_target().is_some());
        assert!(shard.next_target().is_none());
        assert!(shard.next_target().is_none());
        assert!(shard.current_target().is_none());
    }
}

//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Policy Decision Module: the hottest routine in the engine. Given a
//! policy's action, a packet, and the FIB's load-balance object, selects a
//! label, maps it to a DPO and reports whether the caller should use it or
//! defer to the FIB's own forwarding decision.
//!
//! Pure functions over `&LabelRuntimes`/`&AdjacencyMaps`, the lock-free
//! tables a worker reads without ever touching the control-plane-held
//! `LinkRegistry` — no I/O, no allocation, no logging beyond the optional
//! per-packet `trace!` spans a `datapath-trace` feature would gate (left
//! as a follow-up since this crate does not yet define that feature).

use std::cell::Cell;
use std::sync::atomic::Ordering;

use crate::external::{Dpo, FlowHashConfig, FlowHasher, LoadBalance, PacketCtx};
use crate::flowhash::pick_index;
use crate::link::{AdjacencyMaps, LabelRuntimes};
use crate::policy::{Fallback, Group, PolicyAction, PolicyCounters, Selection};
use crate::quality::QualityTolerance;

/// Caches a packet's flow hash so it is computed at most once per packet,
/// however many groups/labels end up probing it.
pub struct FlowHash<'a, H: FlowHasher> {
    hasher: &'a H,
    packet: &'a PacketCtx<'a>,
    config: FlowHashConfig,
    cached: Cell<Option<u32>>,
}

impl<'a, H: FlowHasher> FlowHash<'a, H> {
    pub fn new(hasher: &'a H, packet: &'a PacketCtx<'a>, config: FlowHashConfig) -> Self {
        FlowHash {
            hasher,
            packet,
            config,
            cached: Cell::new(None),
        }
    }

    fn get(&self) -> u32 {
        if let Some(hash) = self.cached.get() {
            return hash;
        }
        let hash = self.hasher.hash(self.packet, self.config);
        self.cached.set(Some(hash));
        hash
    }
}

/// Outcome of the Policy Decision Module: when `use_policy_dpo` is false,
/// the caller forwards using the FIB's own result instead of `dpo`.
#[derive(Clone, Copy, Debug)]
pub struct Decision {
    pub use_policy_dpo: bool,
    pub dpo: Dpo,
}

/// One hash-picked probe, then an ordered scan of the group's own labels.
/// Groups with `link_selection == Random` still do one hash-picked probe
/// before falling back to their ordered scan.
fn resolve_group<H: FlowHasher>(
    group: &Group,
    flow_hash: &FlowHash<'_, H>,
    resolve: &impl Fn(u8) -> Option<Dpo>,
) -> Option<(u8, Dpo)> {
    if group.link_selection == Selection::Random && group.labels.len() > 1 {
        let j = pick_index(flow_hash.get(), group.pow2_mask, group.n_minus_1);
        let label = group.labels[j];
        if let Some(dpo) = resolve(label) {
            return Some((label, dpo));
        }
    }
    group
        .labels
        .iter()
        .find_map(|&label| resolve(label).map(|dpo| (label, dpo)))
}

/// Selects a label from the action. When `group_selection == Random` and
/// there is more than one group, one group is hash-picked and probed
/// first; any failure (within
/// that group or not) falls through to an ordered scan of every group,
/// each still honoring its own `link_selection` probe.
fn select_label<H: FlowHasher>(
    action: &PolicyAction,
    flow_hash: &FlowHash<'_, H>,
    resolve: &impl Fn(u8) -> Option<Dpo>,
) -> Option<(u8, Dpo)> {
    if action.groups.len() > 1 && action.group_selection == Selection::Random {
        let i = pick_index(flow_hash.get(), action.pow2_mask, action.n_minus_1);
        if let Some(result) = resolve_group(&action.groups[i], flow_hash, resolve) {
            return Some(result);
        }
    }
    action
        .groups
        .iter()
        .find_map(|group| resolve_group(group, flow_hash, resolve))
}

/// Label -> DPO rule. `is_default_route` bypasses the reachable-map
/// intersection entirely and returns the labeled link's own (lock-free,
/// `ArcSwap`-published) DPO; otherwise the FIB's load-balance buckets are
/// intersected against `reachable_map`. Per-link hit/miss counters are
/// incremented along `enforced`/ordinary lines: `enforced` tracks the
/// default-route bypass path, matching the branch taken just above. A
/// label skipped for exceeding the service class's quality tolerance
/// records a miss too, before returning early.
fn label_to_dpo(
    label: u8,
    is_default_route: bool,
    labels: &LabelRuntimes,
    maps: &AdjacencyMaps,
    fib_lb: &impl LoadBalance,
    quality_tolerance: Option<&QualityTolerance>,
) -> Option<Dpo> {
    if let Some(tolerance) = quality_tolerance
        && !labels.quality(label).within(tolerance)
    {
        labels.counters(label).record(false, is_default_route);
        return None;
    }

    let dpo = if is_default_route {
        labels.dpo(label)
    } else {
        (0..fib_lb.n_buckets())
            .map(|i| fib_lb.bucket(i))
            .find(|bucket| maps.reachable_label(bucket.adj_index) == Some(label))
    };

    labels.counters(label).record(dpo.is_some(), is_default_route);

    dpo
}

/// Runs the full decision contract for one packet against one action.
///
/// `is_default_route` reflects the FIB result, independent of which action
/// is being evaluated — the bypass rule applies regardless of source.
/// `is_override` only affects which counter records the
/// default-route-engaged event — set by the caller when `action`/`counters`
/// come from the process-scoped `default_route_action` rather than a
/// per-attachment Policy.
#[allow(clippy::too_many_arguments)]
pub fn decide<H: FlowHasher>(
    action: &PolicyAction,
    counters: &PolicyCounters,
    is_default_route: bool,
    is_override: bool,
    flow_hash: &FlowHash<'_, H>,
    fib_lb: &impl LoadBalance,
    labels: &LabelRuntimes,
    maps: &AdjacencyMaps,
    quality_tolerance: Option<&QualityTolerance>,
) -> Decision {
    counters.matched.fetch_add(1, Ordering::Relaxed);

    let resolve = |label: u8| {
        label_to_dpo(
            label,
            is_default_route,
            labels,
            maps,
            fib_lb,
            quality_tolerance,
        )
    };

    match select_label(action, flow_hash, &resolve) {
        Some((_, dpo)) => {
            counters.applied.fetch_add(1, Ordering::Relaxed);
            if is_override {
                counters.default_route.fetch_add(1, Ordering::Relaxed);
            }
            Decision {
                use_policy_dpo: true,
                dpo,
            }
        }
        None => match action.fallback {
            Fallback::DefaultRoute => {
                counters.fallback.fetch_add(1, Ordering::Relaxed);
                Decision {
                    use_policy_dpo: false,
                    dpo: Dpo {
                        next_node: 0,
                        adj_index: 0,
                    },
                }
            }
            Fallback::Drop => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                Decision {
                    use_policy_dpo: true,
                    dpo: Dpo::drop(),
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    use super::*;
    use crate::external::{
        BackWalkRegistration, ChildHandle, ForwardingDescriptor, RoutingBackWalkSource,
    };
    use crate::link::{Family, LinkRegistry};

    struct FakeLb {
        buckets: Vec<Dpo>,
    }

    impl LoadBalance for FakeLb {
        fn n_buckets(&self) -> usize {
            self.buckets.len()
        }

        fn bucket(&self, index: usize) -> Dpo {
            self.buckets[index]
        }

        fn hash_config(&self) -> FlowHashConfig {
            FlowHashConfig::default()
        }
    }

    struct FakeHasher {
        hash: u32,
    }

    impl FlowHasher for FakeHasher {
        fn hash(&self, _packet: &PacketCtx<'_>, _config: FlowHashConfig) -> u32 {
            self.hash
        }
    }

    struct FakeRouting {
        next_handle: RefCell<u64>,
        resolutions: RefCell<StdHashMap<u64, ForwardingDescriptor>>,
    }

    impl FakeRouting {
        fn new() -> Self {
            FakeRouting {
                next_handle: RefCell::new(1),
                resolutions: RefCell::new(StdHashMap::new()),
            }
        }
    }

    impl RoutingBackWalkSource for FakeRouting {
        fn register_child(
            &self,
            next_hop: ForwardingDescriptor,
            _child: ChildHandle,
        ) -> BackWalkRegistration {
            let mut next = self.next_handle.borrow_mut();
            let handle = *next;
            *next += 1;
            self.resolutions.borrow_mut().insert(handle, next_hop);
            BackWalkRegistration(handle)
        }

        fn unregister(&self, registration: BackWalkRegistration) {
            self.resolutions.borrow_mut().remove(&registration.0);
        }

        fn resolve(&self, registration: BackWalkRegistration) -> ForwardingDescriptor {
            *self.resolutions.borrow().get(&registration.0).unwrap()
        }

        fn default_route_entry(&self, _family: Family) -> Option<ForwardingDescriptor> {
            None
        }

        fn adjacencies(&self, descriptor: &ForwardingDescriptor) -> Vec<u32> {
            descriptor.adj_index.into_iter().collect()
        }
    }

    fn descriptor(adj: u32) -> ForwardingDescriptor {
        ForwardingDescriptor {
            adj_index: Some(adj),
            next_node: 9,
        }
    }

    fn packet() -> PacketCtx<'static> {
        PacketCtx {
            data: &[],
            family: Family::V4,
        }
    }

    fn env(max_adj: u32) -> (Arc<AdjacencyMaps>, Arc<LabelRuntimes>, LinkRegistry, FakeRouting) {
        let maps = Arc::new(AdjacencyMaps::new(max_adj));
        let labels = Arc::new(LabelRuntimes::new());
        let registry = LinkRegistry::new(maps.clone(), labels.clone());
        (maps, labels, registry, FakeRouting::new())
    }

    fn action(fallback: Fallback, group_selection: Selection, groups: Vec<Group>) -> PolicyAction {
        PolicyAction::new(fallback, group_selection, groups)
    }

    // Ordered group/label selection returns the first declared label when
    // everything resolves.
    #[test]
    fn property4_ordered_selection_picks_first() {
        let (maps, labels, mut registry, routing) = env(16);
        registry.link_add(&routing, 1, 10, Family::V4, descriptor(4)).unwrap();
        registry.link_add(&routing, 2, 20, Family::V4, descriptor(5)).unwrap();

        let act = action(
            Fallback::DefaultRoute,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![10, 20])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![Dpo {
                next_node: 1,
                adj_index: 4,
            }],
        };

        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(decision.use_policy_dpo);
        assert_eq!(decision.dpo.adj_index, 4);
    }

    // A label skipped for exceeding the service class's quality tolerance
    // still records a miss, same as a label that fails the reachable-map
    // intersection.
    #[test]
    fn quality_tolerance_reject_records_miss() {
        let (maps, labels, mut registry, routing) = env(16);
        registry.link_add(&routing, 1, 10, Family::V4, descriptor(4)).unwrap();
        registry.quality_set(1, Some(5), None, None).unwrap();

        let act = action(
            Fallback::DefaultRoute,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![10])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![Dpo {
                next_node: 1,
                adj_index: 4,
            }],
        };
        let tolerance = crate::quality::ServiceClass::RealTime.tolerance();

        let decision = decide(
            &act,
            &counters,
            false,
            false,
            &flow_hash,
            &lb,
            &labels,
            &maps,
            Some(&tolerance),
        );
        assert!(!decision.use_policy_dpo);
        let (hits, misses, enforced_hits, enforced_misses) = labels.counters(10).snapshot();
        assert_eq!((hits, misses, enforced_hits, enforced_misses), (0, 1, 0, 0));
    }

    // Random probe miss falls through to the ordered label that actually
    // resolves.
    #[test]
    fn property5_random_then_ordered_fallback() {
        let (maps, labels, mut registry, routing) = env(16);
        // label 10 (tun_A) is down; label 20 (tun_B) is up.
        registry.link_add(&routing, 1, 10, Family::V4, descriptor(4)).unwrap();
        // Take tun_A down by clearing its reachable adjacency via quality.
        registry.quality_set(1, Some(100), None, None).unwrap();
        registry.link_add(&routing, 2, 20, Family::V4, descriptor(5)).unwrap();

        let act = action(
            Fallback::DefaultRoute,
            Selection::Ordered,
            vec![Group::new(Selection::Random, vec![10, 20])],
        );
        let counters = PolicyCounters::default();
        // Hash picks index 0 within the 2-label group -> label 10, which
        // must fail so the ordered fallback picks label 20.
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![
                Dpo {
                    next_node: 1,
                    adj_index: 4,
                },
                Dpo {
                    next_node: 1,
                    adj_index: 5,
                },
            ],
        };

        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(decision.use_policy_dpo);
        assert_eq!(decision.dpo.adj_index, 5);
    }

    // Default-route override takes the labeled link when reachable; falls
    // back when it is not.
    #[test]
    fn property6_default_route_override() {
        let (maps, labels, mut registry, routing) = env(16);
        registry.link_add(&routing, 1, 30, Family::V4, descriptor(6)).unwrap();

        let act = action(
            Fallback::DefaultRoute,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![30])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb { buckets: vec![] };

        let decision = decide(
            &act, &counters, true, true, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(decision.use_policy_dpo);
        assert_eq!(decision.dpo.adj_index, 6);
        assert_eq!(counters.default_route.load(Ordering::Relaxed), 1);

        registry.link_del(&routing, 1);
        let decision = decide(
            &act, &counters, true, true, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(!decision.use_policy_dpo);
    }

    // DROP fallback is reported with use_policy_dpo == true.
    #[test]
    fn property7_drop_fallback() {
        let (maps, labels, _registry, _routing) = env(16);
        let act = action(
            Fallback::Drop,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![10])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![Dpo {
                next_node: 1,
                adj_index: 0,
            }],
        };

        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(decision.dpo.is_drop());
        assert!(decision.use_policy_dpo);
        assert_eq!(counters.dropped.load(Ordering::Relaxed), 1);
    }

    // DEFAULT_ROUTE fallback defers to the FIB.
    #[test]
    fn property8_default_route_fallback() {
        let (maps, labels, _registry, _routing) = env(16);
        let act = action(
            Fallback::DefaultRoute,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![10])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![Dpo {
                next_node: 1,
                adj_index: 0,
            }],
        };

        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(!decision.use_policy_dpo);
        assert_eq!(counters.fallback.load(Ordering::Relaxed), 1);
    }

    // ECMP to two labeled links, ordered policy; bringing the first down
    // shifts traffic to the second.
    #[test]
    fn s1_ecmp_ordered_failover() {
        let (maps, labels, mut registry, routing) = env(16);
        registry.link_add(&routing, 1, 10, Family::V4, descriptor(4)).unwrap();
        registry.link_add(&routing, 2, 20, Family::V4, descriptor(5)).unwrap();

        let act = action(
            Fallback::DefaultRoute,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![10, 20])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![
                Dpo {
                    next_node: 1,
                    adj_index: 4,
                },
                Dpo {
                    next_node: 1,
                    adj_index: 5,
                },
            ],
        };

        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert_eq!(decision.dpo.adj_index, 4);

        registry.quality_set(1, Some(100), None, None).unwrap();
        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert_eq!(decision.dpo.adj_index, 5);
    }

    // Single labeled link down, fallback drop.
    #[test]
    fn s2_fallback_drop_on_link_down() {
        let (maps, labels, mut registry, routing) = env(16);
        registry.link_add(&routing, 1, 10, Family::V4, descriptor(4)).unwrap();
        registry.quality_set(1, Some(100), None, None).unwrap();

        let act = action(
            Fallback::Drop,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![10])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![Dpo {
                next_node: 1,
                adj_index: 4,
            }],
        };

        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(decision.dpo.is_drop());
    }

    // Default route override action exits via the WAN label even though
    // the per-attachment policy has no matching label.
    #[test]
    fn s3_default_route_override_exits_wan() {
        let (maps, labels, mut registry, routing) = env(16);
        registry.link_add(&routing, 1, 99, Family::V4, descriptor(8)).unwrap();

        let override_action = action(
            Fallback::DefaultRoute,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![99])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb { buckets: vec![] };

        let decision = decide(
            &override_action,
            &counters,
            true,
            true,
            &flow_hash,
            &lb,
            &labels,
            &maps,
            None,
        );
        assert!(decision.use_policy_dpo);
        assert_eq!(decision.dpo.adj_index, 8);
    }

    // Random group selection lands on an unreachable group; ordered
    // fallback scans to the group that resolves.
    #[test]
    fn s5_random_group_miss_falls_through() {
        let (maps, labels, mut registry, routing) = env(16);
        // Group B's label (20) is down; group C's label (30) is up.
        registry.link_add(&routing, 2, 20, Family::V4, descriptor(5)).unwrap();
        registry.quality_set(2, Some(100), None, None).unwrap();
        registry.link_add(&routing, 3, 30, Family::V4, descriptor(6)).unwrap();

        let act = action(
            Fallback::DefaultRoute,
            Selection::Random,
            vec![
                Group::new(Selection::Ordered, vec![10]),
                Group::new(Selection::Ordered, vec![20]),
                Group::new(Selection::Ordered, vec![30]),
            ],
        );
        let counters = PolicyCounters::default();
        // 3 groups -> pow2_mask 0x0F, n_minus_1 2; hash & 0x0F == 1 picks
        // group B (index 1), which fails and falls through to group C.
        let hasher = FakeHasher { hash: 1 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![Dpo {
                next_node: 1,
                adj_index: 6,
            }],
        };

        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(decision.use_policy_dpo);
        assert_eq!(decision.dpo.adj_index, 6);
    }

    // link_del clears admin_map before the pool slot is released, so a
    // decision made concurrently with deletion never resolves onto a
    // stale, unrelated adjacency — it simply misses into fallback.
    #[test]
    fn s6_link_del_never_yields_stale_adjacency() {
        let (maps, labels, mut registry, routing) = env(16);
        registry.link_add(&routing, 1, 10, Family::V4, descriptor(4)).unwrap();
        registry.link_del(&routing, 1);

        let act = action(
            Fallback::DefaultRoute,
            Selection::Ordered,
            vec![Group::new(Selection::Ordered, vec![10])],
        );
        let counters = PolicyCounters::default();
        let hasher = FakeHasher { hash: 0 };
        let pkt = packet();
        let flow_hash = FlowHash::new(&hasher, &pkt, FlowHashConfig::default());
        let lb = FakeLb {
            buckets: vec![Dpo {
                next_node: 1,
                adj_index: 4,
            }],
        };

        let decision = decide(
            &act, &counters, false, false, &flow_hash, &lb, &labels, &maps, None,
        );
        assert!(!decision.use_policy_dpo);
    }
}

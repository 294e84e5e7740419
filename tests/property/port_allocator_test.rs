// tests/property/port_allocator_test.rs
//
// Property-based tests for the port allocator (C4, spec §4.5): allocation
// is always first-fit low-to-high, never reuses a bound port, and a full
// bind/release cycle always restores the original free-port set.

use cml_orchestrator::core::domain::worker::{Capacity, PortRange, Worker};
use cml_orchestrator::core::ids::{InstanceId, PortKind, PortPlaceholder};
use cml_orchestrator::core::ports::allocate;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn worker(lo: u16, hi: u16) -> Worker {
    let (w, _) = Worker::new_pending(
        "t".into(),
        "us-east".into(),
        "m5.large".into(),
        Capacity { cpu: 8, memory_gb: 32, storage_gb: 100, max_nodes: 4 },
        PortRange { lo, hi },
        "PERSONAL".into(),
        BTreeMap::new(),
    );
    w
}

fn template(n: usize) -> Vec<PortPlaceholder> {
    (0..n).map(|i| PortPlaceholder { name: format!("P{i}"), kind: PortKind::Console }).collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    /// Allocating `n` ports out of a `[lo, lo+width]` range always returns
    /// exactly `n` distinct ports, all inside the range, in ascending order.
    #[test]
    fn allocation_is_sorted_distinct_and_in_range(
        lo in 20000u16..30000,
        width in 0u16..50,
        n in 0usize..20,
    ) {
        let hi = lo.saturating_add(width);
        let w = worker(lo, hi);
        let range_size = (hi - lo) as usize + 1;
        let tmpl = template(n);
        let result = allocate(&w, &tmpl);

        if n > range_size {
            prop_assert!(result.is_err());
        } else {
            let mapping = result.unwrap();
            prop_assert_eq!(mapping.len(), n);
            let mut ports: Vec<u16> = mapping.values().copied().collect();
            ports.sort_unstable();
            let mut seen = ports.clone();
            seen.dedup();
            prop_assert_eq!(seen.len(), ports.len(), "allocate must never hand out a duplicate port");
            for p in &ports {
                prop_assert!(*p >= lo && *p <= hi);
            }
            for w_ in 0..ports.len().saturating_sub(1) {
                prop_assert!(ports[w_] < ports[w_ + 1]);
            }
        }
    }

    /// Binding an allocation then releasing it always restores the original
    /// free-port count, regardless of how many ports were bound.
    #[test]
    fn bind_then_release_restores_free_port_count(
        lo in 20000u16..30000,
        width in 0u16..50,
        n in 0usize..20,
    ) {
        let hi = lo.saturating_add(width);
        let range_size = (hi - lo) as usize + 1;
        prop_assume!(n <= range_size);

        let w = worker(lo, hi);
        let original_free = w.free_port_count();
        let tmpl = template(n);
        let mapping = allocate(&w, &tmpl).unwrap();

        let instance_id = InstanceId::new();
        let (bound, _) = w.bind_ports(instance_id, mapping).unwrap();
        prop_assert_eq!(bound.free_port_count(), original_free - n);

        let (released, _) = bound.release_ports(instance_id);
        prop_assert_eq!(released.free_port_count(), original_free);
    }
}

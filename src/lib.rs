pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestration::{Request, Response, SwarmEngine};

/// Concurrency invariant tests.
///
/// These tests verify the properties every component relies on:
/// - Capacity: load never exceeds `max_concurrent`, even under contention
/// - Leases: capacity is returned exactly once per dispatch
/// - Determinism: arbitration ranks identically for identical inputs
#[cfg(test)]
mod invariant_tests {
    use crate::core::task::Requirement;
    use crate::core::worker::{WorkerDescriptor, WorkerId};
    use crate::orchestration::{
        ArbiterConfig, ArbitrationEngine, CapabilityRegistry, CircuitBreakerConfig, FnExecutor,
        HealthMonitor, LoadLease, WorkerExecutor,
    };
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn noop() -> Arc<dyn WorkerExecutor> {
        Arc::new(FnExecutor::new(|_| async { Ok(String::new()) }.boxed()))
    }

    /// Many threads racing for the same worker never push it over capacity.
    #[test]
    fn test_try_acquire_never_oversubscribes() {
        let registry = Arc::new(CapabilityRegistry::default());
        registry
            .register(
                WorkerDescriptor::new("w").with_competency("testing", 1.0).with_max_concurrent(3),
                noop(),
            )
            .unwrap();
        let id = WorkerId::from("w");
        let granted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let granted = Arc::clone(&granted);
                let id = id.clone();
                std::thread::spawn(move || {
                    if registry.try_acquire(&id).unwrap() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 3);
        assert_eq!(registry.get(&id).unwrap().current_load, 3);
    }

    /// Explicit release plus drop returns capacity once.
    #[test]
    fn test_lease_released_exactly_once() {
        let registry = Arc::new(CapabilityRegistry::default());
        registry
            .register(
                WorkerDescriptor::new("w").with_competency("testing", 1.0).with_max_concurrent(2),
                noop(),
            )
            .unwrap();
        let id = WorkerId::from("w");
        let held = LoadLease::acquire(&registry, &id).unwrap().unwrap();
        let lease = LoadLease::acquire(&registry, &id).unwrap().unwrap();
        assert!(LoadLease::acquire(&registry, &id).unwrap().is_none());

        assert!(lease.release());
        assert!(!lease.release());
        drop(lease);
        assert_eq!(registry.get(&id).unwrap().current_load, 1);
        drop(held);
        assert_eq!(registry.get(&id).unwrap().current_load, 0);
    }

    /// Registration order does not change the ranking.
    #[test]
    fn test_ranking_is_deterministic() {
        let required = vec![Requirement::new("testing", 1.0)];
        let rank = |order: &[&str]| {
            let registry = Arc::new(CapabilityRegistry::default());
            for id in order {
                registry
                    .register(WorkerDescriptor::new(*id).with_competency("testing", 0.8), noop())
                    .unwrap();
            }
            let health = Arc::new(HealthMonitor::new(
                CircuitBreakerConfig::default(),
                Arc::clone(&registry),
            ));
            let arbiter = ArbitrationEngine::new(registry, health, ArbiterConfig::default());
            arbiter
                .rank(&required)
                .into_iter()
                .map(|c| c.worker_id.0)
                .collect::<Vec<_>>()
        };
        assert_eq!(rank(&["c", "a", "b"]), vec!["a", "b", "c"]);
        assert_eq!(rank(&["b", "c", "a"]), rank(&["a", "b", "c"]));
    }
}

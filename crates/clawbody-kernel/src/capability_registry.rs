//! [`CapabilityRegistry`] – what the body can currently do.
//!
//! The registry publishes an immutable [`CapabilitySnapshot`] behind an
//! `Arc`.  [`CapabilityRegistry::refresh`] builds a complete replacement off
//! to the side and swaps it in under a short lock, so a reader either sees
//! the old set or the new one, never a mix.
//!
//! Every snapshot contains a small built-in repertoire of synthesized
//! behaviors so the robot can still express itself when the behavior store
//! is unreachable.  A recorded behavior with the same name replaces the
//! built-in one.
//!
//! Ordinals are handed out the first time a name is seen and never change;
//! higher means more recently registered.  The gesture engine uses them to
//! break ties.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clawbody_middleware::{BehaviorStore, EventBus, Topic};
use clawbody_types::{BehaviorCategory, BehaviorDescriptor, BodyError, EventPayload};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOURCE: &str = "clawbody-kernel::capability_registry";

/// One complete, immutable generation of the behavior set.
#[derive(Debug, Clone)]
pub struct CapabilitySnapshot {
    generation: u64,
    by_name: HashMap<String, BehaviorDescriptor>,
    refreshed_at: DateTime<Utc>,
}

impl CapabilitySnapshot {
    /// `0` for the built-ins-only snapshot the registry starts with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    pub fn lookup(&self, name: &str) -> Option<&BehaviorDescriptor> {
        self.by_name.get(name)
    }

    /// Behaviors of `category`, most recently registered first.
    pub fn by_category(&self, category: BehaviorCategory) -> Vec<&BehaviorDescriptor> {
        let mut found: Vec<_> = self
            .by_name
            .values()
            .filter(|d| d.category == category)
            .collect();
        found.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        found
    }

    /// Sorted behavior names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// The synthesized repertoire merged into every snapshot.
pub fn builtin_behaviors() -> Vec<BehaviorDescriptor> {
    use BehaviorCategory::{Dance, Emotion, Gesture};
    let emotions = [
        "happy",
        "sad",
        "surprised",
        "curious",
        "thinking",
        "confused",
        "excited",
    ];
    let mut all: Vec<_> = emotions
        .into_iter()
        .map(|name| BehaviorDescriptor::synthesized(name, Emotion, 2_000))
        .collect();
    all.extend([
        BehaviorDescriptor::synthesized("nod", Gesture, 1_200),
        BehaviorDescriptor::synthesized("shake", Gesture, 1_200),
        BehaviorDescriptor::synthesized("tilt", Gesture, 1_000),
        BehaviorDescriptor::synthesized("simple_sway", Dance, 4_000),
        BehaviorDescriptor::synthesized("head_bob", Dance, 4_000),
    ]);
    all
}

#[derive(Default)]
struct OrdinalBook {
    by_name: HashMap<String, u64>,
    next: u64,
}

impl OrdinalBook {
    fn assign(&mut self, descriptor: &mut BehaviorDescriptor) {
        let next = &mut self.next;
        let ordinal = *self.by_name.entry(descriptor.name.clone()).or_insert_with(|| {
            *next += 1;
            *next
        });
        descriptor.ordinal = ordinal;
    }
}

pub struct CapabilityRegistry {
    store: Arc<dyn BehaviorStore>,
    current: RwLock<Arc<CapabilitySnapshot>>,
    builtins: Vec<BehaviorDescriptor>,
    /// Serialises refreshes and owns the ordinal assignments.
    ordinals: Mutex<OrdinalBook>,
    invalidated: Notify,
    bus: Option<EventBus>,
}

impl CapabilityRegistry {
    /// A registry holding only the built-in behaviors until the first
    /// [`refresh`][Self::refresh].
    pub fn new(store: Arc<dyn BehaviorStore>) -> Self {
        let mut book = OrdinalBook::default();
        let mut builtins = builtin_behaviors();
        for b in &mut builtins {
            book.assign(b);
        }
        let initial = CapabilitySnapshot {
            generation: 0,
            by_name: builtins.iter().map(|b| (b.name.clone(), b.clone())).collect(),
            refreshed_at: Utc::now(),
        };
        Self {
            store,
            current: RwLock::new(Arc::new(initial)),
            builtins,
            ordinals: Mutex::new(book),
            invalidated: Notify::new(),
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// The current snapshot.  Holding it keeps that generation alive even
    /// across later refreshes.
    pub fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// # Errors
    ///
    /// Returns [`BodyError::NotFound`] when no behavior is called `name`.
    pub fn lookup(&self, name: &str) -> Result<BehaviorDescriptor, BodyError> {
        self.snapshot()
            .lookup(name)
            .cloned()
            .ok_or_else(|| BodyError::NotFound(format!("behavior '{name}'")))
    }

    /// Rescan the store and publish a new generation.
    ///
    /// Concurrent calls are serialised.  On failure the previous snapshot
    /// stays published and the store's error is returned.
    pub async fn refresh(&self) -> Result<Arc<CapabilitySnapshot>, BodyError> {
        let mut book = self.ordinals.lock().await;

        let recorded = match self.store.scan().await {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!(error = %e, "behavior scan failed; keeping previous snapshot");
                if let Some(bus) = &self.bus {
                    bus.emit(
                        Topic::SystemAlerts,
                        SOURCE,
                        EventPayload::Degraded {
                            component: "capability_registry".to_string(),
                            reason: e.to_string(),
                        },
                    );
                }
                return Err(e);
            }
        };

        let mut by_name: HashMap<String, BehaviorDescriptor> = self
            .builtins
            .iter()
            .map(|b| (b.name.clone(), b.clone()))
            .collect();
        for mut descriptor in recorded {
            if descriptor.name.is_empty() {
                continue;
            }
            book.assign(&mut descriptor);
            by_name.insert(descriptor.name.clone(), descriptor);
        }

        let next = {
            let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
            let next = Arc::new(CapabilitySnapshot {
                generation: current.generation + 1,
                by_name,
                refreshed_at: Utc::now(),
            });
            *current = Arc::clone(&next);
            next
        };

        info!(
            generation = next.generation,
            behaviors = next.len(),
            "capability registry refreshed"
        );
        if let Some(bus) = &self.bus {
            bus.emit(
                Topic::SystemAlerts,
                SOURCE,
                EventPayload::BehaviorsRefreshed {
                    generation: next.generation,
                    count: next.len(),
                },
            );
        }
        Ok(next)
    }

    /// Ask the background refresher to rescan now.
    pub fn invalidate(&self) {
        self.invalidated.notify_one();
    }

    /// Refresh every `interval` and whenever [`invalidate`][Self::invalidate]
    /// is called, until `cancel` fires.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = registry.invalidated.notified() => {
                        debug!("registry invalidated");
                    }
                }
                // `refresh` logs and reports its own failures.
                let _ = registry.refresh().await;
            }
            debug!("registry refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use clawbody_middleware::SimPlatform;
    use clawbody_types::BehaviorSource;

    /// A store whose scans each wait for one permit on `gate`.
    struct GatedStore {
        catalog: StdMutex<Vec<BehaviorDescriptor>>,
        gate: Notify,
    }

    impl GatedStore {
        fn new(catalog: Vec<BehaviorDescriptor>) -> Self {
            Self {
                catalog: StdMutex::new(catalog),
                gate: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl BehaviorStore for GatedStore {
        async fn scan(&self) -> Result<Vec<BehaviorDescriptor>, BodyError> {
            self.gate.notified().await;
            Ok(self.catalog.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn starts_with_builtins_only() {
        let registry = CapabilityRegistry::new(Arc::new(SimPlatform::new()));
        let snap = registry.snapshot();
        assert_eq!(snap.generation(), 0);
        assert_eq!(snap.len(), builtin_behaviors().len());
        assert!(registry.lookup("happy").is_ok());
        assert!(matches!(
            registry.lookup("moonwalk"),
            Err(BodyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn refresh_merges_recorded_over_builtins() {
        let sim = Arc::new(SimPlatform::new());
        sim.set_catalog(vec![
            BehaviorDescriptor::recorded("wave", BehaviorCategory::Gesture, 1_500),
            BehaviorDescriptor::recorded("happy", BehaviorCategory::Emotion, 3_000),
        ]);
        let registry = CapabilityRegistry::new(sim);
        let builtin_happy = registry.lookup("happy").unwrap();

        let snap = registry.refresh().await.unwrap();
        assert_eq!(snap.generation(), 1);
        assert_eq!(snap.len(), builtin_behaviors().len() + 1);

        let happy = registry.lookup("happy").unwrap();
        assert_eq!(happy.source, BehaviorSource::Recorded);
        assert_eq!(happy.duration_ms, 3_000);
        assert_eq!(happy.ordinal, builtin_happy.ordinal);

        let wave = registry.lookup("wave").unwrap();
        assert!(wave.ordinal > happy.ordinal);
    }

    #[tokio::test]
    async fn ordinals_are_stable_across_refreshes() {
        let sim = Arc::new(SimPlatform::new());
        sim.set_catalog(vec![BehaviorDescriptor::recorded(
            "wave",
            BehaviorCategory::Gesture,
            1_500,
        )]);
        let registry = CapabilityRegistry::new(Arc::clone(&sim) as Arc<dyn BehaviorStore>);
        registry.refresh().await.unwrap();
        let first = registry.lookup("wave").unwrap().ordinal;

        sim.set_catalog(vec![
            BehaviorDescriptor::recorded("bow", BehaviorCategory::Gesture, 1_500),
            BehaviorDescriptor::recorded("wave", BehaviorCategory::Gesture, 1_500),
        ]);
        registry.refresh().await.unwrap();
        assert_eq!(registry.lookup("wave").unwrap().ordinal, first);

        let snapshot = registry.snapshot();
        let gestures = snapshot.by_category(BehaviorCategory::Gesture);
        assert_eq!(gestures[0].name, "bow");
    }

    #[tokio::test]
    async fn failed_scan_keeps_previous_generation() {
        let sim = Arc::new(SimPlatform::new());
        sim.set_catalog(vec![BehaviorDescriptor::recorded(
            "wave",
            BehaviorCategory::Gesture,
            1_500,
        )]);
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let registry =
            CapabilityRegistry::new(Arc::clone(&sim) as Arc<dyn BehaviorStore>).with_bus(bus);
        registry.refresh().await.unwrap();

        sim.set_scan_error(Some(BodyError::TransientIo {
            component: "daemon".into(),
            details: "connection reset".into(),
        }));
        let err = registry.refresh().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(registry.snapshot().generation(), 1);
        assert!(registry.lookup("wave").is_ok());

        let refreshed = alerts.next_event().await.unwrap();
        assert!(matches!(
            refreshed.payload,
            EventPayload::BehaviorsRefreshed { generation: 1, .. }
        ));
        let degraded = alerts.next_event().await.unwrap();
        assert!(matches!(degraded.payload, EventPayload::Degraded { .. }));
    }

    #[tokio::test]
    async fn lookup_during_refresh_sees_old_snapshot() {
        let store = Arc::new(GatedStore::new(vec![BehaviorDescriptor::recorded(
            "wave",
            BehaviorCategory::Gesture,
            1_500,
        )]));
        let registry = Arc::new(CapabilityRegistry::new(
            Arc::clone(&store) as Arc<dyn BehaviorStore>
        ));
        store.gate.notify_one();
        registry.refresh().await.unwrap();

        let held = registry.snapshot();
        store.catalog.lock().unwrap().clear();
        let pending = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.refresh().await })
        };
        tokio::task::yield_now().await;

        // Scan is parked on the gate: the old generation is still served.
        assert_eq!(registry.lookup("wave").unwrap().name, "wave");

        store.gate.notify_one();
        let fresh = pending.await.unwrap().unwrap();
        assert_eq!(fresh.generation(), 2);
        assert!(registry.lookup("wave").is_err());
        assert!(held.lookup("wave").is_some());
    }

    #[tokio::test]
    async fn invalidate_triggers_background_refresh() {
        let sim = Arc::new(SimPlatform::new());
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let registry = Arc::new(
            CapabilityRegistry::new(Arc::clone(&sim) as Arc<dyn BehaviorStore>).with_bus(bus),
        );
        let cancel = CancellationToken::new();
        let task = registry.spawn_refresher(Duration::from_secs(3600), cancel.clone());

        sim.set_catalog(vec![BehaviorDescriptor::recorded(
            "bow",
            BehaviorCategory::Gesture,
            800,
        )]);
        registry.invalidate();
        let event = tokio::time::timeout(Duration::from_secs(1), alerts.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::BehaviorsRefreshed { generation: 1, .. }
        ));
        assert!(registry.lookup("bow").is_ok());

        cancel.cancel();
        task.await.unwrap();
    }
}

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cart::CartAggregator;
use crate::clock::Clock;
use crate::engine::{AvailabilityEngine, BundleExpander, Catalog, InventoryLedger, ReservationEngine, Store};
use crate::fields::CustomFieldChecker;
use crate::hours::OpeningWindowOracle;
use crate::model::ConflictGranularity;
use crate::notify::NotifyHub;
use crate::reaper;

/// Every engine component, wired once over one store.
pub struct Services {
    pub store: Arc<Store>,
    pub availability: Arc<AvailabilityEngine>,
    pub ledger: Arc<InventoryLedger>,
    pub bundles: Arc<BundleExpander>,
    pub catalog: Arc<Catalog>,
    pub reservations: Arc<ReservationEngine>,
    pub cart: Arc<CartAggregator>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    /// Replay the WAL at `wal_path` and build the components on top of it.
    pub fn start(
        wal_path: &Path,
        granularity: ConflictGranularity,
        hours: Arc<dyn OpeningWindowOracle>,
        fields: Arc<dyn CustomFieldChecker>,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let notify = Arc::new(NotifyHub::new());
        let store = Arc::new(Store::open(wal_path, notify)?);
        let availability = Arc::new(AvailabilityEngine::new(store.clone(), granularity));
        let ledger = Arc::new(InventoryLedger::new(store.clone()));
        let bundles = Arc::new(BundleExpander::new(store.clone(), availability.clone(), ledger.clone()));
        let catalog = Arc::new(Catalog::new(store.clone(), ledger.clone()));
        let reservations = Arc::new(ReservationEngine::new(
            store.clone(),
            availability.clone(),
            ledger.clone(),
            bundles.clone(),
            hours.clone(),
            fields,
            clock.clone(),
        ));
        let cart = Arc::new(CartAggregator::new(reservations.clone(), availability.clone(), hours));

        Ok(Self {
            store,
            availability,
            ledger,
            bundles,
            catalog,
            reservations,
            cart,
            clock,
        })
    }

    /// Spawn the overdue sweeper and the WAL compactor.
    pub fn spawn_jobs(&self, sweep_every: Duration, compact_threshold: u64) {
        let reservations = self.reservations.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            reaper::run_overdue_sweeper(reservations, clock, sweep_every).await;
        });
        let store = self.store.clone();
        tokio::spawn(async move {
            reaper::run_compactor(store, compact_threshold).await;
        });
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::limits::MAX_CALENDAR_DAYS;
use crate::model::*;

use super::{EngineError, Store};

/// Read access to inventory slots: either the locked copies inside a
/// transaction or a read snapshot taken for a query.
pub(crate) trait SlotSource {
    fn slot(&self, key: &SlotKey) -> Option<&InventorySlot>;
}

/// Read locks on a set of slots, held for the duration of one query.
pub(crate) struct SlotSnapshot {
    guards: BTreeMap<SlotKey, OwnedRwLockReadGuard<InventorySlot>>,
}

impl SlotSnapshot {
    /// Acquire read locks in key order. Slots that don't exist yet are simply absent.
    pub(crate) async fn take(store: &Store, keys: impl IntoIterator<Item = SlotKey>) -> Self {
        let keys: BTreeSet<SlotKey> = keys.into_iter().collect();
        let mut guards = BTreeMap::new();
        for key in keys {
            if let Some(slot) = store.slot(&key) {
                guards.insert(key, slot.read_owned().await);
            }
        }
        Self { guards }
    }
}

impl SlotSource for SlotSnapshot {
    fn slot(&self, key: &SlotKey) -> Option<&InventorySlot> {
        self.guards.get(key).map(|g| &**g)
    }
}

/// Complete bundles buildable from `(free units, units per bundle)` of each
/// required component. No required components means no bundles.
pub fn possible_bundles(components: impl IntoIterator<Item = (u32, u32)>) -> u32 {
    components
        .into_iter()
        .filter(|(_, per_bundle)| *per_bundle > 0)
        .map(|(free, per_bundle)| free / per_bundle)
        .min()
        .unwrap_or(0)
}

/// Answers how many units of a model a location can lend.
pub struct AvailabilityEngine {
    store: Arc<Store>,
    granularity: ConflictGranularity,
}

impl AvailabilityEngine {
    pub fn new(store: Arc<Store>, granularity: ConflictGranularity) -> Self {
        Self { store, granularity }
    }

    pub fn granularity(&self) -> ConflictGranularity {
        self.granularity
    }

    // ── Queries ──────────────────────────────────────────────

    /// Units the location owns and can lend, ignoring dates.
    pub async fn available_units(&self, model_id: Ulid, location_id: Ulid) -> Result<u32, EngineError> {
        let (model, snapshot) = self.snapshot(model_id, location_id).await?;
        self.supply_in(&snapshot, &model, location_id)
    }

    /// Units already promised to active loans overlapping `period`.
    pub async fn conflicting_units(
        &self,
        model_id: Ulid,
        location_id: Ulid,
        period: Period,
    ) -> Result<u32, EngineError> {
        let (model, snapshot) = self.snapshot(model_id, location_id).await?;
        self.conflicting_in(&snapshot, &model, location_id, &period)
    }

    pub async fn free_units(&self, model_id: Ulid, location_id: Ulid, period: Period) -> Result<u32, EngineError> {
        let (model, snapshot) = self.snapshot(model_id, location_id).await?;
        self.free_in(&snapshot, &model, location_id, &period)
    }

    /// Advisory check; reservations repeat it under the slot locks.
    pub async fn assert_available(
        &self,
        model_id: Ulid,
        location_id: Ulid,
        period: Period,
        quantity: u32,
    ) -> Result<(), EngineError> {
        let (model, snapshot) = self.snapshot(model_id, location_id).await?;
        self.assert_available_in(&snapshot, &model, location_id, &period, quantity)
    }

    pub async fn conflicts_on_date(&self, model_id: Ulid, location_id: Ulid, date: NaiveDate) -> Result<u32, EngineError> {
        self.conflicting_units(model_id, location_id, Period::day(date)).await
    }

    /// Free units per day over `[first_day, last_day]`, read from one snapshot.
    pub async fn calendar(
        &self,
        model_id: Ulid,
        location_id: Ulid,
        first_day: NaiveDate,
        last_day: NaiveDate,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        if last_day < first_day {
            return Err(EngineError::Validation("calendar ends before it starts".into()));
        }
        if (last_day - first_day).num_days() + 1 > MAX_CALENDAR_DAYS {
            return Err(EngineError::LimitExceeded("calendar range too long"));
        }
        let (model, snapshot) = self.snapshot(model_id, location_id).await?;
        first_day
            .iter_days()
            .take_while(|d| *d <= last_day)
            .map(|date| {
                let free = self.free_in(&snapshot, &model, location_id, &Period::day(date))?;
                Ok(DayAvailability { date, free })
            })
            .collect()
    }

    async fn snapshot(&self, model_id: Ulid, location_id: Ulid) -> Result<(AssetModel, SlotSnapshot), EngineError> {
        self.store.location(location_id)?;
        let model = self.store.model(model_id)?;
        let keys = match model.kind {
            TrackingKind::Bundle => {
                let definition = self.store.bundle_for(model.id, location_id)?;
                definition
                    .required()
                    .map(|c| SlotKey::new(c.model_id, location_id))
                    .collect()
            }
            _ => vec![SlotKey::new(model.id, location_id)],
        };
        let snapshot = SlotSnapshot::take(&self.store, keys).await;
        Ok((model, snapshot))
    }

    // ── Shared math over any slot source ─────────────────────

    pub(crate) fn supply_in(&self, src: &impl SlotSource, model: &AssetModel, location_id: Ulid) -> Result<u32, EngineError> {
        let slot = src.slot(&SlotKey::new(model.id, location_id));
        match model.kind {
            TrackingKind::Serialized => Ok(slot.map_or(0, InventorySlot::active_assets)),
            TrackingKind::Bulk => Ok(slot.and_then(|s| s.stock).map_or(0, |e| e.available())),
            TrackingKind::Bundle => self.bundle_count(model, location_id, |component| {
                self.supply_in(src, component, location_id)
            }),
        }
    }

    pub(crate) fn conflicting_in(
        &self,
        src: &impl SlotSource,
        model: &AssetModel,
        location_id: Ulid,
        period: &Period,
    ) -> Result<u32, EngineError> {
        match model.kind {
            TrackingKind::Serialized => Ok(src
                .slot(&SlotKey::new(model.id, location_id))
                .map_or(0, |s| s.overlapping(period, self.granularity).count() as u32)),
            TrackingKind::Bulk => Ok(0),
            TrackingKind::Bundle => {
                let supply = self.supply_in(src, model, location_id)?;
                let free = self.free_in(src, model, location_id, period)?;
                Ok(supply.saturating_sub(free))
            }
        }
    }

    pub(crate) fn free_in(
        &self,
        src: &impl SlotSource,
        model: &AssetModel,
        location_id: Ulid,
        period: &Period,
    ) -> Result<u32, EngineError> {
        match model.kind {
            TrackingKind::Serialized => {
                let supply = self.supply_in(src, model, location_id)?;
                let taken = self.conflicting_in(src, model, location_id, period)?;
                Ok(supply.saturating_sub(taken))
            }
            TrackingKind::Bulk => self.supply_in(src, model, location_id),
            TrackingKind::Bundle => self.bundle_count(model, location_id, |component| {
                self.free_in(src, component, location_id, period)
            }),
        }
    }

    pub(crate) fn assert_available_in(
        &self,
        src: &impl SlotSource,
        model: &AssetModel,
        location_id: Ulid,
        period: &Period,
        quantity: u32,
    ) -> Result<(), EngineError> {
        let free = self.free_in(src, model, location_id, period)?;
        if free < quantity {
            return Err(EngineError::InsufficientAvailability {
                model_id: model.id,
                requested: quantity,
                available: free,
            });
        }
        Ok(())
    }

    fn bundle_count(
        &self,
        model: &AssetModel,
        location_id: Ulid,
        units_of: impl Fn(&AssetModel) -> Result<u32, EngineError>,
    ) -> Result<u32, EngineError> {
        let definition = self.store.bundle_for(model.id, location_id)?;
        let mut components = Vec::new();
        for item in definition.required() {
            let component = self.store.model(item.model_id)?;
            if component.kind == TrackingKind::Bundle {
                return Err(EngineError::Validation("nested bundles are not supported".into()));
            }
            components.push((units_of(&component)?, item.quantity));
        }
        Ok(possible_bundles(components))
    }
}

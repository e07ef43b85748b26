use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::SlotSource;
use super::{EngineError, InventoryLedger, Store};

fn validate_name(what: &'static str, name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// Locations, borrowers, models, assets, bulk stock counts and bundle definitions.
pub struct Catalog {
    store: Arc<Store>,
    ledger: Arc<InventoryLedger>,
}

impl Catalog {
    pub fn new(store: Arc<Store>, ledger: Arc<InventoryLedger>) -> Self {
        Self { store, ledger }
    }

    async fn commit_one(&self, event: Event) -> Result<(), EngineError> {
        let mut txn = self.store.begin().await;
        txn.stage(event);
        txn.commit(&self.store).await
    }

    pub async fn register_location(&self, name: &str) -> Result<Ulid, EngineError> {
        validate_name("location name", name)?;
        let location = Location {
            id: Ulid::new(),
            name: name.to_string(),
        };
        let id = location.id;
        self.commit_one(Event::LocationRegistered { location }).await?;
        info!(location_id = %id, name, "location registered");
        Ok(id)
    }

    pub async fn register_borrower(&self, name: &str) -> Result<Ulid, EngineError> {
        validate_name("borrower name", name)?;
        let borrower = Borrower {
            id: Ulid::new(),
            name: name.to_string(),
        };
        let id = borrower.id;
        self.commit_one(Event::BorrowerRegistered { borrower }).await?;
        Ok(id)
    }

    pub async fn register_model(
        &self,
        manufacturer: &str,
        category: &str,
        name: &str,
        kind: TrackingKind,
    ) -> Result<Ulid, EngineError> {
        validate_name("model name", name)?;
        if manufacturer.len() > MAX_NAME_LEN || category.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        let model = AssetModel {
            id: Ulid::new(),
            manufacturer: manufacturer.to_string(),
            category: category.to_string(),
            name: name.to_string(),
            kind,
        };
        let id = model.id;
        self.commit_one(Event::ModelRegistered { model }).await?;
        info!(model_id = %id, name, kind = kind.as_str(), "model registered");
        Ok(id)
    }

    /// Add one physical unit of a serialized model to a location. New assets are active.
    pub async fn register_asset(&self, model_id: Ulid, location_id: Ulid, tag: Option<&str>) -> Result<Ulid, EngineError> {
        let model = self.store.model(model_id)?;
        if model.kind != TrackingKind::Serialized {
            return Err(EngineError::Validation(format!(
                "assets can only be registered for serialized models, {} is {}",
                model.id,
                model.kind.as_str()
            )));
        }
        self.store.location(location_id)?;
        if tag.is_some_and(|t| t.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("asset tag too long"));
        }

        let asset = Asset {
            id: Ulid::new(),
            model_id,
            location_id,
            tag: tag.map(str::to_string),
            active: true,
            on_loan: None,
        };
        let id = asset.id;
        let mut txn = self.store.begin().await;
        txn.lock_slots(&self.store, [SlotKey::new(model_id, location_id)]).await?;
        txn.stage(Event::AssetRegistered { asset });
        txn.commit(&self.store).await?;
        Ok(id)
    }

    /// Take an asset out of circulation or bring it back.
    pub async fn set_asset_active(&self, asset_id: Ulid, active: bool) -> Result<(), EngineError> {
        let key = self
            .store
            .asset_slot(asset_id)
            .ok_or(EngineError::NotFound("asset", asset_id))?;
        let mut txn = self.store.begin().await;
        txn.lock_slots(&self.store, [key]).await?;
        let current = txn
            .slot(&key)
            .and_then(|s| s.assets.get(&asset_id))
            .map(|a| a.active)
            .ok_or(EngineError::NotFound("asset", asset_id))?;
        if current == active {
            return Ok(());
        }
        txn.stage(Event::AssetActivationChanged { key, asset_id, active });
        txn.commit(&self.store).await?;
        info!(%asset_id, active, "asset activation changed");
        Ok(())
    }

    /// Record the number of units of a bulk model owned at a location.
    pub async fn set_stock_total(&self, model_id: Ulid, location_id: Ulid, total: u32) -> Result<(), EngineError> {
        let model = self.store.model(model_id)?;
        if model.kind != TrackingKind::Bulk {
            return Err(EngineError::Validation(format!(
                "stock totals only apply to bulk models, {} is {}",
                model.id,
                model.kind.as_str()
            )));
        }
        self.store.location(location_id)?;
        let mut txn = self.store.begin().await;
        txn.lock_slots(&self.store, [SlotKey::new(model_id, location_id)]).await?;
        self.ledger.set_total(&mut txn, model_id, location_id, total);
        txn.commit(&self.store).await?;
        info!(%model_id, %location_id, total, "stock total set");
        Ok(())
    }

    /// Define (or redefine) what a bundle model consists of at a location.
    /// Redefining keeps the definition id; loans already reserved are untouched.
    pub async fn define_bundle(
        &self,
        model_id: Ulid,
        location_id: Ulid,
        items: Vec<BundleItem>,
    ) -> Result<Ulid, EngineError> {
        let model = self.store.model(model_id)?;
        if model.kind != TrackingKind::Bundle {
            return Err(EngineError::Validation(format!("model {model_id} is not a bundle")));
        }
        self.store.location(location_id)?;
        if items.len() > MAX_BUNDLE_ITEMS {
            return Err(EngineError::LimitExceeded("too many bundle components"));
        }
        let mut seen = HashSet::new();
        for item in &items {
            if item.quantity == 0 {
                return Err(EngineError::Validation("bundle component quantity must be at least 1".into()));
            }
            if !seen.insert(item.model_id) {
                return Err(EngineError::Validation(format!(
                    "model {} listed twice in bundle",
                    item.model_id
                )));
            }
            let component = self.store.model(item.model_id)?;
            if component.kind == TrackingKind::Bundle {
                return Err(EngineError::Validation("nested bundles are not supported".into()));
            }
        }

        let id = self
            .store
            .bundle_index
            .get(&SlotKey::new(model_id, location_id))
            .map(|e| *e.value())
            .unwrap_or_else(Ulid::new);
        let definition = BundleDefinition {
            id,
            model_id,
            location_id,
            items,
        };
        self.commit_one(Event::BundleDefined { definition }).await?;
        info!(bundle_id = %id, %model_id, %location_id, "bundle defined");
        Ok(id)
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn location(&self, id: Ulid) -> Result<Location, EngineError> {
        self.store.location(id)
    }

    pub fn borrower(&self, id: Ulid) -> Result<Borrower, EngineError> {
        self.store.borrower(id)
    }

    pub fn model(&self, id: Ulid) -> Result<AssetModel, EngineError> {
        self.store.model(id)
    }

    pub fn bundle(&self, model_id: Ulid, location_id: Ulid) -> Result<BundleDefinition, EngineError> {
        self.store.bundle_for(model_id, location_id)
    }

    pub fn models(&self) -> Vec<AssetModel> {
        let mut models: Vec<AssetModel> = self.store.models.iter().map(|e| e.value().clone()).collect();
        models.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
        models
    }

    /// Assets of a serialized model at a location, in id order.
    pub async fn assets(&self, model_id: Ulid, location_id: Ulid) -> Vec<Asset> {
        let Some(slot) = self.store.slot(&SlotKey::new(model_id, location_id)) else {
            return Vec::new();
        };
        let guard = slot.read().await;
        guard.assets.values().cloned().collect()
    }

    pub async fn asset(&self, asset_id: Ulid) -> Result<Asset, EngineError> {
        let key = self
            .store
            .asset_slot(asset_id)
            .ok_or(EngineError::NotFound("asset", asset_id))?;
        let slot = self.store.slot(&key).ok_or(EngineError::NotFound("asset", asset_id))?;
        let guard = slot.read().await;
        guard
            .assets
            .get(&asset_id)
            .cloned()
            .ok_or(EngineError::NotFound("asset", asset_id))
    }
}

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::hours::WindowKind;
use crate::model::*;
use crate::observability;

use super::availability::SlotSource;
use super::conflict::require_open;
use super::reservation::{require_status, transition};
use super::txn::Txn;
use super::{EngineError, ReservationEngine};

/// Which items a return settles.
enum Settle<'a> {
    Everything,
    Items(&'a [Ulid]),
}

impl ReservationEngine {
    /// Hand a reserved loan to the borrower, binding a physical asset to every
    /// serialized item.
    pub async fn hand_over_loan(&self, loan_id: Ulid, lines: &[HandoverLine], actor: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.try_hand_over(loan_id, lines, actor).await;
        observability::record("hand_over_loan", started, &result);
        result
    }

    async fn try_hand_over(&self, loan_id: Ulid, lines: &[HandoverLine], actor: Ulid) -> Result<(), EngineError> {
        let mut txn = self.store.begin().await;
        let loan = txn.lock_loan(&self.store, loan_id).await?;
        require_status(&loan, &[LoanStatus::Reserved], "hand over")?;

        let mut by_item: HashMap<Ulid, &HandoverLine> = HashMap::with_capacity(lines.len());
        for line in lines {
            let item = loan
                .item(line.item_id)
                .ok_or(EngineError::NotFound("loan item", line.item_id))?;
            if line.asset_id.is_some() && !item.needs_asset() {
                return Err(EngineError::AssetMismatch {
                    item_id: item.id,
                    asset_id: line.asset_id,
                    reason: "item is not a serialized unit",
                });
            }
            by_item.insert(line.item_id, line);
        }

        txn.lock_slots(&self.store, loan.slot_keys()).await?;

        let mut bound = HashSet::new();
        let mut bindings = Vec::new();
        for item in &loan.items {
            let line = by_item.get(&item.id);
            let condition = line.and_then(|l| l.condition);
            if !item.needs_asset() {
                if condition.is_some() {
                    txn.stage(Event::ItemBound {
                        loan_id,
                        item_id: item.id,
                        asset_id: None,
                        condition,
                    });
                }
                continue;
            }
            let asset_id = line
                .and_then(|l| l.asset_id)
                .ok_or(EngineError::AssetMismatch {
                    item_id: item.id,
                    asset_id: None,
                    reason: "a serialized item needs an asset",
                })?;
            if !bound.insert(asset_id) {
                return Err(EngineError::AssetMismatch {
                    item_id: item.id,
                    asset_id: Some(asset_id),
                    reason: "asset is bound to two items",
                });
            }
            self.check_asset(&txn, &loan, item, asset_id)?;
            txn.stage(Event::ItemBound {
                loan_id,
                item_id: item.id,
                asset_id: Some(asset_id),
                condition,
            });
            bindings.push(json!({ "item_id": item.id, "asset_id": asset_id }));
        }

        for asset_id in &bound {
            if !self.fields.required_fields_satisfied(*asset_id).await {
                return Err(EngineError::MissingRequiredField(*asset_id));
            }
        }

        txn.stage(Event::LoanHandedOver { loan_id });
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::HandedOver,
            actor,
            None,
            json!({ "bindings": bindings }),
        );
        txn.commit(&self.store).await?;

        transition("handed_over");
        info!(%loan_id, assets = bound.len(), "loan handed over");
        Ok(())
    }

    fn check_asset(&self, txn: &Txn, loan: &Loan, item: &LoanItem, asset_id: Ulid) -> Result<(), EngineError> {
        let mismatch = |reason| EngineError::AssetMismatch {
            item_id: item.id,
            asset_id: Some(asset_id),
            reason,
        };
        let key = SlotKey::new(item.model_id, loan.location_id);
        let Some(asset) = txn.slot(&key).and_then(|s| s.assets.get(&asset_id)) else {
            return Err(match self.store.asset_slot(asset_id) {
                None => mismatch("asset does not exist"),
                Some(other) if other.location_id != loan.location_id => {
                    mismatch("asset belongs to another location")
                }
                Some(_) => mismatch("asset is a different model"),
            });
        };
        if !asset.active {
            return Err(mismatch("asset is inactive"));
        }
        if asset.on_loan.is_some() {
            return Err(mismatch("asset is out on another loan"));
        }
        Ok(())
    }

    /// Settle every open item of a handed-over or overdue loan.
    pub async fn return_loan(&self, loan_id: Ulid, lines: &[ReturnLine], actor: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.settle(loan_id, Settle::Everything, lines, actor).await;
        observability::record("return_loan", started, &result);
        result
    }

    /// Settle the named items. The loan is returned once no item is still out.
    pub async fn return_loan_items(
        &self,
        loan_id: Ulid,
        item_ids: &[Ulid],
        lines: &[ReturnLine],
        actor: Ulid,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = if item_ids.is_empty() {
            Err(EngineError::Validation("no items to return".into()))
        } else {
            self.settle(loan_id, Settle::Items(item_ids), lines, actor).await
        };
        observability::record("return_loan_items", started, &result);
        result
    }

    async fn settle(&self, loan_id: Ulid, which: Settle<'_>, lines: &[ReturnLine], actor: Ulid) -> Result<(), EngineError> {
        let mut txn = self.store.begin().await;
        let loan = txn.lock_loan(&self.store, loan_id).await?;
        require_status(&loan, &[LoanStatus::HandedOver, LoanStatus::Overdue], "return")?;
        let now = self.clock.now();
        require_open(&*self.hours, loan.location_id, now, WindowKind::Return).await?;

        let mut conditions: HashMap<Ulid, Condition> = HashMap::with_capacity(lines.len());
        for line in lines {
            if loan.item(line.item_id).is_none() {
                return Err(EngineError::NotFound("loan item", line.item_id));
            }
            conditions.insert(line.item_id, line.condition);
        }

        let targets = settle_targets(&loan, &which)?;
        txn.lock_slots(&self.store, loan.slot_keys()).await?;

        let location_id = loan.location_id;
        let mut settled = Vec::with_capacity(targets.len());
        for item in &targets {
            let condition = conditions
                .get(&item.id)
                .or_else(|| item.parent_id.and_then(|p| conditions.get(&p)))
                .copied()
                .unwrap_or_default();
            if item.is_bulk() {
                if condition.takes_out_of_service() {
                    self.ledger.write_off(&mut txn, item.model_id, location_id, item.quantity);
                } else {
                    self.ledger
                        .increase_available(&mut txn, item.model_id, location_id, item.quantity);
                }
            }
            txn.stage(Event::LoanItemSettled {
                loan_id,
                item_id: item.id,
                status: condition.settles_as(),
                condition: Some(condition),
            });
            if let Some(asset_id) = item.asset_id
                && condition.takes_out_of_service()
            {
                txn.stage(Event::AssetActivationChanged {
                    key: SlotKey::new(item.model_id, location_id),
                    asset_id,
                    active: false,
                });
            }
            settled.push(json!({ "item_id": item.id, "condition": condition.as_str() }));
        }

        // A bundle root settles once none of its components is still out.
        let roots: Vec<Ulid> = txn
            .loan()
            .map(|l| {
                l.items
                    .iter()
                    .filter(|i| i.item_type == ItemType::BundleRoot && i.status.is_open())
                    .filter(|root| l.components_of(root.id).all(|c| !c.status.is_open()))
                    .map(|root| root.id)
                    .collect()
            })
            .unwrap_or_default();
        for root_id in roots {
            let condition = conditions.get(&root_id).copied().unwrap_or_default();
            txn.stage(Event::LoanItemSettled {
                loan_id,
                item_id: root_id,
                status: condition.settles_as(),
                condition: Some(condition),
            });
        }

        let remaining = txn.loan().map_or(0, Loan::open_items);
        if remaining == 0 {
            txn.stage(Event::LoanReturned { loan_id });
        }
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::Returned,
            actor,
            None,
            json!({ "items": settled, "complete": remaining == 0 }),
        );
        txn.commit(&self.store).await?;

        if remaining == 0 {
            transition("returned");
            info!(%loan_id, "loan returned");
        } else {
            info!(%loan_id, remaining, "loan partially returned");
        }
        Ok(())
    }
}

/// Non-root items a return settles, in loan order.
fn settle_targets(loan: &Loan, which: &Settle<'_>) -> Result<Vec<LoanItem>, EngineError> {
    match which {
        Settle::Everything => Ok(loan
            .items
            .iter()
            .filter(|i| i.status.is_open() && i.item_type != ItemType::BundleRoot)
            .cloned()
            .collect()),
        Settle::Items(ids) => {
            let mut wanted = HashSet::new();
            for id in *ids {
                let item = loan.item(*id).ok_or(EngineError::NotFound("loan item", *id))?;
                if !item.status.is_open() {
                    return Err(EngineError::Validation(format!("item {id} is already returned")));
                }
                if item.item_type == ItemType::BundleRoot {
                    wanted.extend(loan.components_of(item.id).filter(|c| c.status.is_open()).map(|c| c.id));
                } else {
                    wanted.insert(item.id);
                }
            }
            Ok(loan.items.iter().filter(|i| wanted.contains(&i.id)).cloned().collect())
        }
    }
}

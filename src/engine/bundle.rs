use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;

use super::txn::Txn;
use super::{AvailabilityEngine, EngineError, InventoryLedger, Store};

/// Turns a bundle request into a root item plus its component items.
pub struct BundleExpander {
    store: Arc<Store>,
    availability: Arc<AvailabilityEngine>,
    ledger: Arc<InventoryLedger>,
}

impl BundleExpander {
    pub fn new(store: Arc<Store>, availability: Arc<AvailabilityEngine>, ledger: Arc<InventoryLedger>) -> Self {
        Self {
            store,
            availability,
            ledger,
        }
    }

    /// Stage a bundle root and its components on `loan_id`. The caller holds the
    /// locks on every component slot. Returns the root item id.
    pub(crate) fn reserve_bundle(
        &self,
        txn: &mut Txn,
        loan_id: Ulid,
        definition: &BundleDefinition,
        period: &Period,
        optional: &[Ulid],
    ) -> Result<Ulid, EngineError> {
        for model_id in optional {
            if !definition.items.iter().any(|c| c.optional && c.model_id == *model_id) {
                return Err(EngineError::Validation(format!(
                    "model {model_id} is not an optional component of bundle {}",
                    definition.model_id
                )));
            }
        }
        let location_id = definition.location_id;
        // Only required components make a bundle lendable.
        if definition.required().next().is_none() {
            return Err(EngineError::InsufficientAvailability {
                model_id: definition.model_id,
                requested: 1,
                available: 0,
            });
        }

        let root = LoanItem::new(ItemType::BundleRoot, TrackingKind::Bundle, definition.model_id, 1, None);
        let root_id = root.id;
        txn.stage(Event::LoanItemAllocated { loan_id, item: root });

        for component in definition
            .items
            .iter()
            .filter(|c| !c.optional || optional.contains(&c.model_id))
        {
            let model = self.store.model(component.model_id)?;
            self.availability
                .assert_available_in(&*txn, &model, location_id, period, component.quantity)?;
            match model.kind {
                TrackingKind::Serialized => {
                    for _ in 0..component.quantity {
                        let item = LoanItem::new(
                            ItemType::BundleComponent,
                            TrackingKind::Serialized,
                            model.id,
                            1,
                            Some(root_id),
                        );
                        txn.stage(Event::LoanItemAllocated { loan_id, item });
                    }
                }
                TrackingKind::Bulk => {
                    self.ledger
                        .decrease_available(txn, model.id, location_id, component.quantity)?;
                    let item = LoanItem::new(
                        ItemType::BundleComponent,
                        TrackingKind::Bulk,
                        model.id,
                        component.quantity,
                        Some(root_id),
                    );
                    txn.stage(Event::LoanItemAllocated { loan_id, item });
                }
                TrackingKind::Bundle => {
                    return Err(EngineError::Validation("nested bundles are not supported".into()));
                }
            }
        }
        Ok(root_id)
    }

    /// Stage removal of a bundle root and all its components, returning bulk
    /// components to the shelf. Returns the removed item ids.
    pub(crate) fn release_bundle(&self, txn: &mut Txn, loan_id: Ulid, root_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let loan = txn.loan().ok_or(EngineError::NotFound("loan", loan_id))?;
        let location_id = loan.location_id;
        let components: Vec<LoanItem> = loan.components_of(root_id).cloned().collect();

        let mut removed = Vec::with_capacity(components.len() + 1);
        for component in components {
            if component.is_bulk() && component.status.is_open() {
                self.ledger
                    .increase_available(txn, component.model_id, location_id, component.quantity);
            }
            txn.stage(Event::LoanItemRemoved {
                loan_id,
                item_id: component.id,
            });
            removed.push(component.id);
        }
        txn.stage(Event::LoanItemRemoved { loan_id, item_id: root_id });
        removed.push(root_id);
        Ok(removed)
    }
}

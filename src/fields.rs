use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

/// Consulted at hand-over: has every required custom field of the asset a value?
#[async_trait]
pub trait CustomFieldChecker: Send + Sync {
    async fn required_fields_satisfied(&self, asset_id: Ulid) -> bool;
}

pub struct NoRequiredFields;

#[async_trait]
impl CustomFieldChecker for NoRequiredFields {
    async fn required_fields_satisfied(&self, _asset_id: Ulid) -> bool {
        true
    }
}

/// Required field names per model and recorded values per asset.
#[derive(Default)]
pub struct FieldRegistry {
    required: DashMap<Ulid, Vec<String>>,
    asset_models: DashMap<Ulid, Ulid>,
    values: DashMap<Ulid, HashMap<String, String>>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(&self, model_id: Ulid, field: &str) {
        let mut fields = self.required.entry(model_id).or_default();
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
    }

    pub fn track_asset(&self, asset_id: Ulid, model_id: Ulid) {
        self.asset_models.insert(asset_id, model_id);
    }

    pub fn record(&self, asset_id: Ulid, field: &str, value: &str) {
        self.values
            .entry(asset_id)
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    /// Required fields of the asset's model with no non-blank value.
    pub fn missing_fields(&self, asset_id: Ulid) -> Vec<String> {
        let Some(model_id) = self.asset_models.get(&asset_id).map(|m| *m.value()) else {
            return Vec::new();
        };
        let Some(required) = self.required.get(&model_id) else {
            return Vec::new();
        };
        let values = self.values.get(&asset_id);
        required
            .iter()
            .filter(|field| {
                values
                    .as_ref()
                    .and_then(|v| v.get(field.as_str()))
                    .is_none_or(|v| v.trim().is_empty())
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CustomFieldChecker for FieldRegistry {
    async fn required_fields_satisfied(&self, asset_id: Ulid) -> bool {
        self.missing_fields(asset_id).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn untracked_asset_has_no_requirements() {
        let registry = FieldRegistry::new();
        assert!(registry.required_fields_satisfied(Ulid::new()).await);
    }

    #[tokio::test]
    async fn missing_and_blank_values_fail() {
        let registry = FieldRegistry::new();
        let model = Ulid::new();
        let asset = Ulid::new();
        registry.require(model, "serial_number");
        registry.require(model, "firmware");
        registry.track_asset(asset, model);
        registry.record(asset, "serial_number", "SN-1");
        registry.record(asset, "firmware", "   ");

        assert_eq!(registry.missing_fields(asset), vec!["firmware".to_string()]);
        assert!(!registry.required_fields_satisfied(asset).await);

        registry.record(asset, "firmware", "2.1");
        assert!(registry.required_fields_satisfied(asset).await);
    }

    #[test]
    fn require_is_idempotent() {
        let registry = FieldRegistry::new();
        let model = Ulid::new();
        let asset = Ulid::new();
        registry.require(model, "serial_number");
        registry.require(model, "serial_number");
        registry.track_asset(asset, model);
        assert_eq!(registry.missing_fields(asset).len(), 1);
    }
}

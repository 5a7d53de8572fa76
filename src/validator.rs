//! Checks a STAC document must pass before it is queued for publishing.
//!
//! Three stages, all reported together: structure, the target collection
//! exists in the catalog, and every asset can be fetched. The validator
//! never writes to the catalog.

use anyhow::Result;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::catalog::CatalogStore;
use crate::model::{FailureReason, ValidationResult};
use crate::probe::AssetProbe;
use crate::stac;

#[derive(Clone)]
pub struct Validator {
    catalog: Arc<dyn CatalogStore>,
    probe: Arc<dyn AssetProbe>,
    check_assets: bool,
}

impl Validator {
    pub fn new(catalog: Arc<dyn CatalogStore>, probe: Arc<dyn AssetProbe>, check_assets: bool) -> Self {
        Self {
            catalog,
            probe,
            check_assets,
        }
    }

    /// Validate an Item. `Err` only for infrastructure failures (catalog
    /// unavailable); document problems come back as a failed result.
    #[instrument(skip_all, fields(item_id = item.get("id").and_then(serde_json::Value::as_str).unwrap_or("")))]
    pub async fn validate_item(&self, item: &Value) -> Result<ValidationResult> {
        let mut reasons: Vec<FailureReason> = stac::validate_item(item)
            .into_iter()
            .map(FailureReason::spec)
            .collect();

        if let Some(collection) = item.get("collection").and_then(Value::as_str) {
            if !self.catalog.collection_exists(collection).await? {
                reasons.push(FailureReason::missing_collection(format!(
                    "collection {collection} does not exist"
                )));
            }
        }

        if self.check_assets {
            reasons.extend(self.check_hrefs(item).await);
        }

        debug!(reasons = reasons.len(), "item validated");
        Ok(ValidationResult::from_reasons(reasons))
    }

    /// Validate a Collection document. Only structure is checked; a
    /// collection may introduce itself.
    pub fn validate_collection(&self, collection: &Value) -> ValidationResult {
        ValidationResult::from_reasons(
            stac::validate_collection(collection)
                .into_iter()
                .map(FailureReason::spec)
                .collect(),
        )
    }

    async fn check_hrefs(&self, item: &Value) -> Vec<FailureReason> {
        let hrefs = stac::asset_hrefs(item);
        let checks = hrefs.iter().map(|(key, href)| {
            let probe = Arc::clone(&self.probe);
            async move {
                probe
                    .check(href)
                    .await
                    .map_err(|e| FailureReason::unreachable(format!("asset {key}: {e}")))
            }
        });
        join_all(checks)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::db;
    use crate::model::FailureKind;
    use crate::stac::fixtures;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProbe {
        broken: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetProbe for FakeProbe {
        async fn check(&self, href: &str) -> Result<(), String> {
            self.seen.lock().unwrap().push(href.to_string());
            if self.broken.iter().any(|b| b == href) {
                Err("HTTP 404".to_string())
            } else {
                Ok(())
            }
        }

        async fn check_cog(&self, href: &str) -> Result<(), String> {
            self.check(href).await
        }
    }

    async fn validator(probe: Arc<FakeProbe>, with_collection: bool) -> Validator {
        let pool = db::memory_pool().await.unwrap();
        let catalog = SqliteCatalog::new(pool);
        if with_collection {
            catalog.upsert_collection(&fixtures::collection()).await.unwrap();
        }
        Validator::new(Arc::new(catalog), probe, true)
    }

    #[tokio::test]
    async fn good_item_passes() {
        let probe = Arc::new(FakeProbe::default());
        let v = validator(probe.clone(), true).await;
        let result = v.validate_item(&fixtures::item()).await.unwrap();
        assert!(result.passed, "{:?}", result.reasons);
        assert_eq!(probe.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn every_stage_reports() {
        let mut item = fixtures::item();
        item["properties"]["datetime"] = "yesterday".into();
        let broken = item["assets"]["visual"]["href"].as_str().unwrap().to_string();
        let probe = Arc::new(FakeProbe {
            broken: vec![broken],
            ..Default::default()
        });
        let v = validator(probe, false).await;

        let result = v.validate_item(&item).await.unwrap();
        assert!(!result.passed);
        let kinds: Vec<FailureKind> = result.reasons.iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&FailureKind::SpecViolation));
        assert!(kinds.contains(&FailureKind::MissingCollection));
        assert!(kinds.contains(&FailureKind::UnreachableAsset));
    }

    #[tokio::test]
    async fn asset_checks_can_be_disabled() {
        let probe = Arc::new(FakeProbe::default());
        let pool = db::memory_pool().await.unwrap();
        let catalog = SqliteCatalog::new(pool);
        catalog.upsert_collection(&fixtures::collection()).await.unwrap();
        let v = Validator::new(Arc::new(catalog), probe.clone(), false);
        assert!(v.validate_item(&fixtures::item()).await.unwrap().passed);
        assert!(probe.seen.lock().unwrap().is_empty());
    }
}

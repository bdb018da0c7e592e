use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use uuid::Uuid;

use crate::{CatalogAsset, CatalogRecord, UploadError, UploadResult};

/// Registers a stored upload with the content catalog
#[async_trait]
pub trait CatalogNotifier: Send + Sync {
    async fn register(&self, asset: &CatalogAsset) -> UploadResult<CatalogRecord>;
}

/// Catalog kept in process memory
#[derive(Default)]
pub struct MemoryCatalog {
    records: Mutex<Vec<(CatalogRecord, CatalogAsset)>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every asset registered so far, oldest first
    pub fn records(&self) -> Vec<(CatalogRecord, CatalogAsset)> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl CatalogNotifier for MemoryCatalog {
    async fn register(&self, asset: &CatalogAsset) -> UploadResult<CatalogRecord> {
        let record = CatalogRecord {
            id: format!("vid_{}", Uuid::new_v4().simple()),
        };
        self.records.lock().push((record.clone(), asset.clone()));
        Ok(record)
    }
}

#[derive(Deserialize)]
struct WebhookResponse {
    #[serde(alias = "_id", alias = "recordId")]
    id: serde_json::Value,
}

/// Catalog notifier that POSTs the asset as JSON to an HTTP endpoint
///
/// The endpoint must answer 2xx with a JSON body carrying an `id`.
#[derive(Clone)]
pub struct WebhookCatalog {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl WebhookCatalog {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            bearer_token: None,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_bearer_token<S: Into<String>>(mut self, token: S) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CatalogNotifier for WebhookCatalog {
    async fn register(&self, asset: &CatalogAsset) -> UploadResult<CatalogRecord> {
        let mut request = self.client.post(&self.endpoint).json(asset);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(UploadError::backend)?;

        let body: WebhookResponse = response.json().await.map_err(UploadError::backend)?;
        let id = match body.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(CatalogRecord { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CatalogRefs, SessionId};

    #[tokio::test]
    async fn memory_catalog_records_assets() {
        let catalog = MemoryCatalog::new();
        let asset = CatalogAsset {
            session_id: SessionId::new(),
            url: "memory://uploads/a.mp4".to_string(),
            object_key: "uploads/a.mp4".to_string(),
            filename: "a.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            size_bytes: 3,
            catalog: CatalogRefs {
                module_id: Some("mod-1".to_string()),
                title: Some("Week 1".to_string()),
                description: None,
            },
        };

        let record = catalog.register(&asset).await.unwrap();
        let records = catalog.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, record);
        assert_eq!(records[0].1.catalog.module_id.as_deref(), Some("mod-1"));
    }

    #[test]
    fn webhook_payload_flattens_catalog_fields() {
        let asset = CatalogAsset {
            session_id: SessionId::from("upl_1"),
            url: "u".to_string(),
            object_key: "k".to_string(),
            filename: "f.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            size_bytes: 1,
            catalog: CatalogRefs {
                module_id: Some("m".to_string()),
                title: None,
                description: None,
            },
        };
        let json = serde_json::to_value(&asset).unwrap();
        assert_eq!(json["moduleId"], "m");
        assert_eq!(json["sizeBytes"], 1);
        assert_eq!(json["sessionId"], "upl_1");
    }
}

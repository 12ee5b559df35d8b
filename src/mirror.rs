//! One-way, insert-only mirror of the remote patient list.
//!
//! Records already present locally are never updated and records removed
//! remotely are never deleted.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::PortalResult;
use crate::models::Demographics;
use crate::records_api::RecordsApi;
use crate::store::Store;

/// Outcome of one mirror pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    pub fetched: usize,
    pub inserted: usize,
}

#[derive(Clone)]
pub struct PatientMirror {
    api: Arc<dyn RecordsApi>,
    store: Arc<Store>,
}

impl PatientMirror {
    pub fn new(api: Arc<dyn RecordsApi>, store: Arc<Store>) -> Self {
        Self { api, store }
    }

    /// Insert every remote patient whose remote id is not yet stored
    pub async fn sync(&self, access_token: &str) -> PortalResult<MirrorReport> {
        let remote = self.api.list_patients(access_token).await?;

        let profiles: Vec<(i64, Demographics)> = remote
            .iter()
            .map(|p| (p.id, p.to_demographics()))
            .collect();
        let inserted = self.store.insert_mirrored_patients(&profiles)?;

        let report = MirrorReport {
            fetched: remote.len(),
            inserted,
        };
        info!(fetched = report.fetched, inserted = report.inserted, "Patient mirror pass complete");
        Ok(report)
    }
}

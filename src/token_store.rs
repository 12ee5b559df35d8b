//! Per-clinician OAuth token persistence.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::{PortalError, PortalResult};
use crate::models::{ClinicianAccount, TokenGrant};
use crate::store::Store;

#[derive(Clone)]
pub struct TokenStore {
    store: Arc<Store>,
}

impl TokenStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Stored account for a clinician, if they ever completed an exchange
    pub fn get(&self, user_ref: &str) -> PortalResult<Option<ClinicianAccount>> {
        self.store.get_clinician(user_ref)
    }

    /// Whether the stored token for `user_ref` must be replaced before use.
    /// A clinician with no stored token counts as stale.
    pub fn is_stale(&self, user_ref: &str, now: DateTime<Utc>) -> PortalResult<bool> {
        Ok(self
            .get(user_ref)?
            .map(|account| account.is_stale(now))
            .unwrap_or(true))
    }

    /// Record a freshly issued grant as the clinician's current token.
    ///
    /// New clinicians get an account whose display name is their user
    /// reference until a real profile is known. A grant without a refresh
    /// token keeps the previously stored one.
    pub fn save_grant(
        &self,
        user_ref: &str,
        grant: &TokenGrant,
        now: DateTime<Utc>,
    ) -> PortalResult<ClinicianAccount> {
        let existing = self.get(user_ref)?;
        let refresh_token = match (&grant.refresh_token, &existing) {
            (Some(token), _) => token.clone(),
            (None, Some(account)) => account.refresh_token.clone(),
            (None, None) => String::new(),
        };
        let expires_at = Duration::try_seconds(grant.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                PortalError::UnexpectedResponse(format!(
                    "token expires_in {} is out of range",
                    grant.expires_in
                ))
            })?;

        let account = self.store.upsert_clinician_tokens(
            user_ref,
            user_ref,
            &grant.access_token,
            &refresh_token,
            expires_at,
        )?;

        info!(
            user_ref = %user_ref,
            created = existing.is_none(),
            expires_at = %account.expires_at,
            "Stored clinician token"
        );
        Ok(account)
    }
}

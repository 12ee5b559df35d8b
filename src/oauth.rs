//! OAuth 2.0 authorization-code flow against the records provider.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PortalError, PortalResult};
use crate::models::ClinicianAccount;
use crate::records_api::RecordsApi;
use crate::session::ClinicianContext;
use crate::token_store::TokenStore;

#[derive(Clone)]
pub struct OAuthExchange {
    api: Arc<dyn RecordsApi>,
    tokens: TokenStore,
    authorize_url: String,
    client_id: String,
    redirect_uri: String,
    scope: String,
}

impl OAuthExchange {
    pub fn new(config: &Config, api: Arc<dyn RecordsApi>, tokens: TokenStore) -> Self {
        Self {
            api,
            tokens,
            authorize_url: config.authorize_url.clone(),
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scope: config.scope.clone(),
        }
    }

    /// Provider URL the clinician's browser is sent to
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}?redirect_uri={}&response_type=code&client_id={}&scope={}&state={}",
            self.authorize_url,
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.scope),
            urlencoding::encode(state)
        )
    }

    /// Exchange an authorization code and store the result as the
    /// clinician's current token, replacing whatever was stored before.
    pub async fn exchange(
        &self,
        clinician: &ClinicianContext,
        code: &str,
        now: DateTime<Utc>,
    ) -> PortalResult<ClinicianAccount> {
        if code.is_empty() {
            return Err(PortalError::Validation(
                "OAuth authorization code is required".to_string(),
            ));
        }

        let grant = self.api.exchange_code(code).await?;
        let account = self.tokens.save_grant(&clinician.user_ref, &grant, now)?;
        info!(user_ref = %clinician.user_ref, "OAuth exchange complete");
        Ok(account)
    }

    /// Replace a stale token using the stored refresh token
    pub async fn refresh(
        &self,
        clinician: &ClinicianContext,
        now: DateTime<Utc>,
    ) -> PortalResult<ClinicianAccount> {
        let account = self
            .tokens
            .get(&clinician.user_ref)?
            .ok_or(PortalError::NotAuthenticated)?;
        if account.refresh_token.is_empty() {
            return Err(PortalError::NotAuthenticated);
        }

        let grant = self.api.refresh_token(&account.refresh_token).await?;
        let account = self.tokens.save_grant(&clinician.user_ref, &grant, now)?;
        info!(user_ref = %clinician.user_ref, "Refreshed clinician token");
        Ok(account)
    }

    /// Access token usable right now, refreshing a stale one first
    pub async fn bearer_token(
        &self,
        clinician: &ClinicianContext,
        now: DateTime<Utc>,
    ) -> PortalResult<String> {
        let account = self
            .tokens
            .get(&clinician.user_ref)?
            .ok_or(PortalError::NotAuthenticated)?;

        if !account.is_stale(now) {
            return Ok(account.access_token);
        }

        warn!(user_ref = %clinician.user_ref, "Stored token is stale");
        Ok(self.refresh(clinician, now).await?.access_token)
    }
}

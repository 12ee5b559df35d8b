//! Records API Client
//!
//! OAuth token endpoint and bearer-authenticated reads against the remote
//! medical-records API. The `RecordsApi` trait is the seam the mirror,
//! merger and OAuth components are written against.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PortalError, PortalResult};
use crate::models::{Page, RemoteAppointment, RemotePatient, TokenGrant};

/// HTTP client timeout for records API requests
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Upper bound on followed `next` links, guarding against a looping cursor
const MAX_PAGES: usize = 200;

/// Filters for the appointments listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentQuery {
    /// Clinic-local date, `YYYY-MM-DD`
    pub date: String,
    pub doctor: Option<i64>,
    pub office: Option<i64>,
    pub exam_room: Option<i64>,
}

impl AppointmentQuery {
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("date", self.date.clone())];
        if let Some(doctor) = self.doctor {
            params.push(("doctor", doctor.to_string()));
        }
        if let Some(office) = self.office {
            params.push(("office", office.to_string()));
        }
        if let Some(room) = self.exam_room {
            params.push(("exam_room", room.to_string()));
        }
        params
    }
}

#[async_trait]
pub trait RecordsApi: Send + Sync {
    /// Trade an authorization code for a token grant
    async fn exchange_code(&self, code: &str) -> PortalResult<TokenGrant>;

    /// Trade a refresh token for a new grant
    async fn refresh_token(&self, refresh_token: &str) -> PortalResult<TokenGrant>;

    /// Every patient profile visible to the bearer token
    async fn list_patients(&self, access_token: &str) -> PortalResult<Vec<RemotePatient>>;

    /// Appointments matching the query, in the order the API returns them
    async fn list_appointments(
        &self,
        access_token: &str,
        query: &AppointmentQuery,
    ) -> PortalResult<Vec<RemoteAppointment>>;
}

/// reqwest-backed implementation of [`RecordsApi`]
#[derive(Debug, Clone)]
pub struct HttpRecordsApi {
    http_client: reqwest::Client,
    token_url: String,
    api_base_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl HttpRecordsApi {
    pub fn new(config: &Config) -> PortalResult<Self> {
        let api_base_url = config.api_base_url.trim_end_matches('/').to_string();
        info!("Creating records API client for {}", api_base_url);

        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PortalError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            token_url: config.token_url.clone(),
            api_base_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        })
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> PortalResult<TokenGrant> {
        let response = self.http_client.post(&self.token_url).form(form).send().await?;
        handle_response(response).await
    }

    /// Walk a paged collection starting at `url`
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        access_token: &str,
        url: String,
        query: &[(&str, String)],
    ) -> PortalResult<Vec<T>> {
        let mut results = Vec::new();
        let first = self
            .http_client
            .get(&url)
            .query(query)
            .bearer_auth(access_token)
            .send()
            .await?;
        let mut page: Page<T> = handle_response(first).await?;

        let mut pages = 1;
        loop {
            results.append(&mut page.results);
            let next = match page.next.take() {
                Some(next) if pages < MAX_PAGES => next,
                _ => break,
            };
            if !same_origin(&self.api_base_url, &next) {
                warn!("Refusing records API page link outside {}", self.api_base_url);
                return Err(PortalError::UnexpectedResponse(
                    "page link points outside the records API".to_string(),
                ));
            }
            debug!(page = pages + 1, "Following records API page link");
            let response = self
                .http_client
                .get(&next)
                .bearer_auth(access_token)
                .send()
                .await?;
            page = handle_response(response).await?;
            pages += 1;
        }

        Ok(results)
    }
}

/// Page links must stay on the API's scheme, host and port, since the
/// bearer token travels with them.
fn same_origin(base: &str, link: &str) -> bool {
    match (url::Url::parse(base), url::Url::parse(link)) {
        (Ok(base), Ok(link)) => base.origin() == link.origin(),
        _ => false,
    }
}

#[async_trait]
impl RecordsApi for HttpRecordsApi {
    async fn exchange_code(&self, code: &str) -> PortalResult<TokenGrant> {
        self.post_token_form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> PortalResult<TokenGrant> {
        self.post_token_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    async fn list_patients(&self, access_token: &str) -> PortalResult<Vec<RemotePatient>> {
        let url = format!("{}/patients", self.api_base_url);
        self.get_all_pages(access_token, url, &[]).await
    }

    async fn list_appointments(
        &self,
        access_token: &str,
        query: &AppointmentQuery,
    ) -> PortalResult<Vec<RemoteAppointment>> {
        let url = format!("{}/appointments", self.api_base_url);
        self.get_all_pages(access_token, url, &query.to_params()).await
    }
}

/// Decode a success body, or turn any other status into a fatal upstream error
async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> PortalResult<T> {
    let status = response.status();
    if status.is_success() {
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(PortalError::Upstream {
            status: status.as_u16(),
            body,
        })
    }
}

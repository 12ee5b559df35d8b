//! In-memory records API used by unit tests.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{PortalError, PortalResult};
use crate::models::{RemoteAppointment, RemotePatient, TokenGrant};
use crate::records_api::{AppointmentQuery, RecordsApi};

#[derive(Default)]
struct FakeState {
    grant: Option<TokenGrant>,
    patients: Vec<RemotePatient>,
    appointments: Vec<RemoteAppointment>,
    codes: Vec<String>,
    refreshes: Vec<String>,
    appointment_queries: Vec<AppointmentQuery>,
    bearer_tokens: Vec<String>,
}

#[derive(Default)]
pub struct FakeRecordsApi {
    state: Mutex<FakeState>,
}

impl FakeRecordsApi {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_grant(access: &str, refresh: &str, expires_in: i64) -> Self {
        let api = Self::default();
        api.set_grant(access, refresh, expires_in);
        api
    }

    /// Token endpoint answers every request with 400
    pub fn failing_token_endpoint() -> Self {
        Self::default()
    }

    pub fn set_grant(&self, access: &str, refresh: &str, expires_in: i64) {
        self.lock().grant = Some(TokenGrant {
            access_token: access.to_string(),
            refresh_token: Some(refresh.to_string()),
            expires_in,
        });
    }

    pub fn set_patients(&self, patients: Vec<RemotePatient>) {
        self.lock().patients = patients;
    }

    /// Appointments given as raw JSON objects, as the API would send them
    pub fn set_appointments(&self, appointments: Vec<Value>) {
        self.lock().appointments = appointments
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
    }

    pub fn codes_exchanged(&self) -> Vec<String> {
        self.lock().codes.clone()
    }

    pub fn refreshes(&self) -> Vec<String> {
        self.lock().refreshes.clone()
    }

    pub fn appointment_queries(&self) -> Vec<AppointmentQuery> {
        self.lock().appointment_queries.clone()
    }

    pub fn bearer_tokens(&self) -> Vec<String> {
        self.lock().bearer_tokens.clone()
    }

    fn grant(&self) -> PortalResult<TokenGrant> {
        self.lock().grant.clone().ok_or(PortalError::Upstream {
            status: 400,
            body: "invalid_grant".to_string(),
        })
    }
}

/// Remote profile with the identity fields set and a recognisable email
pub fn remote_patient(id: i64, first: &str, last: &str) -> RemotePatient {
    RemotePatient {
        id,
        first_name: Some(first.to_string()),
        last_name: Some(last.to_string()),
        date_of_birth: Some("1980-05-17".to_string()),
        email: Some(format!("{}@example.com", first.to_lowercase())),
        preferred_language: Some("eng".to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl RecordsApi for FakeRecordsApi {
    async fn exchange_code(&self, code: &str) -> PortalResult<TokenGrant> {
        self.lock().codes.push(code.to_string());
        self.grant()
    }

    async fn refresh_token(&self, refresh_token: &str) -> PortalResult<TokenGrant> {
        self.lock().refreshes.push(refresh_token.to_string());
        self.grant()
    }

    async fn list_patients(&self, access_token: &str) -> PortalResult<Vec<RemotePatient>> {
        let mut state = self.lock();
        state.bearer_tokens.push(access_token.to_string());
        Ok(state.patients.clone())
    }

    async fn list_appointments(
        &self,
        access_token: &str,
        query: &AppointmentQuery,
    ) -> PortalResult<Vec<RemoteAppointment>> {
        let mut state = self.lock();
        state.bearer_tokens.push(access_token.to_string());
        state.appointment_queries.push(query.clone());
        Ok(state.appointments.clone())
    }
}

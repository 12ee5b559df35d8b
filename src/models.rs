//! Local records and the wire shapes of the remote records API.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock;

/// Check-in status of a local patient record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AppointmentStatus {
    #[default]
    #[serde(rename = "unset")]
    Unset,
    Arrived,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Unset => "unset",
            AppointmentStatus::Arrived => "Arrived",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "Arrived" => AppointmentStatus::Arrived,
            _ => AppointmentStatus::Unset,
        }
    }
}

/// One row per clinician that has completed the OAuth exchange.
#[derive(Clone, Serialize)]
pub struct ClinicianAccount {
    pub user_ref: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub display_name: String,
}

impl ClinicianAccount {
    /// A token is stale once its expiry instant has been reached.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl std::fmt::Debug for ClinicianAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClinicianAccount")
            .field("user_ref", &self.user_ref)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Patient fields the demographic form can edit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Demographics {
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub cell_phone: String,
    pub email: String,
    pub ethnicity: String,
    pub race: String,
    pub preferred_language: String,
    pub social_security_number: String,
    pub emergency_contact_name: String,
    pub emergency_contact_phone: String,
    pub emergency_contact_relation: String,
}

/// Local patient record.
///
/// `remote_id` is present for rows mirrored from the records API and absent
/// for walk-ins created by the intake flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: i64,
    pub remote_id: Option<i64>,
    #[serde(flatten)]
    pub profile: Demographics,
    pub appointment_status: AppointmentStatus,
    pub arrived_at: Option<DateTime<FixedOffset>>,
}

impl PatientRecord {
    pub fn has_arrived(&self) -> bool {
        self.appointment_status == AppointmentStatus::Arrived && self.arrived_at.is_some()
    }

    /// Arrival wall-clock time, e.g. `14:05:09`
    pub fn arrival_clock(&self) -> Option<String> {
        self.arrived_at.as_ref().map(clock::format_arrival)
    }
}

/// Patient profile as returned by the records API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotePatient {
    pub id: i64,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub cell_phone: Option<String>,
    pub email: Option<String>,
    pub ethnicity: Option<String>,
    pub race: Option<String>,
    pub preferred_language: Option<String>,
    pub social_security_number: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub emergency_contact_relation: Option<String>,
}

impl RemotePatient {
    /// Profile fields copied verbatim; a null remote value becomes empty.
    pub fn to_demographics(&self) -> Demographics {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        Demographics {
            first_name: text(&self.first_name),
            middle_name: text(&self.middle_name),
            last_name: text(&self.last_name),
            date_of_birth: self
                .date_of_birth
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, clock::API_DATE_FORMAT).ok()),
            gender: text(&self.gender),
            address: text(&self.address),
            city: text(&self.city),
            state: text(&self.state),
            zip_code: text(&self.zip_code),
            cell_phone: text(&self.cell_phone),
            email: text(&self.email),
            ethnicity: text(&self.ethnicity),
            race: text(&self.race),
            preferred_language: text(&self.preferred_language),
            social_security_number: text(&self.social_security_number),
            emergency_contact_name: text(&self.emergency_contact_name),
            emergency_contact_phone: text(&self.emergency_contact_phone),
            emergency_contact_relation: text(&self.emergency_contact_relation),
        }
    }
}

/// Appointment as returned by the records API.
///
/// Only the patient reference is interpreted; every other key is carried
/// through untouched into the merged listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAppointment {
    #[serde(default)]
    pub patient: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Paged listing envelope used by every records API collection
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}

/// OAuth token endpoint response
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

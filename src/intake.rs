//! Walk-in patient intake.
//!
//! ```text
//! AnonymousStart --identity--> IdentitySubmitted --find/create--> DemographicShown
//!        ^                                                              |
//!        +---- invalid identity (error shown)          demographics ---+--> Arrived
//! ```
//!
//! Arrived is terminal and is recorded on the patient itself through its
//! status and arrival time.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock;
use crate::error::{PortalError, PortalResult};
use crate::models::{AppointmentStatus, Demographics, PatientRecord};
use crate::store::Store;

/// Longest accepted name component
pub const MAX_NAME_LENGTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IntakeState {
    AnonymousStart,
    IdentitySubmitted(Identity),
    DemographicShown { patient: PatientRecord, created: bool },
    Arrived { patient: PatientRecord },
}

/// Validated identity triple used as the find-or-create key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
}

/// Raw check-in entry form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityForm {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
}

/// Raw demographic form, bound to one local patient record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DemographicForm {
    pub patient_id: i64,
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub date_of_birth: String,
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

impl DemographicForm {
    /// Form pre-populated from a stored record
    pub fn from_record(patient: &PatientRecord) -> Self {
        let p = &patient.profile;
        Self {
            patient_id: patient.id,
            first_name: p.first_name.clone(),
            middle_name: p.middle_name.clone(),
            last_name: p.last_name.clone(),
            date_of_birth: p
                .date_of_birth
                .map(clock::api_date)
                .unwrap_or_default(),
            gender: p.gender.clone(),
            address: p.address.clone(),
            city: p.city.clone(),
            state: p.state.clone(),
            zip_code: p.zip_code.clone(),
            cell_phone: p.cell_phone.clone(),
            email: p.email.clone(),
            ethnicity: p.ethnicity.clone(),
            race: p.race.clone(),
            preferred_language: p.preferred_language.clone(),
            social_security_number: p.social_security_number.clone(),
            emergency_contact_name: p.emergency_contact_name.clone(),
            emergency_contact_phone: p.emergency_contact_phone.clone(),
            emergency_contact_relation: p.emergency_contact_relation.clone(),
        }
    }

    fn validate(&self, today: NaiveDate) -> PortalResult<Demographics> {
        let first_name = required_name("First name", &self.first_name)?;
        let last_name = required_name("Last name", &self.last_name)?;
        let date_of_birth = birth_date(&self.date_of_birth, today)?;

        let email = self.email.trim();
        if !email.is_empty() && !looks_like_email(email) {
            return Err(PortalError::Validation("Enter a valid email address.".to_string()));
        }

        let text = |s: &str| s.trim().to_string();
        Ok(Demographics {
            first_name,
            middle_name: text(&self.middle_name),
            last_name,
            date_of_birth: Some(date_of_birth),
            gender: text(&self.gender),
            address: text(&self.address),
            city: text(&self.city),
            state: text(&self.state),
            zip_code: text(&self.zip_code),
            cell_phone: text(&self.cell_phone),
            email: email.to_string(),
            ethnicity: text(&self.ethnicity),
            race: text(&self.race),
            preferred_language: text(&self.preferred_language),
            social_security_number: text(&self.social_security_number),
            emergency_contact_name: text(&self.emergency_contact_name),
            emergency_contact_phone: text(&self.emergency_contact_phone),
            emergency_contact_relation: text(&self.emergency_contact_relation),
        })
    }
}

fn required_name(label: &str, value: &str) -> PortalResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PortalError::Validation(format!("{} is required.", label)));
    }
    if value.chars().count() > MAX_NAME_LENGTH {
        return Err(PortalError::Validation(format!("{} is too long.", label)));
    }
    Ok(value.to_string())
}

fn birth_date(value: &str, today: NaiveDate) -> PortalResult<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PortalError::Validation("Birth date is required.".to_string()));
    }
    let date = NaiveDate::parse_from_str(value, clock::API_DATE_FORMAT).map_err(|_| {
        PortalError::Validation("Enter the birth date as YYYY-MM-DD.".to_string())
    })?;
    if date > today {
        return Err(PortalError::Validation("Birth date cannot be in the future.".to_string()));
    }
    Ok(date)
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[derive(Clone)]
pub struct IntakeFlow {
    store: Arc<Store>,
    tz: Tz,
}

impl IntakeFlow {
    pub fn new(store: Arc<Store>, tz: Tz) -> Self {
        Self { store, tz }
    }

    /// Validate the entry form. On error the flow stays at AnonymousStart.
    pub fn validate_identity(&self, form: &IdentityForm, now: DateTime<Utc>) -> PortalResult<IntakeState> {
        let today = clock::clinic_date(now, self.tz);
        Ok(IntakeState::IdentitySubmitted(Identity {
            first_name: required_name("First name", &form.first_name)?,
            last_name: required_name("Last name", &form.last_name)?,
            date_of_birth: birth_date(&form.date_of_birth, today)?,
        }))
    }

    pub fn patient(&self, id: i64) -> PortalResult<Option<PatientRecord>> {
        self.store.patient_by_id(id)
    }

    /// Find or create the patient for a submitted identity
    pub fn show_demographics(&self, identity: &Identity) -> PortalResult<IntakeState> {
        let (patient, created) = self.store.find_or_create_patient(
            &identity.first_name,
            &identity.last_name,
            identity.date_of_birth,
        )?;
        info!(patient_id = patient.id, created, "Intake identity resolved");
        Ok(IntakeState::DemographicShown { patient, created })
    }

    /// AnonymousStart -> DemographicShown
    pub fn submit_identity(&self, form: &IdentityForm, now: DateTime<Utc>) -> PortalResult<IntakeState> {
        match self.validate_identity(form, now)? {
            IntakeState::IdentitySubmitted(identity) => self.show_demographics(&identity),
            other => Ok(other),
        }
    }

    /// DemographicShown -> Arrived: apply the form, stamp the clinic-local
    /// arrival time and persist.
    pub fn submit_demographics(&self, form: &DemographicForm, now: DateTime<Utc>) -> PortalResult<IntakeState> {
        let mut patient = self
            .store
            .patient_by_id(form.patient_id)?
            .ok_or(PortalError::PatientNotFound(form.patient_id))?;

        patient.profile = form.validate(clock::clinic_date(now, self.tz))?;
        patient.appointment_status = AppointmentStatus::Arrived;
        patient.arrived_at = Some(clock::clinic_now(now, self.tz));
        self.store.save_patient(&patient)?;

        let arrived = patient.arrival_clock().unwrap_or_default();
        info!(patient_id = patient.id, arrived = %arrived, "Patient checked in");
        Ok(IntakeState::Arrived { patient })
    }
}

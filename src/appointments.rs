//! Today's appointment listing joined onto mirrored patients.
//!
//! Merge rule: the merged record holds every key from the patient record and
//! every key from the appointment; where both define a key, the
//! appointment's value wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::clock;
use crate::config::Config;
use crate::error::PortalResult;
use crate::models::{PatientRecord, RemoteAppointment};
use crate::records_api::{AppointmentQuery, RecordsApi};
use crate::store::Store;

/// Optional per-request selectors; unset ones fall back to the configured defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AppointmentSelectors {
    pub doctor: Option<i64>,
    pub office: Option<i64>,
    pub exam_room: Option<i64>,
}

/// One appointment merged with its local patient record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MergedAppointment {
    pub fields: Map<String, Value>,
}

#[cfg(test)]
impl MergedAppointment {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Union of two records; on a shared key the overlay's value is kept.
pub fn merge_fields(mut base: Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
    base
}

/// Merge one appointment onto its patient. An appointment without a
/// `duration` gets `default_duration` minutes.
pub fn merge(
    patient: &PatientRecord,
    appointment: &RemoteAppointment,
    default_duration: u32,
) -> PortalResult<MergedAppointment> {
    let base = match serde_json::to_value(patient)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let mut overlay = appointment.fields.clone();
    if let Some(remote_id) = appointment.patient {
        overlay.insert("patient".to_string(), Value::from(remote_id));
    }
    if overlay.get("duration").map_or(true, Value::is_null) {
        overlay.insert("duration".to_string(), Value::from(default_duration));
    }

    Ok(MergedAppointment {
        fields: merge_fields(base, &overlay),
    })
}

#[derive(Clone)]
pub struct AppointmentMerger {
    api: Arc<dyn RecordsApi>,
    store: Arc<Store>,
    tz: Tz,
    defaults: AppointmentSelectors,
    default_duration: u32,
}

impl AppointmentMerger {
    pub fn new(config: &Config, tz: Tz, api: Arc<dyn RecordsApi>, store: Arc<Store>) -> Self {
        Self {
            api,
            store,
            tz,
            defaults: AppointmentSelectors {
                doctor: config.default_doctor_id,
                office: config.default_office_id,
                exam_room: config.default_exam_room,
            },
            default_duration: config.default_appointment_duration,
        }
    }

    /// Query for the clinic-local calendar date of `now`
    pub fn query_for(&self, now: DateTime<Utc>, selectors: &AppointmentSelectors) -> AppointmentQuery {
        AppointmentQuery {
            date: clock::api_date(clock::clinic_date(now, self.tz)),
            doctor: selectors.doctor.or(self.defaults.doctor),
            office: selectors.office.or(self.defaults.office),
            exam_room: selectors.exam_room.or(self.defaults.exam_room),
        }
    }

    /// Today's appointments whose patient is mirrored locally, in API order.
    /// Appointments for unknown patients are dropped.
    pub async fn today(
        &self,
        access_token: &str,
        now: DateTime<Utc>,
        selectors: &AppointmentSelectors,
    ) -> PortalResult<Vec<MergedAppointment>> {
        let query = self.query_for(now, selectors);
        let appointments = self.api.list_appointments(access_token, &query).await?;

        let mut merged = Vec::with_capacity(appointments.len());
        let mut dropped = 0;
        for appointment in &appointments {
            let patient = match appointment.patient {
                Some(remote_id) => self.store.patient_by_remote_id(remote_id)?,
                None => None,
            };
            match patient {
                Some(patient) => merged.push(merge(&patient, appointment, self.default_duration)?),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            debug!(dropped, "Skipped appointments for patients not mirrored locally");
        }
        info!(date = %query.date, listed = merged.len(), "Built appointment listing");
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{remote_patient, FakeRecordsApi};
    use chrono::TimeZone;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn setup(config: Config) -> (AppointmentMerger, Arc<FakeRecordsApi>, Arc<Store>) {
        let api = Arc::new(FakeRecordsApi::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tz = config.timezone().unwrap();
        let merger = AppointmentMerger::new(&config, tz, api.clone(), store.clone());
        (merger, api, store)
    }

    fn mirror(store: &Store, ids: &[(i64, &str)]) {
        let profiles: Vec<_> = ids
            .iter()
            .map(|(id, name)| (*id, remote_patient(*id, name, "Test").to_demographics()))
            .collect();
        store.insert_mirrored_patients(&profiles).unwrap();
    }

    #[test]
    fn test_overlay_wins_on_collision() {
        let merged = merge_fields(
            object(json!({"status": "unset", "first_name": "Jane"})),
            &object(json!({"status": "confirmed", "exam_room": 1})),
        );
        assert_eq!(merged["status"], "confirmed");
        assert_eq!(merged["first_name"], "Jane");
        assert_eq!(merged["exam_room"], 1);
        assert_eq!(merged.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_patients_dropped_and_order_kept() {
        let (merger, api, store) = setup(Config::default());
        mirror(&store, &[(1, "Ann"), (3, "Cy")]);
        api.set_appointments(vec![
            json!({"id": 30, "patient": 3, "status": "Confirmed", "duration": 45}),
            json!({"id": 20, "patient": 2, "status": "Confirmed"}),
            json!({"id": 10, "patient": 1, "status": "Arrived"}),
            json!({"id": 40, "patient": null}),
        ]);

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap();
        let listing = merger
            .today("tok", now, &AppointmentSelectors::default())
            .await
            .unwrap();

        let ids: Vec<i64> = listing.iter().map(|m| m.get("id").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ids, vec![30, 10]);

        let cy = &listing[0];
        assert_eq!(cy.get("first_name").unwrap(), "Cy");
        assert_eq!(cy.get("patient").unwrap(), 3);
        assert_eq!(cy.get("status").unwrap(), "Confirmed");
        assert_eq!(cy.get("appointment_status").unwrap(), "unset");
        assert_eq!(cy.get("duration").unwrap(), 45);
        // Appointment id replaces the local record id
        assert_eq!(cy.get("id").unwrap(), 30);

        assert_eq!(listing[1].get("duration").unwrap(), 30);
        assert_eq!(api.bearer_tokens(), vec!["tok"]);
    }

    #[tokio::test]
    async fn test_query_uses_clinic_date_and_defaults() {
        let config = Config {
            default_doctor_id: Some(125656),
            default_office_id: Some(133390),
            default_exam_room: Some(1),
            ..Config::default()
        };
        let (merger, api, _) = setup(config);

        // 03:00 UTC on June 2nd is still June 1st in the clinic
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap();
        let selectors = AppointmentSelectors {
            exam_room: Some(4),
            ..Default::default()
        };
        merger.today("tok", now, &selectors).await.unwrap();

        assert_eq!(
            api.appointment_queries(),
            vec![AppointmentQuery {
                date: "2024-06-01".to_string(),
                doctor: Some(125656),
                office: Some(133390),
                exam_room: Some(4),
            }]
        );
    }

    #[tokio::test]
    async fn test_local_only_patients_never_match() {
        let (merger, api, store) = setup(Config::default());
        store
            .find_or_create_patient("Walk", "In", chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap())
            .unwrap();
        api.set_appointments(vec![json!({"id": 1, "patient": 1})]);

        let listing = merger
            .today("tok", Utc::now(), &AppointmentSelectors::default())
            .await
            .unwrap();
        assert!(listing.is_empty());
    }
}

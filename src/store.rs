//! SQLite-backed local store for clinician accounts and patient records.
//!
//! Uniqueness is enforced by the schema rather than by read-then-insert
//! checks: one account per user reference, one patient per remote id, and
//! one local-only patient per (first name, last name, birth date).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info};

use crate::clock;
use crate::error::{PortalError, PortalResult};
use crate::models::{AppointmentStatus, ClinicianAccount, Demographics, PatientRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clinician_accounts (
    user_ref      TEXT PRIMARY KEY,
    access_token  TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at    TEXT NOT NULL,
    display_name  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS patients (
    id                         INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_id                  INTEGER UNIQUE,
    first_name                 TEXT NOT NULL DEFAULT '',
    middle_name                TEXT NOT NULL DEFAULT '',
    last_name                  TEXT NOT NULL DEFAULT '',
    date_of_birth              TEXT,
    gender                     TEXT NOT NULL DEFAULT '',
    address                    TEXT NOT NULL DEFAULT '',
    city                       TEXT NOT NULL DEFAULT '',
    state                      TEXT NOT NULL DEFAULT '',
    zip_code                   TEXT NOT NULL DEFAULT '',
    cell_phone                 TEXT NOT NULL DEFAULT '',
    email                      TEXT NOT NULL DEFAULT '',
    ethnicity                  TEXT NOT NULL DEFAULT '',
    race                       TEXT NOT NULL DEFAULT '',
    preferred_language         TEXT NOT NULL DEFAULT '',
    social_security_number     TEXT NOT NULL DEFAULT '',
    emergency_contact_name     TEXT NOT NULL DEFAULT '',
    emergency_contact_phone    TEXT NOT NULL DEFAULT '',
    emergency_contact_relation TEXT NOT NULL DEFAULT '',
    appointment_status         TEXT NOT NULL DEFAULT 'unset',
    arrived_at                 TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS patients_local_identity
    ON patients (first_name, last_name, date_of_birth)
    WHERE remote_id IS NULL;
";

const PATIENT_COLUMNS: &str = "id, remote_id, first_name, middle_name, last_name, date_of_birth, \
    gender, address, city, state, zip_code, cell_phone, email, ethnicity, race, \
    preferred_language, social_security_number, emergency_contact_name, \
    emergency_contact_phone, emergency_contact_relation, appointment_status, arrived_at";

/// Shared handle to the portal database
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> PortalResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PortalError::Config(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened portal database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> PortalResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> PortalResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =====================
    // Clinician accounts
    // =====================

    pub fn get_clinician(&self, user_ref: &str) -> PortalResult<Option<ClinicianAccount>> {
        let conn = self.conn();
        let account = conn
            .query_row(
                "SELECT user_ref, access_token, refresh_token, expires_at, display_name
                 FROM clinician_accounts WHERE user_ref = ?1",
                params![user_ref],
                clinician_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// Insert an account, or replace only the token fields of an existing one.
    pub fn upsert_clinician_tokens(
        &self,
        user_ref: &str,
        display_name: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> PortalResult<ClinicianAccount> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO clinician_accounts
                 (user_ref, access_token, refresh_token, expires_at, display_name)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_ref) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 expires_at = excluded.expires_at",
            params![
                user_ref,
                access_token,
                refresh_token,
                expires_at.to_rfc3339(),
                display_name
            ],
        )?;
        let account = conn.query_row(
            "SELECT user_ref, access_token, refresh_token, expires_at, display_name
             FROM clinician_accounts WHERE user_ref = ?1",
            params![user_ref],
            clinician_from_row,
        )?;
        Ok(account)
    }

    // =====================
    // Patients
    // =====================

    /// Insert mirrored profiles whose remote id is not yet known.
    /// Returns how many rows were actually inserted.
    pub fn insert_mirrored_patients(&self, profiles: &[(i64, Demographics)]) -> PortalResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO patients (remote_id, first_name, middle_name, last_name, date_of_birth,
                     gender, address, city, state, zip_code, cell_phone, email, ethnicity, race,
                     preferred_language, social_security_number, emergency_contact_name,
                     emergency_contact_phone, emergency_contact_relation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT(remote_id) DO NOTHING",
            )?;
            for (remote_id, p) in profiles {
                inserted += stmt.execute(params![
                    remote_id,
                    p.first_name,
                    p.middle_name,
                    p.last_name,
                    p.date_of_birth.map(format_date),
                    p.gender,
                    p.address,
                    p.city,
                    p.state,
                    p.zip_code,
                    p.cell_phone,
                    p.email,
                    p.ethnicity,
                    p.race,
                    p.preferred_language,
                    p.social_security_number,
                    p.emergency_contact_name,
                    p.emergency_contact_phone,
                    p.emergency_contact_relation,
                ])?;
            }
        }
        tx.commit()?;
        debug!(offered = profiles.len(), inserted, "Mirrored patient batch");
        Ok(inserted)
    }

    pub fn patient_by_id(&self, id: i64) -> PortalResult<Option<PatientRecord>> {
        self.query_patient("WHERE id = ?1", params![id])
    }

    pub fn patient_by_remote_id(&self, remote_id: i64) -> PortalResult<Option<PatientRecord>> {
        self.query_patient("WHERE remote_id = ?1", params![remote_id])
    }

    /// First record (mirrored or local-only) matching the identity triple
    pub fn find_patient_by_identity(
        &self,
        first_name: &str,
        last_name: &str,
        date_of_birth: NaiveDate,
    ) -> PortalResult<Option<PatientRecord>> {
        self.query_patient(
            "WHERE first_name = ?1 AND last_name = ?2 AND date_of_birth = ?3 ORDER BY id LIMIT 1",
            params![first_name, last_name, format_date(date_of_birth)],
        )
    }

    /// Find a patient by identity, creating a local-only record if none exists.
    /// The boolean is true when a new row was created by this call.
    pub fn find_or_create_patient(
        &self,
        first_name: &str,
        last_name: &str,
        date_of_birth: NaiveDate,
    ) -> PortalResult<(PatientRecord, bool)> {
        if let Some(existing) = self.find_patient_by_identity(first_name, last_name, date_of_birth)? {
            return Ok((existing, false));
        }

        let created = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO patients (first_name, last_name, date_of_birth)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT DO NOTHING",
                params![first_name, last_name, format_date(date_of_birth)],
            )?
        };

        // A concurrent intake may have won the insert; either way the row exists now
        let record = self
            .find_patient_by_identity(first_name, last_name, date_of_birth)?
            .ok_or_else(|| {
                PortalError::Validation("Could not create a patient record".to_string())
            })?;
        Ok((record, created == 1))
    }

    /// Persist every mutable field of an existing record.
    pub fn save_patient(&self, patient: &PatientRecord) -> PortalResult<()> {
        let p = &patient.profile;
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE patients SET
                     first_name = ?2, middle_name = ?3, last_name = ?4, date_of_birth = ?5,
                     gender = ?6, address = ?7, city = ?8, state = ?9, zip_code = ?10,
                     cell_phone = ?11, email = ?12, ethnicity = ?13, race = ?14,
                     preferred_language = ?15, social_security_number = ?16,
                     emergency_contact_name = ?17, emergency_contact_phone = ?18,
                     emergency_contact_relation = ?19, appointment_status = ?20, arrived_at = ?21
                 WHERE id = ?1",
                params![
                    patient.id,
                    p.first_name,
                    p.middle_name,
                    p.last_name,
                    p.date_of_birth.map(format_date),
                    p.gender,
                    p.address,
                    p.city,
                    p.state,
                    p.zip_code,
                    p.cell_phone,
                    p.email,
                    p.ethnicity,
                    p.race,
                    p.preferred_language,
                    p.social_security_number,
                    p.emergency_contact_name,
                    p.emergency_contact_phone,
                    p.emergency_contact_relation,
                    patient.appointment_status.as_str(),
                    patient.arrived_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) => PortalError::Validation(
                    "Another patient record already uses this name and birth date".to_string(),
                ),
                _ => PortalError::Database(e),
            })?;

        if changed == 0 {
            return Err(PortalError::PatientNotFound(patient.id));
        }
        Ok(())
    }

    pub fn patient_count(&self) -> PortalResult<i64> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM patients", [], |row| row.get(0))?)
    }

    fn query_patient(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> PortalResult<Option<PatientRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM patients {}", PATIENT_COLUMNS, clause);
        let record = conn.query_row(&sql, params, patient_from_row).optional()?;
        Ok(record)
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format(clock::API_DATE_FORMAT).to_string()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn clinician_from_row(row: &Row<'_>) -> rusqlite::Result<ClinicianAccount> {
    let expires_raw: String = row.get(3)?;
    let expires_at = DateTime::parse_from_rfc3339(&expires_raw)
        .map_err(|e| conversion_error(3, e))?
        .with_timezone(&Utc);

    Ok(ClinicianAccount {
        user_ref: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        expires_at,
        display_name: row.get(4)?,
    })
}

fn patient_from_row(row: &Row<'_>) -> rusqlite::Result<PatientRecord> {
    let date_of_birth = row
        .get::<_, Option<String>>(5)?
        .map(|d| NaiveDate::parse_from_str(&d, clock::API_DATE_FORMAT))
        .transpose()
        .map_err(|e| conversion_error(5, e))?;

    let arrived_at = row
        .get::<_, Option<String>>(21)?
        .map(|t| DateTime::<FixedOffset>::parse_from_rfc3339(&t))
        .transpose()
        .map_err(|e| conversion_error(21, e))?;

    let status: String = row.get(20)?;

    Ok(PatientRecord {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        profile: Demographics {
            first_name: row.get(2)?,
            middle_name: row.get(3)?,
            last_name: row.get(4)?,
            date_of_birth,
            gender: row.get(6)?,
            address: row.get(7)?,
            city: row.get(8)?,
            state: row.get(9)?,
            zip_code: row.get(10)?,
            cell_phone: row.get(11)?,
            email: row.get(12)?,
            ethnicity: row.get(13)?,
            race: row.get(14)?,
            preferred_language: row.get(15)?,
            social_security_number: row.get(16)?,
            emergency_contact_name: row.get(17)?,
            emergency_contact_phone: row.get(18)?,
            emergency_contact_relation: row.get(19)?,
        },
        appointment_status: AppointmentStatus::from_db(&status),
        arrived_at,
    })
}

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::clock;

/// Capabilities requested from the records provider
pub const DEFAULT_SCOPE: &str =
    "patients:read user:read user:write calendar:read calendar:write clinical:read clinical:write";

/// Portal configuration.
///
/// Loaded from `~/.checkinportal/config.json` and then overridden from the
/// environment, so secrets never need to live in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base_url: String,
    pub scope: String,
    pub default_doctor_id: Option<i64>,
    pub default_office_id: Option<i64>,
    pub default_exam_room: Option<i64>,
    /// Minutes; filled into appointments that carry no duration
    pub default_appointment_duration: u32,
    pub clinic_timezone: String,
    pub database_path: Option<PathBuf>,
    pub bind_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: 1,
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "http://localhost:8000/login".to_string(),
            authorize_url: "https://drchrono.com/o/authorize/".to_string(),
            token_url: "https://drchrono.com/o/token/".to_string(),
            api_base_url: "https://drchrono.com/api".to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            default_doctor_id: None,
            default_office_id: None,
            default_exam_room: None,
            default_appointment_duration: 30,
            clinic_timezone: clock::DEFAULT_CLINIC_TIMEZONE.to_string(),
            database_path: None,
            bind_address: "127.0.0.1:8000".to_string(),
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".checkinportal"))
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default file. A missing file gives defaults;
    /// an unreadable or malformed one is an error.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply `CHECKIN_*` overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CHECKIN_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = lookup("CHECKIN_CLIENT_SECRET") {
            self.client_secret = v;
        }
        if let Some(v) = lookup("CHECKIN_REDIRECT_URI") {
            self.redirect_uri = v;
        }
        if let Some(v) = lookup("CHECKIN_DATABASE") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CHECKIN_BIND") {
            self.bind_address = v;
        }
    }

    /// Load the file config and apply process environment overrides
    pub fn from_environment() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Resolved database location
    pub fn database_path(&self) -> Result<PathBuf> {
        match self.database_path {
            Some(ref path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("portal.db")),
        }
    }

    pub fn timezone(&self) -> Result<Tz, String> {
        clock::parse_timezone(&self.clinic_timezone)
    }

    /// Check everything the portal needs before serving
    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.trim().is_empty() {
            return Err("client_id is not configured".to_string());
        }
        for (name, value) in [
            ("redirect_uri", &self.redirect_uri),
            ("authorize_url", &self.authorize_url),
            ("token_url", &self.token_url),
            ("api_base_url", &self.api_base_url),
        ] {
            let parsed = url::Url::parse(value)
                .map_err(|e| format!("{} '{}' is not a valid URL: {}", name, value, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(format!(
                    "{} must use http or https scheme, got: {}",
                    name,
                    parsed.scheme()
                ));
            }
        }
        self.timezone()?;
        Ok(())
    }
}

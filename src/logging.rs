//! Logging setup and check-in activity events.
//!
//! IMPORTANT: nothing logged here may identify a patient. Local record ids,
//! counts, outcomes and clinician user references are fine; names, birth
//! dates, contact details and OAuth tokens are not.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Keeps the file writer flushing until the process exits
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install console and daily-rolling JSON file logging.
///
/// Log files land in `~/.checkinportal/logs/`.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = get_log_directory()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "portal.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(non_blocking)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(EnvFilter::new("info"));

    let console_layer = fmt::layer().with_target(true).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    info!(log_dir = %log_dir.display(), "Logging initialized");
    Ok(())
}

/// Console-only logging, used when the log directory is unavailable
pub fn init_console_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

pub fn get_log_directory() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not determine home directory")?;
    Ok(home.join(".checkinportal").join("logs"))
}

/// OAuth events (sign-in, callback, refresh, logout)
pub fn log_auth_event(event: &str, user_ref: Option<&str>, success: bool, error: Option<&str>) {
    if success {
        info!(
            event_type = "clinician_auth",
            auth_event = event,
            user_ref = user_ref.unwrap_or(""),
            "Clinician auth: {}",
            event
        );
    } else {
        warn!(
            event_type = "clinician_auth",
            auth_event = event,
            user_ref = user_ref.unwrap_or(""),
            error = error.unwrap_or(""),
            "Clinician auth failed: {}",
            event
        );
    }
}

/// Intake transitions, identified only by local record id
pub fn log_intake_event(state: &str, patient_id: Option<i64>) {
    info!(
        event_type = "intake",
        state = state,
        patient_id = patient_id.unwrap_or_default(),
        "Intake moved to {}",
        state
    );
}

//! Clinic-local civil time.
//!
//! Every "now" in the portal is taken in UTC and converted here, so the
//! appointment date filter and arrival stamps follow the clinic's DST rules.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Default clinic zone
pub const DEFAULT_CLINIC_TIMEZONE: &str = "US/Pacific";

/// Date format the records API expects for the appointment filter
pub const API_DATE_FORMAT: &str = "%Y-%m-%d";

/// Arrival stamps are 24-hour wall time
pub const ARRIVAL_FORMAT: &str = "%H:%M:%S";

/// Parse a zone name such as `US/Pacific` or `America/Los_Angeles`
pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|e| format!("Unknown time zone '{}': {}", name, e))
}

/// Treat a naive timestamp as UTC wall time and convert it to the clinic zone.
pub fn to_clinic_time(naive_utc: NaiveDateTime, tz: Tz) -> DateTime<Tz> {
    Utc.from_utc_datetime(&naive_utc).with_timezone(&tz)
}

/// Clinic-local "now", with the offset fixed so it can be stored and compared.
pub fn clinic_now(now: DateTime<Utc>, tz: Tz) -> DateTime<FixedOffset> {
    to_clinic_time(now.naive_utc(), tz).fixed_offset()
}

/// Calendar date at the clinic for the given instant.
pub fn clinic_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    to_clinic_time(now.naive_utc(), tz).date_naive()
}

/// Date filter value for the appointments endpoint.
pub fn api_date(date: NaiveDate) -> String {
    date.format(API_DATE_FORMAT).to_string()
}

pub fn format_arrival(ts: &DateTime<FixedOffset>) -> String {
    ts.format(ARRIVAL_FORMAT).to_string()
}

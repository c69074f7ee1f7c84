//! Textual forms of policy-program values.
//!
//! Policy programs frequently interpolate typed values into headers and
//! synthetic bodies. These helpers define the one canonical textual form
//! per type so every emission site agrees.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Canonical textual form of a boolean.
#[must_use]
pub fn bool_str(v: bool) -> &'static str {
    if v { "true" } else { "false" }
}

/// Canonical textual form of an integer.
#[must_use]
pub fn int_str(v: i64) -> String {
    v.to_string()
}

/// Canonical textual form of a real number (three decimals).
#[must_use]
pub fn real_str(v: f64) -> String {
    format!("{v:.3}")
}

/// Canonical textual form of a duration (fractional seconds).
#[must_use]
pub fn duration_str(v: Duration) -> String {
    format!("{:.3}", v.as_secs_f64())
}

/// Canonical textual form of a timestamp: fractional seconds since the
/// Unix epoch, matching the runtime's clock representation.
///
/// Times before the epoch render as negative seconds.
#[must_use]
pub fn time_str(t: SystemTime) -> String {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => format!("{:.6}", d.as_secs_f64()),
        Err(e) => format!("{:.6}", -e.duration().as_secs_f64()),
    }
}

/// Canonical textual form of an IP address.
#[must_use]
pub fn ip_str(ip: IpAddr) -> String {
    ip.to_string()
}

/// Canonical textual form of a director reference: its symbolic name, or
/// an empty string for an unset reference.
#[must_use]
pub fn backend_str(name: Option<&str>) -> &str {
    name.unwrap_or("")
}

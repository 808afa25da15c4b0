//! Timestamps attached to samples, events and tunnel handles.

use chrono::{DateTime, Utc};

/// UTC timestamp used for sample times, event times and handle open times.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

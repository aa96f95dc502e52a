use chrono::{NaiveDateTime, SubsecRound, TimeDelta};
use serde::{Deserialize, Serialize};

/// One uploaded photo as it is persisted in the collection file.
///
/// `timestamp` is local wall-clock time without a zone. Ages are only
/// meaningful against the clock of the process that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub filename: String,
    pub comment: String,
    pub timestamp: NaiveDateTime,
}

impl ImageRecord {
    pub fn new(filename: String, comment: String, created_at: NaiveDateTime) -> Self {
        Self {
            filename,
            comment,
            timestamp: created_at.trunc_subsecs(6),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    Visible,
    Fading,
    Expired,
}

/// How long a record is shown, then faded, before it counts as expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    pub display: TimeDelta,
    pub fadeout: TimeDelta,
}

impl Lifetime {
    pub fn from_secs(display: u64, fadeout: u64) -> Self {
        Self {
            display: secs(display),
            fadeout: secs(fadeout),
        }
    }

    pub fn total(&self) -> TimeDelta {
        self.display
            .checked_add(&self.fadeout)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn state_at(&self, now: NaiveDateTime, created_at: NaiveDateTime) -> DisplayState {
        let elapsed = now - created_at;
        if elapsed < self.display {
            DisplayState::Visible
        } else if elapsed < self.total() {
            DisplayState::Fading
        } else {
            DisplayState::Expired
        }
    }

    /// Purge eligibility. Strictly greater than the total, so a record sitting
    /// exactly on the boundary reads as `expired` but survives one more sweep.
    pub fn is_past(&self, now: NaiveDateTime, created_at: NaiveDateTime) -> bool {
        now - created_at > self.total()
    }
}

fn secs(n: u64) -> TimeDelta {
    i64::try_from(n)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Current local wall-clock time, the clock every record age is measured on.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Entry of `GET /api/images`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    #[serde(flatten)]
    pub record: ImageRecord,
    pub state: DisplayState,
}

impl FeedItem {
    pub fn at(record: ImageRecord, lifetime: &Lifetime, now: NaiveDateTime) -> Self {
        let state = lifetime.state_at(now, record.timestamp);
        Self { record, state }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

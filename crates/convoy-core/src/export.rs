//! Shareable text export of session data.
//!
//! The export is a pretty-printed JSON document carrying the export time
//! and every known session with its events and samples. It is meant for
//! manual sharing and is never imported back.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::types::Session;

/// Prefix of every export file name.
pub const EXPORT_FILE_PREFIX: &str = "safety_validator_export";

/// A serialized snapshot of sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    /// When the export was produced (UTC).
    pub export_date: DateTime<Utc>,

    /// Exported sessions.
    pub sessions: Vec<Session>,
}

impl ExportDocument {
    /// Snapshot `sessions` now.
    #[must_use]
    pub fn new(sessions: Vec<Session>) -> Self {
        Self {
            export_date: Utc::now(),
            sessions,
        }
    }

    /// Snapshot a single session.
    #[must_use]
    pub fn for_session(session: Session) -> Self {
        Self::new(vec![session])
    }

    /// Render as indented JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if a session cannot be serialized.
    pub fn render(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// File name used when sharing this export.
    #[must_use]
    pub fn file_name(&self) -> String {
        file_name(self.export_date.date_naive())
    }
}

/// `safety_validator_export_{YYYY-MM-DD}.txt`
#[must_use]
pub fn file_name(date: NaiveDate) -> String {
    format!("{EXPORT_FILE_PREFIX}_{}.txt", date.format("%Y-%m-%d"))
}

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::window::EntityId;

/// Host-side marker for requests not tied to any tab.
pub const NO_ENTITY: EntityId = -1;

const CONTENT_LENGTH: &str = "content-length";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed host event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timestamp {0} is outside the representable date range")]
    Timestamp(f64),
}

/// Whole milliseconds for a host timestamp, or `None` when it cannot be
/// placed on a calendar date.
fn timestamp_ms(raw: f64) -> Option<i64> {
    if !raw.is_finite() {
        return None;
    }
    // host clocks report fractional milliseconds
    let ms = raw.trunc() as i64;
    DateTime::<Utc>::from_timestamp_millis(ms).map(|_| ms)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Header {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// One completed request, as delivered by the network layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub entity_id: EntityId,
    pub timestamp_ms: i64,
    pub response_headers: Option<Vec<Header>>,
}

impl Completion {
    /// Bytes announced by the `content-length` response header.
    ///
    /// Missing headers, a missing value, or anything that is not a plain
    /// unsigned decimal count as zero; chunked responses omit it routinely.
    pub fn content_length(&self) -> u64 {
        self.response_headers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(CONTENT_LENGTH))
            .and_then(|h| h.value.as_deref())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    pub fn has_entity(&self) -> bool {
        self.entity_id != NO_ENTITY
    }
}

/// Everything the host can tell the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Completed(Completion),
    Created { entity_id: EntityId, url: Option<String>, title: Option<String> },
    Updated { entity_id: EntityId, url: Option<String>, title: Option<String> },
    Removed { entity_id: EntityId },
    Activated { entity_id: EntityId },
}

// Wire shapes. Kept private so loosely typed payloads never travel past
// `parse_line`.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawEvent {
    #[serde(rename_all = "camelCase")]
    Completed {
        tab_id: EntityId,
        time_stamp: f64,
        #[serde(default)]
        response_headers: Option<Vec<Header>>,
    },
    #[serde(rename_all = "camelCase")]
    Created {
        tab_id: EntityId,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Updated {
        tab_id: EntityId,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Removed { tab_id: EntityId },
    #[serde(rename_all = "camelCase")]
    Activated { tab_id: EntityId },
}

impl TryFrom<RawEvent> for HostEvent {
    type Error = EventError;

    fn try_from(raw: RawEvent) -> Result<Self, EventError> {
        Ok(match raw {
            RawEvent::Completed { tab_id, time_stamp, response_headers } => HostEvent::Completed(Completion {
                entity_id: tab_id,
                timestamp_ms: timestamp_ms(time_stamp).ok_or(EventError::Timestamp(time_stamp))?,
                response_headers,
            }),
            RawEvent::Created { tab_id, url, title } => HostEvent::Created { entity_id: tab_id, url, title },
            RawEvent::Updated { tab_id, url, title } => HostEvent::Updated { entity_id: tab_id, url, title },
            RawEvent::Removed { tab_id } => HostEvent::Removed { entity_id: tab_id },
            RawEvent::Activated { tab_id } => HostEvent::Activated { entity_id: tab_id },
        })
    }
}

/// Parse one newline-delimited JSON event. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<HostEvent>, EventError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let raw: RawEvent = serde_json::from_str(line)?;
    HostEvent::try_from(raw).map(Some)
}

//! Annotation events placed on a session's timeline.
//!
//! Events carry absolute instants and their offsets in seconds from the
//! session start. `insert` and `remove` enforce placement rules on a sorted
//! event list; persistence is handled by the dataset that owns the list.

use crate::error::EventError;
use crate::meta::from_millis;
use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq,
)]
#[archive(check_bytes)]
pub struct Event {
    pub id: u64,
    /// Unix milliseconds
    pub t_start_abs: i64,
    /// Unix milliseconds
    pub t_end_abs: i64,
    /// Seconds since session start
    pub x_start: f64,
    pub x_end: f64,
    pub category: String,
    pub description: String,
}

impl Event {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        from_millis(self.t_start_abs)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        from_millis(self.t_end_abs)
    }
}

/// An event as supplied by a caller or an event source, before placement
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub category: String,
    pub description: String,
}

impl NewEvent {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, category: impl Into<String>) -> Self {
        Self {
            start,
            end,
            category: category.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Place `draft` on the timeline and insert it, keeping the list ordered by start
///
/// `duration` bounds `x_start` from above when known.
pub fn insert(
    events: &mut Vec<Event>,
    draft: NewEvent,
    session_start: Option<DateTime<Utc>>,
    duration: Option<f64>,
) -> Result<u64, EventError> {
    let session_start = session_start.ok_or(EventError::NoSessionStart)?;
    let t_start_abs = draft.start.timestamp_millis();
    let t_end_abs = draft.end.timestamp_millis();

    if events.iter().any(|e| e.t_start_abs == t_start_abs) {
        return Err(EventError::Duplicate(t_start_abs));
    }

    let origin = session_start.timestamp_millis();
    let x_start = (t_start_abs - origin) as f64 / 1000.0;
    let x_end = (t_end_abs - origin) as f64 / 1000.0;

    let upper = duration.unwrap_or(f64::INFINITY);
    if x_start < 0.0 || x_start > upper {
        return Err(EventError::OutOfRange {
            x_start,
            duration: upper,
        });
    }

    let id = events.iter().map(|e| e.id).max().unwrap_or(0) + 1;
    events.push(Event {
        id,
        t_start_abs,
        t_end_abs,
        x_start,
        x_end,
        category: draft.category,
        description: draft.description,
    });
    events.sort_by(|a, b| a.x_start.total_cmp(&b.x_start));
    Ok(id)
}

pub fn remove(events: &mut Vec<Event>, id: u64) -> Result<Event, EventError> {
    let index = events
        .iter()
        .position(|e| e.id == id)
        .ok_or(EventError::NotFound(id))?;
    Ok(events.remove(index))
}

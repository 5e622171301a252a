//! Per-song chart history summaries.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::TRACKED_POSITIONS;

/// Previous-hour position as it should be presented: anything outside the
/// tracked top positions counts as not having charted.
pub fn presentable_prev_position(position: Option<u32>) -> Option<u32> {
    position.filter(|p| *p <= TRACKED_POSITIONS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PositionAt {
    pub position: u32,
    pub hour: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeDetails {
    NotCharted,
    Charted {
        initial: PositionAt,
        peak: PositionAt,
        current: Option<u32>,
        /// Last known position, only reported when the song is not charting now.
        #[serde(rename = "final")]
        last: Option<PositionAt>,
    },
}

impl RealtimeDetails {
    /// Summarise `(hour, position)` history relative to `now_hour`.
    pub fn from_history(history: &[(DateTime<Utc>, u32)], now_hour: DateTime<Utc>) -> Self {
        let Some(&(first_hour, first_position)) = history.iter().min_by_key(|(hour, _)| *hour) else {
            return RealtimeDetails::NotCharted;
        };
        let &(last_hour, last_position) = history
            .iter()
            .max_by_key(|(hour, _)| *hour)
            .unwrap_or(&(first_hour, first_position));
        let &(peak_hour, peak_position) = history
            .iter()
            .min_by_key(|(hour, position)| (*position, *hour))
            .unwrap_or(&(first_hour, first_position));
        let current = history
            .iter()
            .find(|(hour, _)| *hour == now_hour)
            .map(|(_, position)| *position);

        RealtimeDetails::Charted {
            initial: PositionAt {
                position: first_position,
                hour: first_hour,
            },
            peak: PositionAt {
                position: peak_position,
                hour: peak_hour,
            },
            current,
            last: if current.is_some() {
                None
            } else {
                Some(PositionAt {
                    position: last_position,
                    hour: last_hour,
                })
            },
        }
    }
}

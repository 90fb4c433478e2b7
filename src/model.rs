use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Descriptor of a playable track as resolved by the loader. The persistence
/// layer stores and forwards these without interpreting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    pub url: String,
    pub title: String,
    pub author: String,
    /// Absent for live streams.
    pub duration_ms: Option<u64>,
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub live: bool,
}

impl TrackRef {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// A queued track together with the display name of whoever requested it.
/// Entries are immutable once created; only the queue ordering changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub track: TrackRef,
    pub requester: String,
}

/// Persisted "now playing" record for one guild: what is playing, in which
/// voice channel, and how far in. Written wholesale, never field-by-field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub entry: QueueEntry,
    pub channel_id: u64,
    pub position_ms: u64,
}

impl PlaybackSnapshot {
    pub fn new(entry: QueueEntry, channel_id: u64, position: Duration) -> Self {
        Self {
            entry,
            channel_id,
            position_ms: position.as_millis() as u64,
        }
    }

    pub fn position(&self) -> Duration {
        Duration::from_millis(self.position_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(title: &str, requester: &str) -> QueueEntry {
        QueueEntry {
            track: TrackRef {
                url: format!("https://example.com/{title}"),
                title: title.to_string(),
                author: "artist".to_string(),
                duration_ms: Some(180_000),
                artwork_url: None,
                live: false,
            },
            requester: requester.to_string(),
        }
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snap = PlaybackSnapshot::new(entry("song", "alice"), 100, Duration::from_secs(12));
        let raw = serde_json::to_string(&snap).unwrap();
        let back: PlaybackSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.position(), Duration::from_secs(12));
    }

    #[test]
    fn queue_list_round_trips_through_json() {
        let list = vec![entry("a", "alice"), entry("b", "bob")];
        let raw = serde_json::to_string(&list).unwrap();
        let back: Vec<QueueEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn live_flag_defaults_to_false_on_old_values() {
        // Values written before the flag existed must still deserialize.
        let raw = r#"{"url":"u","title":"t","author":"a","duration_ms":null,"artwork_url":null}"#;
        let track: TrackRef = serde_json::from_str(raw).unwrap();
        assert!(!track.live);
        assert_eq!(track.duration(), None);
    }
}

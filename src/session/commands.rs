//! Remote-control command payloads and the pure list-shaping helpers the
//! dispatcher uses (dominant media type filter, playback ordering, shuffle).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::library::BaseItem;

/// What the target session should do with the queued items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayCommand {
    PlayNow,
    PlayNext,
    PlayLast,
    PlayInstantMix,
    PlayShuffle,
}

/// Player transport commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaystateCommand {
    Stop,
    Pause,
    Unpause,
    PlayPause,
    NextTrack,
    PreviousTrack,
    Seek,
    Rewind,
    FastForward,
}

/// Queue-items command routed to a session's controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayRequest {
    pub item_ids: Vec<String>,
    pub play_command: PlayCommand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_position_ticks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controlling_user_id: Option<Uuid>,
}

/// Playstate command routed to a session's controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaystateRequest {
    pub command: PlaystateCommand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_position_ticks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controlling_user_id: Option<Uuid>,
}

/// Named command with free-form string arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralCommand {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controlling_user_id: Option<Uuid>,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

/// On-screen message, lowered to a DisplayMessage general command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCommand {
    pub header: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Browse-to-item request, lowered to a DisplayContent general command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseRequest {
    pub item_id: String,
    pub item_name: String,
    pub item_type: String,
}

/// Well-known general command names.
pub mod command_names {
    pub const DISPLAY_MESSAGE: &str = "DisplayMessage";
    pub const DISPLAY_CONTENT: &str = "DisplayContent";
}

/// Source of randomness for shuffled play queues. Injected so tests can pin
/// the permutation.
pub trait RandomSource: Send + Sync {
    fn next_u64(&self) -> u64;
}

/// Production randomness.
pub struct ThreadRngSource;

impl RandomSource for ThreadRngSource {
    fn next_u64(&self) -> u64 {
        use rand::Rng;
        rand::rng().random()
    }
}

/// Keeps only the dominant media type of the list: items are grouped by
/// media type (case-insensitive) and the largest group wins, first
/// encountered group winning ties.
pub fn filter_to_single_media_type(items: Vec<BaseItem>) -> Vec<BaseItem> {
    let mut groups: Vec<(String, usize)> = Vec::new();
    for item in &items {
        let key = item
            .media_type
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, count)) => *count += 1,
            None => groups.push((key, 1)),
        }
    }
    // Ties go to the first group encountered.
    let mut winner: Option<(String, usize)> = None;
    for (key, count) in groups {
        if winner.as_ref().map_or(true, |(_, best)| count > *best) {
            winner = Some((key, count));
        }
    }
    let Some((winner, _)) = winner else {
        return items;
    };
    items
        .into_iter()
        .filter(|i| {
            i.media_type
                .as_deref()
                .unwrap_or_default()
                .eq_ignore_ascii_case(&winner)
        })
        .collect()
}

/// Orders a playback list by sort name.
pub fn sort_for_playback(items: &mut [BaseItem]) {
    items.sort_by(|a, b| a.sort_name.cmp(&b.sort_name));
}

/// Uniform permutation: every element gets a fresh random key and the list
/// is ordered by it.
pub fn shuffle_in_place<T>(items: &mut Vec<T>, random: &dyn RandomSource) {
    let mut keyed: Vec<(u64, T)> = items.drain(..).map(|i| (random.next_u64(), i)).collect();
    keyed.sort_by_key(|(key, _)| *key);
    items.extend(keyed.into_iter().map(|(_, i)| i));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::ItemKind;
    use std::sync::Mutex;

    fn item(id: &str, media_type: &str) -> BaseItem {
        BaseItem {
            id: id.to_string(),
            name: id.to_string(),
            sort_name: id.to_lowercase(),
            media_type: Some(media_type.to_string()),
            run_time_ticks: None,
            is_virtual: false,
            supports_played_status: true,
            has_media_sources: true,
            kind: ItemKind::Leaf,
        }
    }

    struct FixedKeys {
        keys: Mutex<Vec<u64>>,
    }

    impl FixedKeys {
        fn new(keys: Vec<u64>) -> Self {
            Self {
                keys: Mutex::new(keys),
            }
        }
    }

    impl RandomSource for FixedKeys {
        fn next_u64(&self) -> u64 {
            self.keys.lock().unwrap().remove(0)
        }
    }

    #[test]
    fn dominant_media_type_wins() {
        let items = vec![
            item("a", "Audio"),
            item("b", "Video"),
            item("c", "Audio"),
            item("d", "audio"),
        ];
        let filtered = filter_to_single_media_type(items);
        let ids: Vec<&str> = filtered.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn media_type_ties_break_by_insertion_order() {
        let items = vec![item("v1", "Video"), item("a1", "Audio"), item("v2", "Video"), item("a2", "Audio")];
        let filtered = filter_to_single_media_type(items);
        let ids: Vec<&str> = filtered.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["v1", "v2"]);
    }

    #[test]
    fn empty_list_survives_filter() {
        assert!(filter_to_single_media_type(Vec::new()).is_empty());
    }

    #[test]
    fn shuffle_orders_by_injected_keys() {
        let mut ids = vec!["a", "b", "c", "d"];
        let random = FixedKeys::new(vec![30, 10, 40, 20]);
        shuffle_in_place(&mut ids, &random);
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn sort_for_playback_uses_sort_name() {
        let mut items = vec![item("Zeta", "Audio"), item("Alpha", "Audio")];
        sort_for_playback(&mut items);
        assert_eq!(items[0].id, "Alpha");
    }
}

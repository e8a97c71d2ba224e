//! Library item model and the lookup collaborators the session core binds.
//!
//! The real library lives elsewhere in the server; the session core only
//! needs a flat view of an item plus a small capability set (folder-ness,
//! by-name-ness, episode facet, media sources).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::user::User;

/// Facet of a library item that matters for playback translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    /// A directly playable item (movie, track, photo...).
    Leaf,
    /// A container whose recursive children are playable.
    Folder,
    /// A by-name entity (person, genre, studio...) that tags other items.
    ByName,
    /// An episode belonging to a series.
    Episode { series_id: Option<String> },
}

/// Flat snapshot of a library entity, as the session core sees it.
#[derive(Debug, Clone)]
pub struct BaseItem {
    pub id: String,
    pub name: String,
    pub sort_name: String,
    /// Media type as reported by the library ("Video", "Audio", ...).
    pub media_type: Option<String>,
    pub run_time_ticks: Option<i64>,
    pub is_virtual: bool,
    pub supports_played_status: bool,
    pub has_media_sources: bool,
    pub kind: ItemKind,
}

impl BaseItem {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, ItemKind::Folder | ItemKind::ByName)
    }

    pub fn is_by_name(&self) -> bool {
        matches!(self.kind, ItemKind::ByName)
    }

    pub fn as_episode(&self) -> Option<&ItemKind> {
        match self.kind {
            ItemKind::Episode { .. } => Some(&self.kind),
            _ => None,
        }
    }

    pub fn series_id(&self) -> Option<&str> {
        match &self.kind {
            ItemKind::Episode { series_id } => series_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_video(&self) -> bool {
        self.media_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("video"))
    }

    /// Playback permission of `user` for this item.
    pub fn play_access(&self, user: &User) -> PlayAccess {
        if user.policy.enable_media_playback {
            PlayAccess::Full
        } else {
            PlayAccess::None
        }
    }
}

/// What a user is allowed to do with an item, playback-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayAccess {
    Full,
    None,
}

/// Serializable point-in-time snapshot of an item, used in session DTOs and
/// event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseItemDto {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_time_ticks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
}

impl BaseItemDto {
    pub fn from_item(item: &BaseItem) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            media_type: item.media_type.clone(),
            run_time_ticks: item.run_time_ticks,
            series_id: item.series_id().map(str::to_owned),
        }
    }
}

/// A resolved media source for an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSourceInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_time_ticks: Option<i64>,
}

/// Library lookups used by the session core.
pub trait LibraryManager: Send + Sync {
    /// Returns the item with the given id, or None if it does not exist.
    fn get_item(&self, item_id: &str) -> Option<BaseItem>;

    /// Returns all items tagged by a by-name entity (person, genre, ...),
    /// folders and virtual items included. The caller filters.
    fn get_tagged_items(&self, by_name_item: &BaseItem) -> Vec<BaseItem>;

    /// Returns the recursive children of a folder, folders and virtual
    /// items included. The caller filters.
    fn get_recursive_children(&self, folder: &BaseItem) -> Vec<BaseItem>;

    /// Returns the full episode list of a series, in airing order, as
    /// visible to the given user.
    fn get_series_episodes(&self, series_id: &str, user_id: Uuid) -> Vec<BaseItem>;
}

/// Instant-mix playlist generation.
pub trait MusicManager: Send + Sync {
    fn instant_mix_from_item(&self, item: &BaseItem, user: Option<&User>) -> Vec<BaseItem>;
}

/// Media source resolution and live-stream bookkeeping.
#[async_trait]
pub trait MediaSourceManager: Send + Sync {
    async fn get_media_source(
        &self,
        item: &BaseItem,
        media_source_id: Option<&str>,
        live_stream_id: Option<&str>,
    ) -> Result<MediaSourceInfo>;

    async fn close_live_stream(&self, live_stream_id: &str) -> Result<()>;
}

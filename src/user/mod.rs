//! User model and the user-facing collaborators of the session core.

pub mod auth;

pub use auth::{
    new_access_token, AuthQuery, AuthenticationInfo, AuthenticationRepository,
    AuthenticationRequest, AuthenticationResult,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::library::BaseItem;

/// A single allowed window in a user's parental schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessSchedule {
    pub day_of_week: Weekday,
    /// Start of the window, in fractional hours from midnight.
    pub start_hour: f64,
    /// End of the window, in fractional hours from midnight.
    pub end_hour: f64,
}

/// Per-user policy bits the session core consults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPolicy {
    pub enable_media_playback: bool,
    pub enable_all_devices: bool,
    pub enabled_devices: Vec<String>,
    /// Empty means no schedule restriction.
    pub access_schedules: Vec<AccessSchedule>,
}

impl Default for UserPolicy {
    fn default() -> Self {
        Self {
            enable_media_playback: true,
            enable_all_devices: true,
            enabled_devices: Vec::new(),
            access_schedules: Vec::new(),
        }
    }
}

impl UserPolicy {
    /// Whether `at` falls inside the user's allowed schedule.
    pub fn is_within_schedule(&self, at: DateTime<Utc>) -> bool {
        if self.access_schedules.is_empty() {
            return true;
        }
        let hour = f64::from(at.hour()) + f64::from(at.minute()) / 60.0;
        self.access_schedules
            .iter()
            .any(|s| s.day_of_week == at.weekday() && hour >= s.start_hour && hour <= s.end_hour)
    }
}

/// Per-user preferences the playback paths honor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfiguration {
    pub remember_audio_selections: bool,
    pub remember_subtitle_selections: bool,
    pub enable_next_episode_auto_play: bool,
}

/// A server user, as the session core sees one.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub last_activity_date: Option<DateTime<Utc>>,
    pub policy: UserPolicy,
    pub configuration: UserConfiguration,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            last_activity_date: None,
            policy: UserPolicy::default(),
            configuration: UserConfiguration::default(),
        }
    }
}

/// Serializable snapshot of a user, returned from authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDto {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_date: Option<DateTime<Utc>>,
}

/// The user database, owned by another subsystem.
#[async_trait]
pub trait UserManager: Send + Sync {
    fn users(&self) -> Vec<User>;

    fn get_user_by_id(&self, user_id: Uuid) -> Option<User>;

    /// Case-insensitive lookup by user name.
    fn get_user_by_name(&self, name: &str) -> Option<User>;

    /// Validates credentials. Returns Ok(None) when they are wrong,
    /// Err only on infrastructure failure.
    #[allow(clippy::too_many_arguments)]
    async fn authenticate_user(
        &self,
        username: &str,
        password: Option<&str>,
        password_sha1: Option<&str>,
        password_md5: Option<&str>,
        remote_end_point: &str,
        is_user_session: bool,
    ) -> Result<Option<User>>;

    fn update_user(&self, user: &User) -> Result<()>;

    fn get_user_dto(&self, user: &User, remote_end_point: &str) -> UserDto;
}

/// Per-user, per-item playback bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserItemData {
    pub playback_position_ticks: i64,
    pub play_count: u32,
    pub played: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_played_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_stream_index: Option<i32>,
}

/// Why a user-data save is happening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDataSaveReason {
    PlaybackStart,
    PlaybackProgress,
    PlaybackFinished,
}

/// Persistence of per-user playback state, owned by another subsystem.
#[async_trait]
pub trait UserDataManager: Send + Sync {
    fn get_user_data(&self, user_id: Uuid, item: &BaseItem) -> UserItemData;

    /// Applies a position report to `data` and decides whether the item
    /// counts as played to completion.
    fn update_play_state(
        &self,
        item: &BaseItem,
        data: &mut UserItemData,
        position_ticks: Option<i64>,
    ) -> bool;

    async fn save_user_data(
        &self,
        user_id: Uuid,
        item: &BaseItem,
        data: &UserItemData,
        reason: UserDataSaveReason,
        token: &CancellationToken,
    ) -> Result<()>;
}

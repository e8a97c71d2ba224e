//! The in-memory session entity.
//!
//! Identity fields are immutable for the session's lifetime; everything the
//! transports keep refreshing lives behind one mutex and is read through
//! point-in-time snapshots. The two activity clocks are atomics so racing
//! reporters can only move them forward.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::devices::ClientCapabilities;
use crate::library::{BaseItem, BaseItemDto};

use super::controller::SessionController;
use super::manager::SessionManager;
use super::playback::{PlayState, PlaybackProgressInfo, TranscodingInfo};

/// An extra user attached to a shared session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUserInfo {
    pub user_id: Uuid,
    pub user_name: String,
}

#[derive(Default)]
struct SessionState {
    device_name: String,
    application_version: String,
    remote_end_point: String,
    app_icon_url: Option<String>,
    user_id: Option<Uuid>,
    user_name: Option<String>,
    additional_users: Vec<SessionUserInfo>,
    capabilities: ClientCapabilities,
    now_playing_item: Option<BaseItemDto>,
    full_now_playing_item: Option<BaseItem>,
    play_state: PlayState,
    transcoding_info: Option<TranscodingInfo>,
    controller: Option<Arc<dyn SessionController>>,
}

struct AutoProgress {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One live connection from one client app on one device.
pub struct Session {
    id: String,
    client: String,
    device_id: String,
    last_activity_us: AtomicI64,
    last_playback_check_in_us: AtomicI64,
    state: Mutex<SessionState>,
    auto_progress: Mutex<Option<AutoProgress>>,
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::UNIX_EPOCH)
}

impl Session {
    pub fn new(id: String, client: String, device_id: String) -> Self {
        Self {
            id,
            client,
            device_id,
            last_activity_us: AtomicI64::new(0),
            last_playback_check_in_us: AtomicI64::new(0),
            state: Mutex::new(SessionState::default()),
            auto_progress: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        from_micros(self.last_activity_us.load(Ordering::Acquire))
    }

    /// Advances the activity clock, never backwards. Returns the previous
    /// value so callers can rate-limit activity events.
    pub fn touch_activity(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let prev = self
            .last_activity_us
            .fetch_max(to_micros(at), Ordering::AcqRel);
        from_micros(prev)
    }

    pub fn last_playback_check_in(&self) -> DateTime<Utc> {
        from_micros(self.last_playback_check_in_us.load(Ordering::Acquire))
    }

    /// Only real client reports land here; automated progress never does.
    pub fn record_playback_check_in(&self, at: DateTime<Utc>) {
        self.last_playback_check_in_us
            .fetch_max(to_micros(at), Ordering::AcqRel);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state poisoned")
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.state().user_id
    }

    pub fn user_name(&self) -> Option<String> {
        self.state().user_name.clone()
    }

    /// Primary user first, additional users after.
    pub fn user_ids(&self) -> Vec<Uuid> {
        let state = self.state();
        let mut ids: Vec<Uuid> = state.user_id.into_iter().collect();
        for extra in &state.additional_users {
            if !ids.contains(&extra.user_id) {
                ids.push(extra.user_id);
            }
        }
        ids
    }

    pub fn additional_users(&self) -> Vec<SessionUserInfo> {
        self.state().additional_users.clone()
    }

    pub fn add_additional_user(&self, user: SessionUserInfo) {
        let mut state = self.state();
        if !state.additional_users.iter().any(|u| u.user_id == user.user_id) {
            state.additional_users.push(user);
        }
    }

    pub fn remove_additional_user(&self, user_id: Uuid) {
        self.state().additional_users.retain(|u| u.user_id != user_id);
    }

    /// Refreshes the fields every activity report carries.
    pub fn refresh_identity(
        &self,
        device_name: String,
        application_version: String,
        remote_end_point: String,
        user_id: Option<Uuid>,
        user_name: Option<String>,
    ) {
        let mut state = self.state();
        state.device_name = device_name;
        state.application_version = application_version;
        state.remote_end_point = remote_end_point;
        state.user_id = user_id;
        state.user_name = user_name;
        if state.user_id.is_none() {
            state.additional_users.clear();
        }
    }

    pub fn device_name(&self) -> String {
        self.state().device_name.clone()
    }

    pub fn set_device_name(&self, name: String) {
        self.state().device_name = name;
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        self.state().capabilities.clone()
    }

    pub fn apply_capabilities(&self, capabilities: ClientCapabilities) {
        let mut state = self.state();
        state.app_icon_url = capabilities.icon_url.clone();
        state.capabilities = capabilities;
    }

    pub fn playable_media_types(&self) -> Vec<String> {
        self.state().capabilities.playable_media_types.clone()
    }

    pub fn controller(&self) -> Option<Arc<dyn SessionController>> {
        self.state().controller.clone()
    }

    pub fn set_controller(&self, controller: Arc<dyn SessionController>) {
        self.state().controller = Some(controller);
    }

    pub fn is_active(&self) -> bool {
        self.controller()
            .map(|c| c.is_session_active())
            .unwrap_or(false)
    }

    pub fn supports_media_control(&self) -> bool {
        let declared = self.state().capabilities.supports_media_control;
        declared
            && self
                .controller()
                .map(|c| c.supports_media_control())
                .unwrap_or(false)
    }

    pub fn now_playing_item(&self) -> Option<BaseItemDto> {
        self.state().now_playing_item.clone()
    }

    pub fn full_now_playing_item(&self) -> Option<BaseItem> {
        self.state().full_now_playing_item.clone()
    }

    pub fn play_state(&self) -> PlayState {
        self.state().play_state.clone()
    }

    /// Transcoding info only exists while something is playing.
    pub fn transcoding_info(&self) -> Option<TranscodingInfo> {
        let state = self.state();
        if state.now_playing_item.is_none() {
            None
        } else {
            state.transcoding_info.clone()
        }
    }

    pub fn set_transcoding_info(&self, info: Option<TranscodingInfo>) {
        self.state().transcoding_info = info;
    }

    /// Applies a normalized playback report: now-playing snapshot, cached
    /// library entity and player state in one go.
    pub fn update_playback(
        &self,
        item: Option<BaseItemDto>,
        full_item: Option<BaseItem>,
        info: &PlaybackProgressInfo,
    ) {
        let mut state = self.state();
        state.now_playing_item = item;
        state.full_now_playing_item = full_item;
        info.apply_to(&mut state.play_state);
    }

    /// Ends the playback: clears the now-playing snapshot, the cached
    /// entity, the transcoding info and resets the player state.
    pub fn clear_now_playing(&self) {
        let mut state = self.state();
        state.now_playing_item = None;
        state.full_now_playing_item = None;
        state.transcoding_info = None;
        state.play_state = PlayState::default();
    }

    /// (Re)starts the automatic progress timer for the current playback.
    /// Any previous timer is cancelled first.
    pub fn start_automatic_progress(
        self: &Arc<Self>,
        manager: Weak<SessionManager>,
        info: PlaybackProgressInfo,
        interval: Duration,
    ) {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let session = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let Some(session) = session.upgrade() else { break };
                        let mut report = info.clone();
                        let play_state = session.play_state();
                        report.position_ticks = play_state.position_ticks;
                        report.is_paused = play_state.is_paused;
                        if let Err(e) = manager.on_playback_progress(report, true).await {
                            debug!(
                                "automatic progress report for session {} failed: {}",
                                session.id(),
                                e
                            );
                        }
                    }
                }
            }
        });

        let mut guard = self.auto_progress.lock().expect("auto progress poisoned");
        if let Some(previous) = guard.replace(AutoProgress { token, handle }) {
            previous.token.cancel();
            previous.handle.abort();
        }
    }

    pub fn stop_automatic_progress(&self) {
        let taken = self.auto_progress.lock().expect("auto progress poisoned").take();
        if let Some(auto) = taken {
            auto.token.cancel();
            auto.handle.abort();
        }
    }

    /// Tears the session down: stops the timer and releases the controller.
    pub fn dispose(&self) {
        self.stop_automatic_progress();
        self.state().controller = None;
    }

    /// Serializable point-in-time view of the session.
    pub fn to_dto(&self) -> SessionInfoDto {
        let controller = self.controller();
        let is_active = controller
            .as_ref()
            .map(|c| c.is_session_active())
            .unwrap_or(false);
        let state = self.state();
        SessionInfoDto {
            id: self.id.clone(),
            client: self.client.clone(),
            device_id: self.device_id.clone(),
            device_name: state.device_name.clone(),
            application_version: state.application_version.clone(),
            remote_end_point: state.remote_end_point.clone(),
            app_icon_url: state.app_icon_url.clone(),
            user_id: state.user_id,
            user_name: state.user_name.clone(),
            additional_users: state.additional_users.clone(),
            last_activity_date: self.last_activity(),
            last_playback_check_in: self.last_playback_check_in(),
            now_playing_item: state.now_playing_item.clone(),
            play_state: state.play_state.clone(),
            transcoding_info: if state.now_playing_item.is_none() {
                None
            } else {
                state.transcoding_info.clone()
            },
            playable_media_types: state.capabilities.playable_media_types.clone(),
            supported_commands: state.capabilities.supported_commands.clone(),
            supports_media_control: state.capabilities.supports_media_control,
            is_active,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(auto) = self.auto_progress.lock().ok().and_then(|mut g| g.take()) {
            auto.token.cancel();
            auto.handle.abort();
        }
    }
}

/// Serializable snapshot of a session, used in events, notifications and
/// admin listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfoDto {
    pub id: String,
    pub client: String,
    pub device_id: String,
    pub device_name: String,
    pub application_version: String,
    pub remote_end_point: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_icon_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default)]
    pub additional_users: Vec<SessionUserInfo>,
    pub last_activity_date: DateTime<Utc>,
    pub last_playback_check_in: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now_playing_item: Option<BaseItemDto>,
    pub play_state: PlayState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcoding_info: Option<TranscodingInfo>,
    #[serde(default)]
    pub playable_media_types: Vec<String>,
    #[serde(default)]
    pub supported_commands: Vec<String>,
    pub supports_media_control: bool,
    pub is_active: bool,
}

impl Default for SessionInfoDto {
    fn default() -> Self {
        Self {
            id: String::new(),
            client: String::new(),
            device_id: String::new(),
            device_name: String::new(),
            application_version: String::new(),
            remote_end_point: String::new(),
            app_icon_url: None,
            user_id: None,
            user_name: None,
            additional_users: Vec::new(),
            last_activity_date: DateTime::UNIX_EPOCH,
            last_playback_check_in: DateTime::UNIX_EPOCH,
            now_playing_item: None,
            play_state: PlayState::default(),
            transcoding_info: None,
            playable_media_types: Vec::new(),
            supported_commands: Vec::new(),
            supports_media_control: false,
            is_active: false,
        }
    }
}

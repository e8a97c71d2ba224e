//! The session manager: concurrency hub tying sessions, users, devices,
//! playback and access tokens together.
//!
//! One serializing lock guards the registry mutation path (activity reports
//! and session teardown); everything else works on snapshots. Fan-out to
//! controllers, user-data persistence and library lookups always run outside
//! that lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionsConfig;
use crate::devices::{ClientCapabilities, DeviceManager, DeviceOptionsUpdated};
use crate::library::{
    BaseItem, BaseItemDto, LibraryManager, MediaSourceManager, MusicManager, PlayAccess,
};
use crate::user::{
    new_access_token, AuthQuery, AuthenticationInfo, AuthenticationRepository,
    AuthenticationRequest, AuthenticationResult, User, UserDataManager, UserDataSaveReason,
    UserManager,
};

use super::commands::{
    command_names, filter_to_single_media_type, shuffle_in_place, sort_for_playback,
    BrowseRequest, GeneralCommand, MessageCommand, PlayCommand, PlayRequest, PlaystateRequest,
    RandomSource,
};
use super::controller::{ControllerFactory, SessionController};
use super::error::SessionError;
use super::events::{EventBus, PlaybackEventInfo, SessionEvent};
use super::playback::{
    PlayMethod, PlaybackProgressInfo, PlaybackStartInfo, PlaybackStopInfo, TranscodingInfo,
};
use super::registry::{session_id_for_key, session_key, SessionRegistry};
use super::session::{Session, SessionUserInfo};

/// Everything the session manager binds from the rest of the server.
pub struct Collaborators {
    pub user_manager: Arc<dyn UserManager>,
    pub user_data: Arc<dyn UserDataManager>,
    pub library: Arc<dyn LibraryManager>,
    pub music: Arc<dyn MusicManager>,
    pub media_sources: Arc<dyn MediaSourceManager>,
    pub device_manager: Arc<dyn DeviceManager>,
    pub auth_repo: Arc<dyn AuthenticationRepository>,
    pub controller_factories: Vec<Arc<dyn ControllerFactory>>,
    pub random: Arc<dyn RandomSource>,
}

struct IdleSweep {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SessionManager {
    config: SessionsConfig,
    registry: SessionRegistry,
    /// Serializes the registry mutation path. Never held across controller
    /// I/O, persistence or event listener work.
    mutation_lock: Mutex<()>,
    events: EventBus,

    user_manager: Arc<dyn UserManager>,
    user_data: Arc<dyn UserDataManager>,
    library: Arc<dyn LibraryManager>,
    music: Arc<dyn MusicManager>,
    media_sources: Arc<dyn MediaSourceManager>,
    device_manager: Arc<dyn DeviceManager>,
    auth_repo: Arc<dyn AuthenticationRepository>,
    controller_factories: Vec<Arc<dyn ControllerFactory>>,
    random: Arc<dyn RandomSource>,

    idle_sweep: StdMutex<Option<IdleSweep>>,
    teardown: TaskTracker,
    shutdown_token: CancellationToken,
    disposed: AtomicBool,
}

impl SessionManager {
    /// Builds the manager and starts listening for device option edits.
    /// Must be called from within a tokio runtime.
    pub fn new(config: SessionsConfig, collaborators: Collaborators) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            mutation_lock: Mutex::new(()),
            events: EventBus::default(),
            user_manager: collaborators.user_manager,
            user_data: collaborators.user_data,
            library: collaborators.library,
            music: collaborators.music,
            media_sources: collaborators.media_sources,
            device_manager: collaborators.device_manager,
            auth_repo: collaborators.auth_repo,
            controller_factories: collaborators.controller_factories,
            random: collaborators.random,
            idle_sweep: StdMutex::new(None),
            teardown: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });
        manager.spawn_device_options_listener();
        manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of all sessions, most recently active first.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.registry.snapshot().await
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry.get_by_session_id(session_id).await
    }

    pub async fn get_sessions_by_device(&self, device_id: &str) -> Vec<Arc<Session>> {
        self.registry.get_by_device_id(device_id).await
    }

    pub async fn get_session_by_device_and_client(
        &self,
        device_id: &str,
        client: &str,
    ) -> Option<Arc<Session>> {
        self.registry.get_by_device_and_client(device_id, client).await
    }

    fn ensure_not_disposed(&self) -> Result<(), SessionError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(SessionError::Disposed)
        } else {
            Ok(())
        }
    }

    fn build_controller(&self, session: &Arc<Session>) -> Option<Arc<dyn SessionController>> {
        self.controller_factories
            .iter()
            .find_map(|factory| factory.get_session_controller(session))
    }

    // ------------------------------------------------------------------
    // Activity & lifecycle
    // ------------------------------------------------------------------

    /// Records one activity report from a transport, creating the session
    /// on first contact with an unknown (client, device) tuple.
    pub async fn log_session_activity(
        self: &Arc<Self>,
        app_name: &str,
        app_version: &str,
        device_id: &str,
        device_name: &str,
        remote_end_point: &str,
        user: Option<&User>,
    ) -> Result<Arc<Session>, SessionError> {
        self.ensure_not_disposed()?;
        require_non_empty("app_name", app_name)?;
        require_non_empty("app_version", app_version)?;
        require_non_empty("device_id", device_id)?;
        require_non_empty("device_name", device_name)?;
        require_non_empty("remote_end_point", remote_end_point)?;

        let key = session_key(app_name, device_id);
        let session = {
            let _guard = self.mutation_lock.lock().await;

            let display_name = self
                .device_manager
                .get_device(device_id)
                .and_then(|d| d.custom_name)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| device_name.to_string());

            let session = match self.registry.get(&key).await {
                Some(session) => session,
                None => {
                    let session = Arc::new(Session::new(
                        session_id_for_key(&key),
                        app_name.to_string(),
                        device_id.to_string(),
                    ));
                    session.refresh_identity(
                        display_name.clone(),
                        app_version.to_string(),
                        remote_end_point.to_string(),
                        user.map(|u| u.id),
                        user.map(|u| u.name.clone()),
                    );
                    info!(
                        "session started: {} version {} on {} ({})",
                        app_name, app_version, display_name, device_id
                    );
                    self.events
                        .publish(SessionEvent::SessionStarted(session.to_dto()));

                    if let Some(capabilities) = self.device_manager.get_capabilities(device_id) {
                        session.apply_capabilities(capabilities);
                    }

                    let session = self.registry.insert_if_absent(key.clone(), session).await;
                    if let Err(e) = self.device_manager.register_device(
                        device_id,
                        device_name,
                        app_name,
                        app_version,
                        user.map(|u| u.id),
                    ) {
                        warn!("failed to register device {}: {}", device_id, e);
                    }
                    session
                }
            };

            session.refresh_identity(
                display_name,
                app_version.to_string(),
                remote_end_point.to_string(),
                user.map(|u| u.id),
                user.map(|u| u.name.clone()),
            );

            if session.controller().is_none() {
                if let Some(controller) = self.build_controller(&session) {
                    session.set_controller(controller);
                }
            }

            session
        };

        let activity_date = Utc::now();
        let previous = session.touch_activity(activity_date);
        let activity_gap = activity_date.signed_duration_since(previous);
        if activity_gap > to_chrono(self.config.activity_event_threshold) {
            self.events
                .publish(SessionEvent::SessionActivity(session.to_dto()));
        }

        if let Some(user) = user {
            let stale = user
                .last_activity_date
                .map(|d| {
                    activity_date.signed_duration_since(d)
                        > to_chrono(self.config.user_activity_update_threshold)
                })
                .unwrap_or(true);
            if stale {
                let mut updated = user.clone();
                updated.last_activity_date = Some(activity_date);
                if let Err(e) = self.user_manager.update_user(&updated) {
                    error!(
                        "failed to update activity date of user {}: {}",
                        user.name, e
                    );
                }
            }
        }

        if let Some(controller) = session.controller() {
            controller.on_activity();
        }

        Ok(session)
    }

    /// Removes the session and tears it down. The removal is authoritative;
    /// notification and disposal failures are logged and swallowed.
    pub async fn report_session_ended(self: &Arc<Self>, session_id: &str) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;

        let removed = {
            let _guard = self.mutation_lock.lock().await;
            match self.registry.get_by_session_id(session_id).await {
                Some(session) => {
                    let key = session_key(session.client(), session.device_id());
                    self.registry.remove(&key).await
                }
                None => None,
            }
        };
        let Some(session) = removed else {
            return Ok(());
        };

        info!(
            "session ended: {} on device {}",
            session.client(),
            session.device_id()
        );
        let dto = session.to_dto();
        self.events.publish(SessionEvent::SessionEnded(dto.clone()));

        let manager = Arc::clone(self);
        let _ = self.teardown.spawn(async move {
            manager
                .fan_out("SessionEnded", |controller, token| {
                    let dto = dto.clone();
                    async move { controller.send_session_ended_notification(&dto, &token).await }
                })
                .await;
            session.dispose();
        });

        Ok(())
    }

    /// Updates the session's declared capabilities, rebinding the controller
    /// when the client switched its callback transport.
    pub async fn report_capabilities(
        &self,
        session_id: &str,
        capabilities: ClientCapabilities,
        save: bool,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let session = self.get_session_internal(session_id).await?;
        session.apply_capabilities(capabilities.clone());

        let rebind = match capabilities.message_callback_url.as_deref() {
            Some(url) => {
                let bound = session.controller().and_then(|c| c.transport_descriptor());
                bound.as_deref() != Some(url)
            }
            None => session.controller().is_none(),
        };
        if rebind {
            if let Some(controller) = self.build_controller(&session) {
                session.set_controller(controller);
            }
        }

        self.events.publish(SessionEvent::CapabilitiesChanged {
            session: session.to_dto(),
            capabilities: capabilities.clone(),
        });

        if save {
            self.device_manager
                .save_capabilities(session.device_id(), &capabilities)
                .map_err(SessionError::Internal)?;
        }
        Ok(())
    }

    /// Stamps the transcoding snapshot onto every session of the device.
    pub async fn report_transcoding_info(
        &self,
        device_id: &str,
        info: Option<TranscodingInfo>,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        for session in self.registry.get_by_device_id(device_id).await {
            session.set_transcoding_info(info.clone());
        }
        Ok(())
    }

    pub async fn clear_transcoding_info(&self, device_id: &str) -> Result<(), SessionError> {
        self.report_transcoding_info(device_id, None).await
    }

    /// Viewing reports are accepted but not tracked yet.
    pub fn report_now_viewing_item(
        &self,
        session_id: &str,
        item_id: &str,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        debug!("session {} is viewing item {}", session_id, item_id);
        Ok(())
    }

    pub async fn add_additional_user(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let session = self.get_session_internal(session_id).await?;
        let Some(primary) = session.user_id() else {
            return Err(SessionError::invalid_argument(
                "session has no primary user",
            ));
        };
        if primary == user_id {
            return Err(SessionError::invalid_argument(
                "user is already the primary user of the session",
            ));
        }
        let user = self
            .user_manager
            .get_user_by_id(user_id)
            .ok_or_else(|| SessionError::invalid_argument(format!("unknown user {}", user_id)))?;
        session.add_additional_user(SessionUserInfo {
            user_id,
            user_name: user.name,
        });
        Ok(())
    }

    pub async fn remove_additional_user(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let session = self.get_session_internal(session_id).await?;
        session.remove_additional_user(user_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Playback state machine
    // ------------------------------------------------------------------

    pub async fn on_playback_start(
        self: &Arc<Self>,
        mut info: PlaybackStartInfo,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        require_non_empty("session_id", &info.session_id)?;
        let session = self.get_session_internal(&info.session_id).await?;

        let library_item = info
            .item_id
            .as_deref()
            .and_then(|id| self.library.get_item(id));
        self.update_now_playing_item(&session, &mut info, library_item.clone(), true)
            .await;

        if info.play_method != Some(PlayMethod::Transcode) {
            session.set_transcoding_info(None);
        }

        session.start_automatic_progress(
            Arc::downgrade(self),
            info.clone(),
            self.config.auto_progress_interval,
        );

        let user_ids = session.user_ids();
        if let Some(item) = &library_item {
            for user_id in &user_ids {
                self.on_playback_start_user(*user_id, item).await;
            }
        }

        info!(
            "playback started in session {}: {}",
            session.id(),
            info.item.as_ref().map(|i| i.name.as_str()).unwrap_or("unknown item")
        );
        self.events.publish(SessionEvent::PlaybackStart(PlaybackEventInfo {
            session: session.to_dto(),
            item: info.item.clone(),
            media_source_id: info.media_source_id.clone(),
            position_ticks: info.position_ticks,
            user_ids,
        }));

        let dto = session.to_dto();
        self.fan_out("PlaybackStart", |controller, token| {
            let dto = dto.clone();
            async move { controller.send_playback_start_notification(&dto, &token).await }
        })
        .await;

        self.arm_idle_sweep();
        Ok(())
    }

    pub async fn on_playback_progress(
        self: &Arc<Self>,
        mut info: PlaybackProgressInfo,
        is_automated: bool,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        require_non_empty("session_id", &info.session_id)?;
        let session = self.get_session_internal(&info.session_id).await?;

        let library_item = info
            .item_id
            .as_deref()
            .and_then(|id| self.library.get_item(id));
        self.update_now_playing_item(&session, &mut info, library_item.clone(), !is_automated)
            .await;

        if info.position_ticks.is_some() {
            if let Some(item) = &library_item {
                for user_id in session.user_ids() {
                    self.save_playback_progress(user_id, item, &info).await;
                }
            }
        }

        self.events.publish(SessionEvent::PlaybackProgress {
            info: PlaybackEventInfo {
                session: session.to_dto(),
                item: info.item.clone(),
                media_source_id: info.media_source_id.clone(),
                position_ticks: info.position_ticks,
                user_ids: session.user_ids(),
            },
            is_automated,
        });

        if !is_automated {
            session.start_automatic_progress(
                Arc::downgrade(self),
                info.clone(),
                self.config.auto_progress_interval,
            );
        }

        self.arm_idle_sweep();
        Ok(())
    }

    pub async fn on_playback_stopped(
        self: &Arc<Self>,
        mut info: PlaybackStopInfo,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        require_non_empty("session_id", &info.session_id)?;
        if info.position_ticks.is_some_and(|ticks| ticks < 0) {
            return Err(SessionError::invalid_argument(
                "position_ticks must not be negative",
            ));
        }
        let session = self.get_session_internal(&info.session_id).await?;

        session.stop_automatic_progress();

        let library_item = info
            .item_id
            .as_deref()
            .and_then(|id| self.library.get_item(id));
        if info.media_source_id.as_deref().map_or(true, str::is_empty) {
            info.media_source_id = info.item_id.clone();
        }
        if info.item.is_none() {
            if let Some(item) = &library_item {
                info.item = Some(
                    self.item_snapshot(
                        item,
                        info.media_source_id.as_deref(),
                        info.live_stream_id.as_deref(),
                    )
                    .await,
                );
            }
        }

        let position_label = info
            .position_ticks
            .map(|ticks| format!("{} ms", ticks / 10_000))
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            "playback stopped in session {}: {} at {}",
            session.id(),
            info.item.as_ref().map(|i| i.name.as_str()).unwrap_or("unknown item"),
            position_label
        );

        session.clear_now_playing();

        let user_ids = session.user_ids();
        let mut played_to_completion = false;
        if let Some(item) = &library_item {
            for user_id in &user_ids {
                played_to_completion = self
                    .on_playback_stopped_user(*user_id, item, info.position_ticks)
                    .await;
            }
        }

        if let Some(live_stream_id) = &info.live_stream_id {
            if let Err(e) = self.media_sources.close_live_stream(live_stream_id).await {
                error!("failed to close live stream {}: {}", live_stream_id, e);
            }
        }

        self.events.publish(SessionEvent::PlaybackStopped {
            info: PlaybackEventInfo {
                session: session.to_dto(),
                item: info.item.clone(),
                media_source_id: info.media_source_id.clone(),
                position_ticks: info.position_ticks,
                user_ids,
            },
            played_to_completion,
        });

        let dto = session.to_dto();
        self.fan_out("PlaybackStopped", |controller, token| {
            let dto = dto.clone();
            async move {
                controller
                    .send_playback_stopped_notification(&dto, &token)
                    .await
            }
        })
        .await;

        Ok(())
    }

    /// Normalizes a start/progress report and applies it to the session:
    /// defaults the media source to the item, reuses the current now-playing
    /// snapshot when the item did not change and builds a fresh one (runtime
    /// taken from the media source when it has one) otherwise.
    async fn update_now_playing_item(
        &self,
        session: &Arc<Session>,
        info: &mut PlaybackProgressInfo,
        library_item: Option<BaseItem>,
        update_check_in: bool,
    ) {
        if info.media_source_id.as_deref().map_or(true, str::is_empty) {
            info.media_source_id = info.item_id.clone();
        }

        if info.item.is_none() {
            if let Some(item) = &library_item {
                let current = session.now_playing_item();
                if current.as_ref().is_some_and(|playing| playing.id == item.id) {
                    info.item = current;
                } else {
                    info.item = Some(
                        self.item_snapshot(
                            item,
                            info.media_source_id.as_deref(),
                            info.live_stream_id.as_deref(),
                        )
                        .await,
                    );
                }
            }
        }

        session.update_playback(info.item.clone(), library_item, info);
        if update_check_in {
            session.record_playback_check_in(Utc::now());
        }
    }

    async fn item_snapshot(
        &self,
        item: &BaseItem,
        media_source_id: Option<&str>,
        live_stream_id: Option<&str>,
    ) -> BaseItemDto {
        let mut dto = BaseItemDto::from_item(item);
        if item.has_media_sources {
            match self
                .media_sources
                .get_media_source(item, media_source_id, live_stream_id)
                .await
            {
                Ok(source) => {
                    if let Some(ticks) = source.run_time_ticks {
                        dto.run_time_ticks = Some(ticks);
                    }
                }
                Err(e) => debug!("could not resolve media source for {}: {}", item.id, e),
            }
        }
        dto
    }

    async fn on_playback_start_user(&self, user_id: Uuid, item: &BaseItem) {
        let mut data = self.user_data.get_user_data(user_id, item);
        data.play_count += 1;
        data.last_played_date = Some(Utc::now());
        // Videos only count as played once watched to completion.
        if item.supports_played_status && !item.is_video() {
            data.played = true;
        }
        let token = self.shutdown_token.child_token();
        if let Err(e) = self
            .user_data
            .save_user_data(user_id, item, &data, UserDataSaveReason::PlaybackStart, &token)
            .await
        {
            error!(
                "failed to save playback start data for user {}: {}",
                user_id, e
            );
        }
    }

    async fn save_playback_progress(
        &self,
        user_id: Uuid,
        item: &BaseItem,
        info: &PlaybackProgressInfo,
    ) {
        let mut data = self.user_data.get_user_data(user_id, item);
        self.user_data
            .update_play_state(item, &mut data, info.position_ticks);

        if let Some(user) = self.user_manager.get_user_by_id(user_id) {
            if user.configuration.remember_audio_selections {
                data.audio_stream_index = info.audio_stream_index;
            } else {
                data.audio_stream_index = None;
            }
            if user.configuration.remember_subtitle_selections {
                data.subtitle_stream_index = info.subtitle_stream_index;
            } else {
                data.subtitle_stream_index = None;
            }
        }

        let token = self.shutdown_token.child_token();
        if let Err(e) = self
            .user_data
            .save_user_data(
                user_id,
                item,
                &data,
                UserDataSaveReason::PlaybackProgress,
                &token,
            )
            .await
        {
            error!(
                "failed to save playback progress data for user {}: {}",
                user_id, e
            );
        }
    }

    async fn on_playback_stopped_user(
        &self,
        user_id: Uuid,
        item: &BaseItem,
        position_ticks: Option<i64>,
    ) -> bool {
        let mut data = self.user_data.get_user_data(user_id, item);
        let played_to_completion = match position_ticks {
            Some(ticks) => self
                .user_data
                .update_play_state(item, &mut data, Some(ticks)),
            None => {
                // No position reported: assume the item was fully played.
                data.played = item.supports_played_status;
                data.playback_position_ticks = 0;
                data.play_count += 1;
                true
            }
        };

        let token = self.shutdown_token.child_token();
        if let Err(e) = self
            .user_data
            .save_user_data(
                user_id,
                item,
                &data,
                UserDataSaveReason::PlaybackFinished,
                &token,
            )
            .await
        {
            error!(
                "failed to save playback stop data for user {}: {}",
                user_id, e
            );
        }
        played_to_completion
    }

    // ------------------------------------------------------------------
    // Idle sweeper
    // ------------------------------------------------------------------

    fn arm_idle_sweep(self: &Arc<Self>) {
        let mut guard = self.idle_sweep.lock().expect("idle sweep lock poisoned");
        if guard.is_some() {
            return;
        }
        let token = self.shutdown_token.child_token();
        let task_token = token.clone();
        let weak = Arc::downgrade(self);
        let interval = self.config.idle_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.check_for_idle_playback().await;
                    }
                }
            }
        });
        *guard = Some(IdleSweep { token, handle });
    }

    fn disarm_idle_sweep(&self) {
        let taken = self
            .idle_sweep
            .lock()
            .expect("idle sweep lock poisoned")
            .take();
        if let Some(sweep) = taken {
            sweep.token.cancel();
            drop(sweep.handle);
        }
    }

    /// One sweep tick: synthesize a stop for every playing session whose
    /// last real check-in is too old, then disarm if nothing plays anymore.
    async fn check_for_idle_playback(self: &Arc<Self>) {
        let threshold = to_chrono(self.config.idle_playback_threshold);
        let now = Utc::now();

        let stalled: Vec<Arc<Session>> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.now_playing_item().is_some())
            .filter(|s| now.signed_duration_since(s.last_playback_check_in()) > threshold)
            .collect();

        for session in stalled {
            info!(
                "no playback reports from session {} for over {:?}, ending its playback",
                session.id(),
                self.config.idle_playback_threshold
            );
            let play_state = session.play_state();
            let stop_info = PlaybackStopInfo {
                session_id: session.id().to_string(),
                item_id: session.now_playing_item().map(|i| i.id),
                media_source_id: play_state.media_source_id.clone(),
                position_ticks: play_state.position_ticks,
                live_stream_id: play_state.live_stream_id.clone(),
                failed: false,
                item: session.now_playing_item(),
            };
            if let Err(e) = self.on_playback_stopped(stop_info).await {
                error!(
                    "failed to end idle playback in session {}: {}",
                    session.id(),
                    e
                );
            }
        }

        let any_playing = self
            .registry
            .snapshot()
            .await
            .iter()
            .any(|s| s.now_playing_item().is_some());
        if !any_playing {
            self.disarm_idle_sweep();
        }
    }

    // ------------------------------------------------------------------
    // Remote control
    // ------------------------------------------------------------------

    async fn get_session_internal(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.registry
            .get_by_session_id(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Resolves the controlled and (optionally) controlling session and
    /// validates that the latter may drive the former.
    async fn get_session_to_control(
        &self,
        controlling_session_id: Option<&str>,
        target_session_id: &str,
    ) -> Result<(Arc<Session>, Option<Arc<Session>>), SessionError> {
        let target = self.get_session_internal(target_session_id).await?;
        let controlling = match controlling_session_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                let controlling = self.get_session_internal(id).await?;
                assert_can_control(&target, &controlling)?;
                Some(controlling)
            }
            None => None,
        };
        Ok((target, controlling))
    }

    pub async fn send_general_command(
        &self,
        controlling_session_id: Option<&str>,
        session_id: &str,
        mut command: GeneralCommand,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let (target, controlling) = self
            .get_session_to_control(controlling_session_id, session_id)
            .await?;
        if let Some(controlling) = &controlling {
            command.controlling_user_id = controlling.user_id();
        }
        let Some(controller) = target.controller() else {
            debug!(
                "session {} has no controller bound, dropping {} command",
                target.id(),
                command.name
            );
            return Ok(());
        };
        controller
            .send_general_command(&command, token)
            .await
            .map_err(SessionError::Internal)
    }

    pub async fn send_playstate_command(
        &self,
        controlling_session_id: Option<&str>,
        session_id: &str,
        mut request: PlaystateRequest,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let (target, controlling) = self
            .get_session_to_control(controlling_session_id, session_id)
            .await?;
        if let Some(controlling) = &controlling {
            request.controlling_user_id = controlling.user_id();
        }
        let Some(controller) = target.controller() else {
            debug!(
                "session {} has no controller bound, dropping playstate command",
                target.id()
            );
            return Ok(());
        };
        controller
            .send_playstate_command(&request, token)
            .await
            .map_err(SessionError::Internal)
    }

    pub async fn send_message_command(
        &self,
        controlling_session_id: Option<&str>,
        session_id: &str,
        message: MessageCommand,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        let mut arguments = HashMap::new();
        arguments.insert("Header".to_string(), message.header);
        arguments.insert("Text".to_string(), message.text);
        if let Some(timeout_ms) = message.timeout_ms {
            arguments.insert("TimeoutMs".to_string(), timeout_ms.to_string());
        }
        self.send_general_command(
            controlling_session_id,
            session_id,
            GeneralCommand {
                name: command_names::DISPLAY_MESSAGE.to_string(),
                controlling_user_id: None,
                arguments,
            },
            token,
        )
        .await
    }

    pub async fn send_browse_command(
        &self,
        controlling_session_id: Option<&str>,
        session_id: &str,
        browse: BrowseRequest,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        let mut arguments = HashMap::new();
        arguments.insert("ItemId".to_string(), browse.item_id);
        arguments.insert("ItemName".to_string(), browse.item_name);
        arguments.insert("ItemType".to_string(), browse.item_type);
        self.send_general_command(
            controlling_session_id,
            session_id,
            GeneralCommand {
                name: command_names::DISPLAY_CONTENT.to_string(),
                controlling_user_id: None,
                arguments,
            },
            token,
        )
        .await
    }

    pub async fn send_play_command(
        &self,
        controlling_session_id: Option<&str>,
        session_id: &str,
        mut request: PlayRequest,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let (target, controlling) = self
            .get_session_to_control(controlling_session_id, session_id)
            .await?;
        if let Some(controlling) = &controlling {
            request.controlling_user_id = controlling.user_id();
        }
        let user = target
            .user_id()
            .and_then(|id| self.user_manager.get_user_by_id(id));

        let mut items: Vec<BaseItem> = if request.play_command == PlayCommand::PlayInstantMix {
            let mixed = request
                .item_ids
                .iter()
                .filter_map(|id| self.library.get_item(id))
                .flat_map(|item| self.music.instant_mix_from_item(&item, user.as_ref()))
                .collect();
            request.play_command = PlayCommand::PlayNow;
            mixed
        } else {
            let mut list = Vec::new();
            for item_id in &request.item_ids {
                list.extend(self.translate_item_for_playback(item_id));
            }
            list
        };

        if request.play_command == PlayCommand::PlayShuffle {
            shuffle_in_place(&mut items, self.random.as_ref());
            request.play_command = PlayCommand::PlayNow;
        }

        request.item_ids = items.iter().map(|i| i.id.clone()).collect();

        if let Some(user) = &user {
            if items.iter().any(|i| i.play_access(user) != PlayAccess::Full) {
                return Err(SessionError::invalid_argument(format!(
                    "user {} is not allowed to play media",
                    user.name
                )));
            }
        }

        let playable = target.playable_media_types();
        let unplayable = items.iter().any(|item| {
            let media_type = item.media_type.as_deref().unwrap_or_default();
            !playable.iter().any(|t| t.eq_ignore_ascii_case(media_type))
        });
        if unplayable {
            return Err(SessionError::invalid_argument(
                "the session is unable to play the requested media type",
            ));
        }

        if let Some(user) = &user {
            if user.configuration.enable_next_episode_auto_play && request.item_ids.len() == 1 {
                if let Some(episode) = self.library.get_item(&request.item_ids[0]) {
                    if let Some(series_id) = episode.series_id() {
                        let episodes: Vec<BaseItem> = self
                            .library
                            .get_series_episodes(series_id, user.id)
                            .into_iter()
                            .filter(|e| !e.is_virtual)
                            .skip_while(|e| e.id != episode.id)
                            .collect();
                        if !episodes.is_empty() {
                            request.item_ids = episodes.iter().map(|e| e.id.clone()).collect();
                        }
                    }
                }
            }
        }

        let Some(controller) = target.controller() else {
            debug!(
                "session {} has no controller bound, dropping play command",
                target.id()
            );
            return Ok(());
        };
        controller
            .send_play_command(&request, token)
            .await
            .map_err(SessionError::Internal)
    }

    /// Expands a queued item id into the playable items it stands for.
    fn translate_item_for_playback(&self, item_id: &str) -> Vec<BaseItem> {
        let Some(item) = self.library.get_item(item_id) else {
            error!("item {} not found, dropping it from the play queue", item_id);
            return Vec::new();
        };

        let children = if item.is_by_name() {
            Some(self.library.get_tagged_items(&item))
        } else if item.is_folder() {
            Some(self.library.get_recursive_children(&item))
        } else {
            None
        };

        match children {
            Some(children) => {
                let playable: Vec<BaseItem> = children
                    .into_iter()
                    .filter(|c| !c.is_folder() && !c.is_virtual)
                    .collect();
                let mut filtered = filter_to_single_media_type(playable);
                sort_for_playback(&mut filtered);
                filtered
            }
            None => vec![item],
        }
    }

    // ------------------------------------------------------------------
    // Authentication & token lifecycle
    // ------------------------------------------------------------------

    pub async fn authenticate_new_session(
        self: &Arc<Self>,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResult, SessionError> {
        self.authenticate_new_session_internal(request, true).await
    }

    /// Like [`Self::authenticate_new_session`] but trusts the caller and
    /// skips credential verification.
    pub async fn create_new_session(
        self: &Arc<Self>,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResult, SessionError> {
        self.authenticate_new_session_internal(request, false).await
    }

    async fn authenticate_new_session_internal(
        self: &Arc<Self>,
        request: AuthenticationRequest,
        enforce_password: bool,
    ) -> Result<AuthenticationResult, SessionError> {
        self.ensure_not_disposed()?;
        require_non_empty("app_name", &request.app_name)?;
        require_non_empty("app_version", &request.app_version)?;
        require_non_empty("device_id", &request.device_id)?;
        require_non_empty("device_name", &request.device_name)?;
        require_non_empty("remote_end_point", &request.remote_end_point)?;

        let mut user = request
            .user_id
            .and_then(|id| self.user_manager.get_user_by_id(id))
            .or_else(|| {
                request
                    .username
                    .as_deref()
                    .and_then(|name| self.user_manager.get_user_by_name(name))
            });

        if let Some(found) = &user {
            if !found.policy.is_within_schedule(Utc::now()) {
                return Err(SessionError::denied(format!(
                    "user {} is not allowed access at this time",
                    found.name
                )));
            }
            if !self
                .device_manager
                .can_access_device(found, &request.device_id)
            {
                return Err(SessionError::denied(format!(
                    "user {} is not allowed access from device {}",
                    found.name, request.device_id
                )));
            }
        }

        if enforce_password {
            let username = request
                .username
                .clone()
                .or_else(|| user.as_ref().map(|u| u.name.clone()))
                .unwrap_or_default();
            let authenticated = self
                .user_manager
                .authenticate_user(
                    &username,
                    request.password.as_deref(),
                    request.password_sha1.as_deref(),
                    request.password_md5.as_deref(),
                    &request.remote_end_point,
                    true,
                )
                .await
                .map_err(SessionError::Internal)?;
            match authenticated {
                Some(authenticated) => user = Some(authenticated),
                None => {
                    warn!(
                        "authentication failed for {} from {}",
                        username, request.remote_end_point
                    );
                    self.publish_authentication_failed(&request);
                    return Err(SessionError::denied("invalid username or password"));
                }
            }
        }

        let Some(user) = user else {
            self.publish_authentication_failed(&request);
            return Err(SessionError::denied("user not found"));
        };

        let access_token = self
            .get_authorization_token(&user, &request)
            .map_err(SessionError::Internal)?;

        let session = self
            .log_session_activity(
                &request.app_name,
                &request.app_version,
                &request.device_id,
                &request.device_name,
                &request.remote_end_point,
                Some(&user),
            )
            .await?;

        let result = AuthenticationResult {
            user: self
                .user_manager
                .get_user_dto(&user, &request.remote_end_point),
            session_info: session.to_dto(),
            access_token,
            server_id: self.config.server_id.clone(),
        };
        self.events
            .publish(SessionEvent::AuthenticationSucceeded(result.clone()));
        Ok(result)
    }

    fn publish_authentication_failed(&self, request: &AuthenticationRequest) {
        self.events.publish(SessionEvent::AuthenticationFailed {
            username: request.username.clone(),
            app_name: request.app_name.clone(),
            device_id: request.device_id.clone(),
            remote_end_point: request.remote_end_point.clone(),
        });
    }

    /// Reuses the device's active token for the user when one exists,
    /// otherwise mints and persists a fresh one.
    fn get_authorization_token(
        &self,
        user: &User,
        request: &AuthenticationRequest,
    ) -> anyhow::Result<String> {
        let existing = self.auth_repo.get(&AuthQuery {
            device_id: Some(request.device_id.clone()),
            user_id: Some(user.id),
            is_active: Some(true),
            limit: Some(1),
            ..AuthQuery::default()
        })?;
        if let Some(row) = existing.into_iter().next() {
            debug!(
                "reusing active access token of device {} for {}",
                request.device_id, user.name
            );
            return Ok(row.access_token);
        }

        let info = AuthenticationInfo {
            access_token: new_access_token(),
            device_id: request.device_id.clone(),
            device_name: request.device_name.clone(),
            app_name: request.app_name.clone(),
            app_version: request.app_version.clone(),
            user_id: Some(user.id),
            user_name: Some(user.name.clone()),
            is_active: true,
            date_created: Utc::now(),
            date_revoked: None,
        };
        self.auth_repo.create(&info)?;
        info!(
            "issued new access token for {} on device {}",
            user.name, request.device_id
        );
        Ok(info.access_token)
    }

    /// Resolves the session belonging to an access token, attaching it on
    /// the fly via the regular activity path.
    pub async fn get_session_by_authentication_token(
        self: &Arc<Self>,
        access_token: &str,
        device_id: Option<&str>,
        remote_end_point: &str,
        app_version: Option<&str>,
    ) -> Result<Arc<Session>, SessionError> {
        self.ensure_not_disposed()?;
        let rows = self
            .auth_repo
            .get(&AuthQuery {
                access_token: Some(access_token.to_string()),
                limit: Some(1),
                ..AuthQuery::default()
            })
            .map_err(SessionError::Internal)?;
        let Some(info) = rows.into_iter().next() else {
            return Err(SessionError::denied("invalid access token"));
        };
        if !info.is_active {
            return Err(SessionError::denied("access token has been revoked"));
        }

        let user = info.user_id.and_then(|id| self.user_manager.get_user_by_id(id));
        let device_id = device_id.filter(|d| !d.is_empty()).unwrap_or(&info.device_id);
        let app_version = app_version
            .filter(|v| !v.is_empty())
            .unwrap_or(&info.app_version);
        let device_name = if info.device_name.is_empty() {
            "Network Device"
        } else {
            &info.device_name
        };

        self.log_session_activity(
            &info.app_name,
            app_version,
            device_id,
            device_name,
            remote_end_point,
            user.as_ref(),
        )
        .await
    }

    /// Revokes the token and ends every session of its device.
    pub async fn logout(self: &Arc<Self>, access_token: &str) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        require_non_empty("access_token", access_token)?;

        let rows = self
            .auth_repo
            .get(&AuthQuery {
                access_token: Some(access_token.to_string()),
                limit: Some(1),
                ..AuthQuery::default()
            })
            .map_err(SessionError::Internal)?;
        let Some(mut info) = rows.into_iter().next() else {
            return Ok(());
        };

        info.is_active = false;
        info.date_revoked = Some(Utc::now());
        self.auth_repo
            .update(&info)
            .map_err(SessionError::Internal)?;
        info!("access token of device {} revoked", info.device_id);

        for session in self.registry.get_by_device_id(&info.device_id).await {
            if let Err(e) = self.report_session_ended(session.id()).await {
                error!("error ending session {} on logout: {}", session.id(), e);
            }
        }
        Ok(())
    }

    /// Logs out every active token of the user except the one in use.
    pub async fn revoke_user_tokens(
        self: &Arc<Self>,
        user_id: Uuid,
        current_access_token: Option<&str>,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let rows = self
            .auth_repo
            .get(&AuthQuery {
                user_id: Some(user_id),
                is_active: Some(true),
                ..AuthQuery::default()
            })
            .map_err(SessionError::Internal)?;
        for row in rows {
            if current_access_token.is_some_and(|current| current == row.access_token) {
                continue;
            }
            self.logout(&row.access_token).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Notification fan-out
    // ------------------------------------------------------------------

    /// Dispatches one call per active controller concurrently and joins
    /// them; individual failures are logged and never abort siblings.
    async fn fan_out<F, Fut>(&self, operation: &str, make_call: F)
    where
        F: Fn(Arc<dyn SessionController>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let sessions = self.registry.snapshot().await;
        let mut calls = Vec::new();
        for session in sessions {
            let Some(controller) = session.controller() else {
                continue;
            };
            if !controller.is_session_active() {
                continue;
            }
            let call = make_call(controller, self.shutdown_token.child_token());
            calls.push(async move {
                if let Err(e) = call.await {
                    error!(
                        "error sending {} notification to a session controller: {}",
                        operation, e
                    );
                }
            });
        }
        join_all(calls).await;
    }

    pub async fn send_server_restart_notification(&self) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        info!("notifying all sessions of server restart");
        self.fan_out("ServerRestarting", |controller, token| async move {
            controller.send_server_restart_notification(&token).await
        })
        .await;
        Ok(())
    }

    pub async fn send_server_shutdown_notification(&self) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        info!("notifying all sessions of server shutdown");
        self.fan_out("ServerShuttingDown", |controller, token| async move {
            controller.send_server_shutdown_notification(&token).await
        })
        .await;
        Ok(())
    }

    pub async fn send_restart_required_notification(&self) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        self.fan_out("RestartRequired", |controller, token| async move {
            controller.send_restart_required_notification(&token).await
        })
        .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Device option edits
    // ------------------------------------------------------------------

    fn spawn_device_options_listener(self: &Arc<Self>) {
        let mut receiver = self.device_manager.subscribe_options_updated();
        let weak = Arc::downgrade(self);
        let token = self.shutdown_token.clone();
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    update = receiver.recv() => match update {
                        Ok(update) => {
                            let Some(manager) = weak.upgrade() else { break };
                            manager.on_device_options_updated(update).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("device options listener lagged, skipped {} updates", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    async fn on_device_options_updated(&self, update: DeviceOptionsUpdated) {
        let Some(name) = update.custom_name.filter(|n| !n.is_empty()) else {
            return;
        };
        for session in self.registry.get_by_device_id(&update.device_id).await {
            session.set_device_name(name.clone());
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stops the timers, drains pending teardown work and disposes every
    /// session. Afterwards every entry point fails with `Disposed`.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("session manager shutting down");
        self.shutdown_token.cancel();
        self.disarm_idle_sweep();
        self.teardown.close();
        self.teardown.wait().await;
        for session in self.registry.drain().await {
            session.dispose();
        }
    }
}

fn require_non_empty(name: &str, value: &str) -> Result<(), SessionError> {
    if value.trim().is_empty() {
        Err(SessionError::invalid_argument(format!(
            "{} must not be empty",
            name
        )))
    } else {
        Ok(())
    }
}

/// The controlling session only has to exist for now; a richer policy can
/// slot in here later.
fn assert_can_control(_target: &Session, _controlling: &Session) -> Result<(), SessionError> {
    Ok(())
}

fn to_chrono(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

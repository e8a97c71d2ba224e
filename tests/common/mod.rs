//! Common test infrastructure for the end-to-end session tests.
//!
//! Builds a session manager wired to in-memory fakes of every collaborator
//! and exposes the pieces tests need to inspect.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use overtone_sessions::devices::{
    ClientCapabilities, DeviceInfo, DeviceManager, DeviceOptionsUpdated,
};
use overtone_sessions::library::{
    BaseItem, ItemKind, LibraryManager, MediaSourceInfo, MediaSourceManager, MusicManager,
};
use overtone_sessions::session::{
    Collaborators, ControllerFactory, RandomSource, Session, SessionController, SessionEvent,
    SessionManager,
};
use overtone_sessions::user::{
    AuthQuery, AuthenticationInfo, AuthenticationRepository, User, UserDataManager,
    UserDataSaveReason, UserDto, UserItemData, UserManager,
};
use overtone_sessions::SessionsConfig;

pub const WEB_CLIENT: &str = "Web";
pub const ANDROID_CLIENT: &str = "Android";
pub const DEVICE_A: &str = "devA";
pub const DEVICE_B: &str = "devB";
pub const TEST_PASSWORD: &str = "hunter2";

// -------------------------------------------------------------------
// Fake collaborators
// -------------------------------------------------------------------

#[derive(Default)]
pub struct FakeUserManager {
    pub users: Mutex<Vec<User>>,
    pub password: Mutex<Option<String>>,
}

impl FakeUserManager {
    pub fn add(&self, user: User) {
        self.users.lock().unwrap().push(user);
    }

    pub fn set_password(&self, password: &str) {
        *self.password.lock().unwrap() = Some(password.to_string());
    }
}

#[async_trait]
impl UserManager for FakeUserManager {
    fn users(&self) -> Vec<User> {
        self.users.lock().unwrap().clone()
    }

    fn get_user_by_id(&self, user_id: Uuid) -> Option<User> {
        self.users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
    }

    fn get_user_by_name(&self, name: &str) -> Option<User> {
        self.users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    async fn authenticate_user(
        &self,
        username: &str,
        password: Option<&str>,
        _password_sha1: Option<&str>,
        _password_md5: Option<&str>,
        _remote_end_point: &str,
        _is_user_session: bool,
    ) -> anyhow::Result<Option<User>> {
        let expected = self.password.lock().unwrap().clone();
        if expected.as_deref() == password {
            Ok(self.get_user_by_name(username))
        } else {
            Ok(None)
        }
    }

    fn update_user(&self, user: &User) -> anyhow::Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(existing) = users.iter_mut().find(|u| u.id == user.id) {
            *existing = user.clone();
        }
        Ok(())
    }

    fn get_user_dto(&self, user: &User, _remote_end_point: &str) -> UserDto {
        UserDto {
            id: user.id,
            name: user.name.clone(),
            last_activity_date: user.last_activity_date,
        }
    }
}

#[derive(Default)]
pub struct FakeUserData {
    pub store: Mutex<HashMap<(Uuid, String), UserItemData>>,
    pub saves: Mutex<Vec<(Uuid, String, UserDataSaveReason)>>,
}

impl FakeUserData {
    pub fn data_for(&self, user_id: Uuid, item_id: &str) -> UserItemData {
        self.store
            .lock()
            .unwrap()
            .get(&(user_id, item_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl UserDataManager for FakeUserData {
    fn get_user_data(&self, user_id: Uuid, item: &BaseItem) -> UserItemData {
        self.data_for(user_id, &item.id)
    }

    fn update_play_state(
        &self,
        item: &BaseItem,
        data: &mut UserItemData,
        position_ticks: Option<i64>,
    ) -> bool {
        match position_ticks {
            Some(ticks) => {
                let complete = item
                    .run_time_ticks
                    .is_some_and(|runtime| ticks >= runtime * 9 / 10);
                if complete {
                    data.played = item.supports_played_status;
                    data.playback_position_ticks = 0;
                    data.play_count += 1;
                } else {
                    data.playback_position_ticks = ticks;
                }
                complete
            }
            None => {
                data.playback_position_ticks = 0;
                true
            }
        }
    }

    async fn save_user_data(
        &self,
        user_id: Uuid,
        item: &BaseItem,
        data: &UserItemData,
        reason: UserDataSaveReason,
        _token: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.store
            .lock()
            .unwrap()
            .insert((user_id, item.id.clone()), data.clone());
        self.saves
            .lock()
            .unwrap()
            .push((user_id, item.id.clone(), reason));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLibrary {
    pub items: Mutex<HashMap<String, BaseItem>>,
    pub tagged: Mutex<HashMap<String, Vec<String>>>,
    pub children: Mutex<HashMap<String, Vec<String>>>,
    pub episodes: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeLibrary {
    pub fn insert(&self, item: BaseItem) {
        self.items.lock().unwrap().insert(item.id.clone(), item);
    }

    fn items_for(&self, ids: &[String]) -> Vec<BaseItem> {
        let items = self.items.lock().unwrap();
        ids.iter().filter_map(|id| items.get(id).cloned()).collect()
    }
}

impl LibraryManager for FakeLibrary {
    fn get_item(&self, item_id: &str) -> Option<BaseItem> {
        self.items.lock().unwrap().get(item_id).cloned()
    }

    fn get_tagged_items(&self, by_name_item: &BaseItem) -> Vec<BaseItem> {
        let ids = self
            .tagged
            .lock()
            .unwrap()
            .get(&by_name_item.id)
            .cloned()
            .unwrap_or_default();
        self.items_for(&ids)
    }

    fn get_recursive_children(&self, folder: &BaseItem) -> Vec<BaseItem> {
        let ids = self
            .children
            .lock()
            .unwrap()
            .get(&folder.id)
            .cloned()
            .unwrap_or_default();
        self.items_for(&ids)
    }

    fn get_series_episodes(&self, series_id: &str, _user_id: Uuid) -> Vec<BaseItem> {
        let ids = self
            .episodes
            .lock()
            .unwrap()
            .get(series_id)
            .cloned()
            .unwrap_or_default();
        self.items_for(&ids)
    }
}

#[derive(Default)]
pub struct FakeMusic {
    pub mixes: Mutex<HashMap<String, Vec<BaseItem>>>,
}

impl MusicManager for FakeMusic {
    fn instant_mix_from_item(&self, item: &BaseItem, _user: Option<&User>) -> Vec<BaseItem> {
        self.mixes
            .lock()
            .unwrap()
            .get(&item.id)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct FakeMediaSources {
    pub closed: Mutex<Vec<String>>,
}

#[async_trait]
impl MediaSourceManager for FakeMediaSources {
    async fn get_media_source(
        &self,
        item: &BaseItem,
        media_source_id: Option<&str>,
        _live_stream_id: Option<&str>,
    ) -> anyhow::Result<MediaSourceInfo> {
        Ok(MediaSourceInfo {
            id: media_source_id.unwrap_or(&item.id).to_string(),
            name: None,
            run_time_ticks: item.run_time_ticks,
        })
    }

    async fn close_live_stream(&self, live_stream_id: &str) -> anyhow::Result<()> {
        self.closed.lock().unwrap().push(live_stream_id.to_string());
        Ok(())
    }
}

pub struct FakeDeviceManager {
    pub custom_names: Mutex<HashMap<String, String>>,
    pub capabilities: Mutex<HashMap<String, ClientCapabilities>>,
    pub saved: Mutex<Vec<(String, ClientCapabilities)>>,
    pub denied_devices: Mutex<HashSet<String>>,
    pub options_tx: broadcast::Sender<DeviceOptionsUpdated>,
}

impl Default for FakeDeviceManager {
    fn default() -> Self {
        let (options_tx, _) = broadcast::channel(16);
        Self {
            custom_names: Mutex::new(HashMap::new()),
            capabilities: Mutex::new(HashMap::new()),
            saved: Mutex::new(Vec::new()),
            denied_devices: Mutex::new(HashSet::new()),
            options_tx,
        }
    }
}

impl DeviceManager for FakeDeviceManager {
    fn register_device(
        &self,
        _device_id: &str,
        _device_name: &str,
        _app_name: &str,
        _app_version: &str,
        _user_id: Option<Uuid>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_device(&self, device_id: &str) -> Option<DeviceInfo> {
        Some(DeviceInfo {
            id: device_id.to_string(),
            name: device_id.to_string(),
            custom_name: self.custom_names.lock().unwrap().get(device_id).cloned(),
        })
    }

    fn can_access_device(&self, _user: &User, device_id: &str) -> bool {
        !self.denied_devices.lock().unwrap().contains(device_id)
    }

    fn get_capabilities(&self, device_id: &str) -> Option<ClientCapabilities> {
        self.capabilities.lock().unwrap().get(device_id).cloned()
    }

    fn save_capabilities(
        &self,
        device_id: &str,
        capabilities: &ClientCapabilities,
    ) -> anyhow::Result<()> {
        self.saved
            .lock()
            .unwrap()
            .push((device_id.to_string(), capabilities.clone()));
        Ok(())
    }

    fn subscribe_options_updated(&self) -> broadcast::Receiver<DeviceOptionsUpdated> {
        self.options_tx.subscribe()
    }
}

#[derive(Default)]
pub struct FakeAuthRepo {
    pub rows: Mutex<Vec<AuthenticationInfo>>,
}

impl FakeAuthRepo {
    pub fn active_rows_for(&self, user_id: Uuid, device_id: &str) -> usize {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == Some(user_id) && r.device_id == device_id && r.is_active)
            .count()
    }
}

impl AuthenticationRepository for FakeAuthRepo {
    fn get(&self, query: &AuthQuery) -> anyhow::Result<Vec<AuthenticationInfo>> {
        let rows = self.rows.lock().unwrap();
        let mut matching: Vec<AuthenticationInfo> = rows
            .iter()
            .filter(|row| {
                query
                    .access_token
                    .as_ref()
                    .map_or(true, |t| *t == row.access_token)
                    && query.user_id.map_or(true, |u| Some(u) == row.user_id)
                    && query
                        .device_id
                        .as_ref()
                        .map_or(true, |d| d.eq_ignore_ascii_case(&row.device_id))
                    && query.is_active.map_or(true, |a| a == row.is_active)
            })
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    fn create(&self, info: &AuthenticationInfo) -> anyhow::Result<()> {
        self.rows.lock().unwrap().push(info.clone());
        Ok(())
    }

    fn update(&self, info: &AuthenticationInfo) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows
            .iter_mut()
            .find(|row| row.access_token == info.access_token)
        {
            *existing = info.clone();
        }
        Ok(())
    }
}

pub struct RecordingController {
    pub active: AtomicBool,
    pub messages: Mutex<Vec<(String, Value)>>,
}

impl RecordingController {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages_named(&self, name: &str) -> Vec<Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl SessionController for RecordingController {
    fn is_session_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn supports_media_control(&self) -> bool {
        true
    }

    async fn send_message(
        &self,
        name: &str,
        payload: Value,
        _token: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((name.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFactory {
    pub created: Mutex<Vec<(String, Arc<RecordingController>)>>,
}

impl RecordingFactory {
    pub fn controller_for(&self, session_id: &str) -> Arc<RecordingController> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .map(|(_, c)| c.clone())
            .expect("no controller created for session")
    }
}

impl ControllerFactory for RecordingFactory {
    fn get_session_controller(
        &self,
        session: &Arc<Session>,
    ) -> Option<Arc<dyn SessionController>> {
        let controller = Arc::new(RecordingController::new());
        self.created
            .lock()
            .unwrap()
            .push((session.id().to_string(), controller.clone()));
        Some(controller)
    }
}

/// Deterministic xorshift source so shuffles are reproducible.
pub struct SeededRandom {
    state: Mutex<u64>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(seed),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_u64(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *state = x;
        x
    }
}

// -------------------------------------------------------------------
// Harness
// -------------------------------------------------------------------

pub struct TestHarness {
    pub manager: Arc<SessionManager>,
    pub users: Arc<FakeUserManager>,
    pub user_data: Arc<FakeUserData>,
    pub library: Arc<FakeLibrary>,
    pub music: Arc<FakeMusic>,
    pub media_sources: Arc<FakeMediaSources>,
    pub devices: Arc<FakeDeviceManager>,
    pub auth: Arc<FakeAuthRepo>,
    pub factory: Arc<RecordingFactory>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Self::default_config())
    }

    pub fn default_config() -> SessionsConfig {
        SessionsConfig {
            server_id: "e2e-server".to_string(),
            ..SessionsConfig::default()
        }
    }

    /// Short timer intervals for tests that exercise the idle sweeper.
    pub fn fast_timers_config() -> SessionsConfig {
        SessionsConfig {
            server_id: "e2e-server".to_string(),
            idle_check_interval: Duration::from_millis(50),
            idle_playback_threshold: Duration::from_millis(150),
            auto_progress_interval: Duration::from_millis(40),
            ..SessionsConfig::default()
        }
    }

    pub fn with_config(config: SessionsConfig) -> Self {
        let users = Arc::new(FakeUserManager::default());
        let user_data = Arc::new(FakeUserData::default());
        let library = Arc::new(FakeLibrary::default());
        let music = Arc::new(FakeMusic::default());
        let media_sources = Arc::new(FakeMediaSources::default());
        let devices = Arc::new(FakeDeviceManager::default());
        let auth = Arc::new(FakeAuthRepo::default());
        let factory = Arc::new(RecordingFactory::default());

        let manager = SessionManager::new(
            config,
            Collaborators {
                user_manager: users.clone(),
                user_data: user_data.clone(),
                library: library.clone(),
                music: music.clone(),
                media_sources: media_sources.clone(),
                device_manager: devices.clone(),
                auth_repo: auth.clone(),
                controller_factories: vec![factory.clone()],
                random: Arc::new(SeededRandom::new(0x5eed)),
            },
        );

        Self {
            manager,
            users,
            user_data,
            library,
            music,
            media_sources,
            devices,
            auth,
            factory,
        }
    }

    pub fn add_user(&self, name: &str) -> User {
        let user = User::new(name);
        self.users.add(user.clone());
        self.users.set_password(TEST_PASSWORD);
        user
    }
}

// -------------------------------------------------------------------
// Fixtures & helpers
// -------------------------------------------------------------------

pub fn audio_item(id: &str) -> BaseItem {
    BaseItem {
        id: id.to_string(),
        name: id.to_string(),
        sort_name: id.to_lowercase(),
        media_type: Some("Audio".to_string()),
        run_time_ticks: Some(2_000_000_000),
        is_virtual: false,
        supports_played_status: true,
        has_media_sources: true,
        kind: ItemKind::Leaf,
    }
}

pub fn video_item(id: &str) -> BaseItem {
    BaseItem {
        media_type: Some("Video".to_string()),
        ..audio_item(id)
    }
}

pub fn episode_item(id: &str, series_id: &str, is_virtual: bool) -> BaseItem {
    BaseItem {
        is_virtual,
        kind: ItemKind::Episode {
            series_id: Some(series_id.to_string()),
        },
        ..video_item(id)
    }
}

pub async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

pub async fn wait_for_playback_stopped(rx: &mut broadcast::Receiver<SessionEvent>) -> bool {
    loop {
        if let SessionEvent::PlaybackStopped {
            played_to_completion,
            ..
        } = next_event(rx).await
        {
            return played_to_completion;
        }
    }
}

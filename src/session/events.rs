//! In-process publication of session and playback events.

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::devices::ClientCapabilities;
use crate::library::BaseItemDto;
use crate::user::AuthenticationResult;

use super::session::SessionInfoDto;

/// Common payload of the three playback events.
#[derive(Debug, Clone)]
pub struct PlaybackEventInfo {
    pub session: SessionInfoDto,
    pub item: Option<BaseItemDto>,
    pub media_source_id: Option<String>,
    pub position_ticks: Option<i64>,
    /// Primary user first, additional users after.
    pub user_ids: Vec<Uuid>,
}

/// Everything the session manager announces to in-process listeners.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    AuthenticationSucceeded(AuthenticationResult),
    AuthenticationFailed {
        username: Option<String>,
        app_name: String,
        device_id: String,
        remote_end_point: String,
    },
    SessionStarted(SessionInfoDto),
    SessionEnded(SessionInfoDto),
    SessionActivity(SessionInfoDto),
    CapabilitiesChanged {
        session: SessionInfoDto,
        capabilities: ClientCapabilities,
    },
    PlaybackStart(PlaybackEventInfo),
    PlaybackProgress {
        info: PlaybackEventInfo,
        is_automated: bool,
    },
    PlaybackStopped {
        info: PlaybackEventInfo,
        played_to_completion: bool,
    },
}

/// Broadcast bus for [`SessionEvent`]. Listeners consume on their own tasks,
/// so a slow handler can never block an emitter; it only lags its own
/// receiver.
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            trace!("session event dropped, no listeners subscribed");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

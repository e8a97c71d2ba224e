//! Transport adapter bound to a session, plus the factory chain that picks
//! one for a new session.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::commands::{GeneralCommand, PlayRequest, PlaystateRequest};
use super::session::{Session, SessionInfoDto};

/// A transport adapter that can push commands and notifications back to the
/// client behind a session.
///
/// `send_message` is the only method a transport has to implement; the typed
/// sends default to it.
#[async_trait]
pub trait SessionController: Send + Sync {
    /// Whether the underlying connection is still live.
    fn is_session_active(&self) -> bool;

    fn supports_media_control(&self) -> bool;

    /// Identifies the concrete binding (e.g. an HTTP callback URL) so a
    /// rebind to the same endpoint can be detected without downcasting.
    fn transport_descriptor(&self) -> Option<String> {
        None
    }

    /// Called on every activity report for the session.
    fn on_activity(&self) {}

    async fn send_message(&self, name: &str, payload: Value, token: &CancellationToken)
        -> Result<()>;

    async fn send_general_command(
        &self,
        command: &GeneralCommand,
        token: &CancellationToken,
    ) -> Result<()> {
        self.send_message("GeneralCommand", serde_json::to_value(command)?, token)
            .await
    }

    async fn send_play_command(
        &self,
        request: &PlayRequest,
        token: &CancellationToken,
    ) -> Result<()> {
        self.send_message("Play", serde_json::to_value(request)?, token)
            .await
    }

    async fn send_playstate_command(
        &self,
        request: &PlaystateRequest,
        token: &CancellationToken,
    ) -> Result<()> {
        self.send_message("Playstate", serde_json::to_value(request)?, token)
            .await
    }

    async fn send_playback_start_notification(
        &self,
        session: &SessionInfoDto,
        token: &CancellationToken,
    ) -> Result<()> {
        self.send_message("PlaybackStart", serde_json::to_value(session)?, token)
            .await
    }

    async fn send_playback_stopped_notification(
        &self,
        session: &SessionInfoDto,
        token: &CancellationToken,
    ) -> Result<()> {
        self.send_message("PlaybackStopped", serde_json::to_value(session)?, token)
            .await
    }

    async fn send_session_ended_notification(
        &self,
        session: &SessionInfoDto,
        token: &CancellationToken,
    ) -> Result<()> {
        self.send_message("SessionEnded", serde_json::to_value(session)?, token)
            .await
    }

    async fn send_server_restart_notification(&self, token: &CancellationToken) -> Result<()> {
        self.send_message("ServerRestarting", Value::Null, token).await
    }

    async fn send_server_shutdown_notification(&self, token: &CancellationToken) -> Result<()> {
        self.send_message("ServerShuttingDown", Value::Null, token)
            .await
    }

    async fn send_restart_required_notification(&self, token: &CancellationToken) -> Result<()> {
        self.send_message("RestartRequired", Value::Null, token).await
    }
}

/// One link of the controller factory chain. The session manager walks the
/// chain in order and binds the first controller offered.
pub trait ControllerFactory: Send + Sync {
    fn get_session_controller(&self, session: &Arc<Session>) -> Option<Arc<dyn SessionController>>;
}

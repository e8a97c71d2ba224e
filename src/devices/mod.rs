//! Device registry collaborator and client capability declarations.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::user::User;

/// A registered device, as the device registry reports it.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    /// Name the client reported on registration.
    pub name: String,
    /// Admin-assigned name overriding the reported one.
    pub custom_name: Option<String>,
}

/// The feature set a client declares for its session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default)]
    pub playable_media_types: Vec<String>,
    #[serde(default)]
    pub supported_commands: Vec<String>,
    #[serde(default)]
    pub supports_media_control: bool,
    #[serde(default)]
    pub supports_persistent_identifier: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    /// Callback URL for push-over-HTTP controllers. Transports use this as
    /// their binding descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_callback_url: Option<String>,
}

/// Emitted by the device registry when an admin edits device options.
#[derive(Debug, Clone)]
pub struct DeviceOptionsUpdated {
    pub device_id: String,
    pub custom_name: Option<String>,
}

/// The device registry, owned by another subsystem.
pub trait DeviceManager: Send + Sync {
    fn register_device(
        &self,
        device_id: &str,
        device_name: &str,
        app_name: &str,
        app_version: &str,
        user_id: Option<Uuid>,
    ) -> Result<()>;

    fn get_device(&self, device_id: &str) -> Option<DeviceInfo>;

    /// Whether the user's policy permits this device.
    fn can_access_device(&self, user: &User, device_id: &str) -> bool;

    fn get_capabilities(&self, device_id: &str) -> Option<ClientCapabilities>;

    fn save_capabilities(&self, device_id: &str, capabilities: &ClientCapabilities) -> Result<()>;

    /// Stream of device option edits. The session manager listens and
    /// renames matching sessions.
    fn subscribe_options_updated(&self) -> broadcast::Receiver<DeviceOptionsUpdated>;
}

//! Access token model and the token persistence collaborator.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionInfoDto;
use crate::user::UserDto;

/// One persisted access token row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationInfo {
    pub access_token: String,
    pub device_id: String,
    pub device_name: String,
    pub app_name: String,
    pub app_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub is_active: bool,
    pub date_created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_revoked: Option<DateTime<Utc>>,
}

/// Filter for token lookups. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuthQuery {
    pub access_token: Option<String>,
    pub user_id: Option<Uuid>,
    pub device_id: Option<String>,
    pub is_active: Option<bool>,
    pub limit: Option<usize>,
}

/// Token persistence, owned by another subsystem.
pub trait AuthenticationRepository: Send + Sync {
    /// Returns all rows matching the query, newest first.
    /// Returns Err if there is a database error.
    fn get(&self, query: &AuthQuery) -> Result<Vec<AuthenticationInfo>>;

    fn create(&self, info: &AuthenticationInfo) -> Result<()>;

    fn update(&self, info: &AuthenticationInfo) -> Result<()>;
}

/// Inbound authentication request, as received from a transport.
#[derive(Debug, Clone, Default)]
pub struct AuthenticationRequest {
    pub username: Option<String>,
    pub user_id: Option<Uuid>,
    pub password: Option<String>,
    pub password_sha1: Option<String>,
    pub password_md5: Option<String>,
    pub app_name: String,
    pub app_version: String,
    pub device_id: String,
    pub device_name: String,
    pub remote_end_point: String,
}

/// What a successful authentication hands back to the transport.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticationResult {
    pub user: UserDto,
    pub session_info: SessionInfoDto,
    pub access_token: String,
    pub server_id: String,
}

/// Mints a fresh opaque access token.
pub fn new_access_token() -> String {
    Uuid::new_v4().simple().to_string()
}

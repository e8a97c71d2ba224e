//! Playback state and the report payloads delivered by transports.

use serde::{Deserialize, Serialize};

use crate::library::BaseItemDto;

/// How the client obtains the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayMethod {
    DirectPlay,
    DirectStream,
    Transcode,
}

/// Repeat mode of the client player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatMode {
    #[default]
    RepeatNone,
    RepeatAll,
    RepeatOne,
}

/// Opaque transcoding snapshot, owned by the transcoding subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodingInfo(pub serde_json::Value);

/// The player-side state of a session, refreshed by playback reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayState {
    pub is_paused: bool,
    pub is_muted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_ticks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_source_id: Option<String>,
    pub can_seek: bool,
    /// 0..=100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_stream_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_method: Option<PlayMethod>,
    pub repeat_mode: RepeatMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_stream_id: Option<String>,
}

/// A playback start or progress report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaybackProgressInfo {
    pub session_id: String,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub media_source_id: Option<String>,
    #[serde(default)]
    pub position_ticks: Option<i64>,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub volume_level: Option<u8>,
    #[serde(default)]
    pub audio_stream_index: Option<i32>,
    #[serde(default)]
    pub subtitle_stream_index: Option<i32>,
    #[serde(default)]
    pub can_seek: bool,
    #[serde(default)]
    pub play_method: Option<PlayMethod>,
    #[serde(default)]
    pub repeat_mode: RepeatMode,
    #[serde(default)]
    pub live_stream_id: Option<String>,
    /// Item snapshot supplied by the reporter; resolved from the library
    /// when absent.
    #[serde(default)]
    pub item: Option<BaseItemDto>,
}

/// Start reports carry the same shape as progress reports.
pub type PlaybackStartInfo = PlaybackProgressInfo;

/// A playback stop report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaybackStopInfo {
    pub session_id: String,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub media_source_id: Option<String>,
    #[serde(default)]
    pub position_ticks: Option<i64>,
    #[serde(default)]
    pub live_stream_id: Option<String>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub item: Option<BaseItemDto>,
}

impl PlaybackProgressInfo {
    /// Copies the player-state fields of this report into `state`.
    pub(crate) fn apply_to(&self, state: &mut PlayState) {
        state.is_paused = self.is_paused;
        state.is_muted = self.is_muted;
        state.position_ticks = self.position_ticks;
        state.media_source_id = self.media_source_id.clone();
        state.can_seek = self.can_seek;
        state.volume_level = self.volume_level;
        state.audio_stream_index = self.audio_stream_index;
        state.subtitle_stream_index = self.subtitle_stream_index;
        state.play_method = self.play_method;
        state.repeat_mode = self.repeat_mode;
        state.live_stream_id = self.live_stream_id.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_to_copies_every_player_field() {
        let info = PlaybackProgressInfo {
            session_id: "s".to_string(),
            position_ticks: Some(1234),
            is_paused: true,
            is_muted: true,
            volume_level: Some(55),
            audio_stream_index: Some(1),
            subtitle_stream_index: Some(2),
            can_seek: true,
            play_method: Some(PlayMethod::Transcode),
            repeat_mode: RepeatMode::RepeatAll,
            media_source_id: Some("ms".to_string()),
            live_stream_id: Some("ls".to_string()),
            ..PlaybackProgressInfo::default()
        };

        let mut state = PlayState::default();
        info.apply_to(&mut state);

        assert!(state.is_paused);
        assert!(state.is_muted);
        assert_eq!(state.position_ticks, Some(1234));
        assert_eq!(state.volume_level, Some(55));
        assert_eq!(state.audio_stream_index, Some(1));
        assert_eq!(state.subtitle_stream_index, Some(2));
        assert!(state.can_seek);
        assert_eq!(state.play_method, Some(PlayMethod::Transcode));
        assert_eq!(state.repeat_mode, RepeatMode::RepeatAll);
        assert_eq!(state.media_source_id.as_deref(), Some("ms"));
        assert_eq!(state.live_stream_id.as_deref(), Some("ls"));
    }

    #[test]
    fn progress_report_deserializes_with_defaults() {
        let json = r#"{"session_id":"abc","position_ticks":5000}"#;
        let info: PlaybackProgressInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.session_id, "abc");
        assert_eq!(info.position_ticks, Some(5000));
        assert!(!info.is_paused);
        assert_eq!(info.repeat_mode, RepeatMode::RepeatNone);
        assert!(info.item.is_none());
    }
}

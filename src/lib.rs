//! Overtone Sessions
//!
//! The session coordination core of the Overtone media server. It tracks the
//! set of live client connections, drives the per-session playback state
//! machine, routes remote-control commands between sessions, owns the access
//! token lifecycle and fans session/playback events out to every connected
//! controller.
//!
//! Everything outside that core (user database, library lookups, media source
//! resolution, device registry, token persistence, transports) is consumed
//! through the collaborator traits in [`library`], [`user`] and [`devices`].

pub mod config;
pub mod devices;
pub mod library;
pub mod session;
pub mod user;

pub use config::SessionsConfig;
pub use session::{
    PlayCommand, PlayMethod, PlayRequest, PlayState, PlaybackProgressInfo, PlaybackStartInfo,
    PlaybackStopInfo, PlaystateCommand, PlaystateRequest, RepeatMode, Session, SessionController,
    SessionError, SessionEvent, SessionInfoDto, SessionManager,
};

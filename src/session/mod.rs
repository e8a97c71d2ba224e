pub mod commands;
pub mod controller;
mod error;
pub mod events;
mod manager;
pub mod playback;
mod registry;
mod session;

pub use commands::{
    command_names, BrowseRequest, GeneralCommand, MessageCommand, PlayCommand, PlayRequest,
    PlaystateCommand, PlaystateRequest, RandomSource, ThreadRngSource,
};
pub use controller::{ControllerFactory, SessionController};
pub use error::SessionError;
pub use events::{EventBus, PlaybackEventInfo, SessionEvent};
pub use manager::{Collaborators, SessionManager};
pub use playback::{
    PlayMethod, PlayState, PlaybackProgressInfo, PlaybackStartInfo, PlaybackStopInfo, RepeatMode,
    TranscodingInfo,
};
pub use registry::{session_id_for_key, session_key, SessionRegistry};
pub use session::{Session, SessionInfoDto, SessionUserInfo};

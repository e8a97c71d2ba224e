use std::time::Duration;

/// Tunables for the session manager.
///
/// The defaults mirror production behavior; tests shrink the intervals to
/// keep timer-driven paths fast.
#[derive(Debug, Clone)]
pub struct SessionsConfig {
    /// Opaque identifier of this server instance, stamped into
    /// authentication results.
    pub server_id: String,

    /// How often the idle sweeper wakes up while at least one session is
    /// playing.
    pub idle_check_interval: Duration,

    /// A playing session whose last real playback check-in is older than
    /// this is considered stalled and gets a synthesized stop.
    pub idle_playback_threshold: Duration,

    /// Interval of the per-session automatic progress timer.
    pub auto_progress_interval: Duration,

    /// Minimum gap between two activity reports of the same session before
    /// another `SessionActivity` event is emitted.
    pub activity_event_threshold: Duration,

    /// The user's own `last_activity_date` is only written through the user
    /// manager when it is older than this.
    pub user_activity_update_threshold: Duration,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            idle_check_interval: Duration::from_secs(300),
            idle_playback_threshold: Duration::from_secs(300),
            auto_progress_interval: Duration::from_secs(10),
            activity_event_threshold: Duration::from_secs(10),
            user_activity_update_threshold: Duration::from_secs(60),
        }
    }
}

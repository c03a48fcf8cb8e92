//! Playback state management

use std::time::Instant;

/// Player state machine
///
/// Transitions are validated so the presentation loop, the network handlers
/// and the shutdown path agree on what the player is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing opened yet
    Idle,

    /// Subscriber waiting for the authority to name the video and position
    Handshaking,

    /// Frames are being presented
    Playing {
        /// When playback (re)started
        started_at: Instant,
    },

    /// Clock frozen, the current frame stays on screen
    Paused {
        /// When playback was paused
        paused_at: Instant,
    },

    /// Decoder drained and the last frame was shown
    Ended,

    /// Exit requested; terminal
    Stopped,
}

impl PlaybackState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PlaybackState) -> bool {
        use PlaybackState::*;

        match (self, target) {
            (Idle, Handshaking) => true,
            (Idle, Playing { .. }) => true,

            (Handshaking, Playing { .. }) => true,

            (Playing { .. }, Paused { .. }) => true,
            (Playing { .. }, Ended) => true,

            (Paused { .. }, Playing { .. }) => true,

            // a seek after the end restarts presentation
            (Ended, Playing { .. }) => true,
            (Ended, Paused { .. }) => true,

            // From Stopped - no transitions allowed
            (Stopped, _) => false,

            // any live state can be stopped
            (_, Stopped) => true,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "Idle",
            PlaybackState::Handshaking => "Handshaking",
            PlaybackState::Playing { .. } => "Playing",
            PlaybackState::Paused { .. } => "Paused",
            PlaybackState::Ended => "Ended",
            PlaybackState::Stopped => "Stopped",
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, PlaybackState::Paused { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PlaybackState::Stopped)
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

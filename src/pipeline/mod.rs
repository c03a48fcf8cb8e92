//! Playback pipeline building blocks
//!
//! The pieces shared by the decode thread and the presentation loop:
//! - Time types and stream time-base conversion
//! - The fixed-capacity frame pool
//! - The playback clock (wall clock or audio master)
//! - The player state machine
//! - Health monitoring counters

pub mod clock;
pub mod frame_pool;
pub mod health;
pub mod state;
pub mod types;

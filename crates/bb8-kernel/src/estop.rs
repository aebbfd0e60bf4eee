//! [`EstopState`] – process-wide emergency-stop latch.
//!
//! The latch is owned by the [`CommandValidator`](crate::CommandValidator),
//! which is in turn owned by the single dispatcher actor, so it needs no
//! synchronisation.

use bb8_types::CommandName;
use tracing::warn;

/// Rejection reason for motion commands while the latch is set.
pub const MOTION_BLOCKED: &str = "motion blocked: estop active";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EstopState {
    active: bool,
}

impl EstopState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Set the latch.  Repeated engagement is harmless.
    pub fn engage(&mut self) {
        if !self.active {
            warn!("emergency stop engaged");
        }
        self.active = true;
    }

    /// Release the latch.  Fails when it was not set.
    pub fn clear(&mut self) -> Result<(), String> {
        if !self.active {
            return Err("clear_estop rejected: estop not active".to_string());
        }
        self.active = false;
        warn!("emergency stop cleared");
        Ok(())
    }

    /// `Err(MOTION_BLOCKED)` for motion commands while engaged; everything
    /// else always passes.
    pub fn gate(&self, command: CommandName) -> Result<(), &'static str> {
        if self.active && command.is_motion() {
            Err(MOTION_BLOCKED)
        } else {
            Ok(())
        }
    }
}

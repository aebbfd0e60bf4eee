//! `bb8-kernel` – command safety layer.
//!
//! Nothing reaches the robot without passing through this crate.  It owns no
//! I/O; the dispatcher in `bb8-runtime` feeds it raw field maps and acts on
//! the structured verdicts it returns.
//!
//! # Modules
//!
//! - [`schema`] – per-command field declarations and the numeric coercion
//!   rules (clamp, wrap, truncate) applied before schema checking.
//! - [`validator`] – [`CommandValidator`]: coerces, checks, and drives the
//!   emergency-stop latch for `estop` / `clear_estop`.
//! - [`estop`] – [`EstopState`]: the latch itself and the motion gate.

pub mod estop;
pub mod schema;
pub mod validator;

pub use estop::{EstopState, MOTION_BLOCKED};
pub use schema::{FieldKind, FieldSpec, Schema};
pub use validator::{CommandValidator, ValidationOutcome, correlation_id};

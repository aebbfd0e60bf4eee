//! [`CommandValidator`] – the structured verdict for every inbound command.
//!
//! `validate` never panics and never returns an error: every outcome,
//! including unknown commands, is a [`ValidationOutcome`] the dispatcher can
//! turn straight into an acknowledgment.
//!
//! # Example
//!
//! ```
//! use bb8_kernel::CommandValidator;
//! use serde_json::json;
//!
//! let mut validator = CommandValidator::new();
//! let raw = json!({"r": -5, "g": 300, "b": "12"});
//! let outcome = validator.validate("led", raw.as_object().unwrap());
//!
//! assert!(outcome.accepted);
//! assert_eq!(outcome.fields["r"], 0);
//! assert_eq!(outcome.fields["g"], 255);
//! assert_eq!(outcome.fields["b"], 12);
//! assert!(outcome.message.is_some());
//! ```

use bb8_types::{CommandName, FieldMap};
use tracing::debug;

use crate::estop::EstopState;
use crate::schema::Schema;

/// `(accepted, processed_fields, message)` for one command.
///
/// `message` is `None` for a clean accept, a coercion note for an accept that
/// changed values, or the rejection reason.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub command: Option<CommandName>,
    pub accepted: bool,
    pub fields: FieldMap,
    pub message: Option<String>,
}

impl ValidationOutcome {
    fn accept(command: CommandName, fields: FieldMap, notes: Vec<String>) -> Self {
        Self {
            command: Some(command),
            accepted: true,
            fields,
            message: (!notes.is_empty()).then(|| notes.join("; ")),
        }
    }

    fn reject(command: Option<CommandName>, fields: FieldMap, reason: String) -> Self {
        Self {
            command,
            accepted: false,
            fields,
            message: Some(reason),
        }
    }
}

/// Caller-supplied correlation id, when it is a string.  Used for the
/// acknowledgment even if the command itself is rejected.
pub fn correlation_id(raw: &FieldMap) -> Option<String> {
    raw.get("cid")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Default)]
pub struct CommandValidator {
    estop: EstopState,
}

impl CommandValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn estop(&self) -> &EstopState {
        &self.estop
    }

    /// Coerce, check, and apply estop transitions for `command`.
    pub fn validate(&mut self, command: &str, raw: &FieldMap) -> ValidationOutcome {
        let Ok(name) = command.parse::<CommandName>() else {
            debug!(command, "unsupported command");
            return ValidationOutcome::reject(
                None,
                raw.clone(),
                format!("unsupported command '{command}'"),
            );
        };

        let schema = Schema::for_command(name);
        let (fields, notes) = schema.coerce(raw);
        if let Err(reason) = schema.check(&fields) {
            debug!(%name, %reason, "command failed schema check");
            return ValidationOutcome::reject(Some(name), fields, reason);
        }

        match name {
            CommandName::Estop => self.estop.engage(),
            CommandName::ClearEstop => {
                if let Err(reason) = self.estop.clear() {
                    return ValidationOutcome::reject(Some(name), fields, reason);
                }
            }
            _ => {}
        }

        ValidationOutcome::accept(name, fields, notes)
    }
}

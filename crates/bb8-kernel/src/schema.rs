//! Per-command field declarations and pre-validation coercion.
//!
//! Validation runs in two passes over a [`Schema`]:
//!
//! 1. [`Schema::coerce`] rewrites declared numeric fields into canonical
//!    integers.  Headings wrap modulo 360, every other bounded integer clamps
//!    to its range, floats truncate toward zero, numeric strings are parsed.
//!    Each change produces a human-readable note.
//! 2. [`Schema::check`] enforces presence, type, range, and the absence of
//!    undeclared fields on the coerced map.
//!
//! LED channels are the lenient exception: a missing channel defaults to 0
//! and an uncoercible one becomes 0 with a note, so an `led` command never
//! fails on channel content alone.

use bb8_types::{CommandName, FieldMap};
use serde_json::Value;

pub const MAX_SPEED: i64 = 255;
pub const MAX_DURATION_MS: i64 = 5000;
pub const MAX_CID_LEN: usize = 32;
pub const MAX_PRESET_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Integer clamped into `[min, max]`.
    Int { min: i64, max: i64 },
    /// LED channel in `[0, 255]`; never rejects.
    Channel,
    /// Degrees, wrapped into `[0, 360)`.
    Heading,
    /// `[a-zA-Z0-9_-]{1,max_len}`.
    Token { max_len: usize },
    /// Any string of `1..=max_len` characters.
    Text { max_len: usize },
    /// One of a fixed set of strings.
    OneOf(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn required(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: true,
    }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
    }
}

const CID: FieldSpec = optional("cid", FieldKind::Token { max_len: MAX_CID_LEN });

const DRIVE: &[FieldSpec] = &[
    required("speed", FieldKind::Int { min: 0, max: MAX_SPEED }),
    required("heading", FieldKind::Heading),
    optional("ms", FieldKind::Int { min: 0, max: MAX_DURATION_MS }),
    CID,
];

const LED: &[FieldSpec] = &[
    optional("r", FieldKind::Channel),
    optional("g", FieldKind::Channel),
    optional("b", FieldKind::Channel),
    CID,
];

const POWER: &[FieldSpec] = &[required("action", FieldKind::OneOf(&["wake", "sleep"])), CID];

const PRESET: &[FieldSpec] = &[
    required("name", FieldKind::Text { max_len: MAX_PRESET_NAME_LEN }),
    CID,
];

const CID_ONLY: &[FieldSpec] = &[CID];

/// The declared fields of one command.  Undeclared fields are always rejected.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub command: CommandName,
    pub fields: &'static [FieldSpec],
}

impl Schema {
    pub fn for_command(command: CommandName) -> Self {
        let fields = match command {
            CommandName::Drive => DRIVE,
            CommandName::Led => LED,
            CommandName::Power => POWER,
            CommandName::Preset => PRESET,
            CommandName::Stop | CommandName::Sleep | CommandName::Estop | CommandName::ClearEstop => {
                CID_ONLY
            }
        };
        Self { command, fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Canonicalise declared numeric fields.  Returns the rewritten map and
    /// one note per value that had to change.  Fields that cannot be coerced
    /// are left untouched for [`check`](Self::check) to reject.
    pub fn coerce(&self, raw: &FieldMap) -> (FieldMap, Vec<String>) {
        let mut fields = raw.clone();
        let mut notes = Vec::new();

        for spec in self.fields {
            let name = spec.name;
            match spec.kind {
                FieldKind::Channel => {
                    let channel = match raw.get(name) {
                        None => 0,
                        Some(value) => match to_integer(value) {
                            Some(n) => {
                                let clamped = n.clamp(0, 255);
                                if clamped != n {
                                    notes.push(format!("{name} clamped from {n} to {clamped}"));
                                } else if !value.is_i64() && !value.is_string() {
                                    notes.push(format!("{name} truncated to {clamped}"));
                                }
                                clamped
                            }
                            None => {
                                notes.push(format!("{name} was not numeric; using 0"));
                                0
                            }
                        },
                    };
                    fields.insert(name.to_string(), Value::from(channel));
                }
                FieldKind::Int { min, max } => {
                    let Some(value) = raw.get(name) else { continue };
                    let Some(n) = to_integer(value) else { continue };
                    let clamped = n.clamp(min, max);
                    if clamped != n {
                        notes.push(format!("{name} clamped from {n} to {clamped}"));
                    } else if !value.is_i64() && !value.is_string() {
                        notes.push(format!("{name} truncated to {clamped}"));
                    }
                    fields.insert(name.to_string(), Value::from(clamped));
                }
                FieldKind::Heading => {
                    let Some(value) = raw.get(name) else { continue };
                    let Some(n) = to_integer(value) else { continue };
                    let wrapped = n.rem_euclid(360);
                    if wrapped != n {
                        notes.push(format!("{name} wrapped from {n} to {wrapped}"));
                    }
                    fields.insert(name.to_string(), Value::from(wrapped));
                }
                FieldKind::Token { .. } | FieldKind::Text { .. } | FieldKind::OneOf(_) => {}
            }
        }
        (fields, notes)
    }

    /// Enforce the declaration against an already-coerced map.
    pub fn check(&self, fields: &FieldMap) -> Result<(), String> {
        // Sorted so the reported field is stable regardless of map order.
        let mut undeclared: Vec<&str> = fields
            .keys()
            .map(String::as_str)
            .filter(|k| self.field(k).is_none())
            .collect();
        undeclared.sort_unstable();
        if let Some(extra) = undeclared.first() {
            return Err(format!("unexpected field '{extra}' for {}", self.command));
        }

        for spec in self.fields {
            match fields.get(spec.name) {
                None if spec.required => {
                    return Err(format!("missing required field '{}'", spec.name));
                }
                None => {}
                Some(value) => check_value(spec, value)?,
            }
        }
        Ok(())
    }
}

fn check_value(spec: &FieldSpec, value: &Value) -> Result<(), String> {
    let name = spec.name;
    match spec.kind {
        FieldKind::Int { min, max } => match value.as_i64() {
            Some(n) if (min..=max).contains(&n) => Ok(()),
            Some(n) => Err(format!("field '{name}' out of range [{min}, {max}]: {n}")),
            None => Err(format!("field '{name}' must be an integer")),
        },
        FieldKind::Channel => match value.as_i64() {
            Some(n) if (0..=255).contains(&n) => Ok(()),
            _ => Err(format!("field '{name}' must be an integer in [0, 255]")),
        },
        FieldKind::Heading => match value.as_i64() {
            Some(n) if (0..360).contains(&n) => Ok(()),
            _ => Err(format!("field '{name}' must be an integer heading")),
        },
        FieldKind::Token { max_len } => {
            let Some(s) = value.as_str() else {
                return Err(format!("field '{name}' must be a string"));
            };
            let len = s.chars().count();
            if len == 0 || len > max_len {
                return Err(format!("field '{name}' must be 1-{max_len} characters"));
            }
            if !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(format!("field '{name}' may only contain [a-zA-Z0-9_-]"));
            }
            Ok(())
        }
        FieldKind::Text { max_len } => {
            let Some(s) = value.as_str() else {
                return Err(format!("field '{name}' must be a string"));
            };
            let len = s.chars().count();
            if len == 0 || len > max_len {
                return Err(format!("field '{name}' must be 1-{max_len} characters"));
            }
            Ok(())
        }
        FieldKind::OneOf(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => Ok(()),
            _ => Err(format!(
                "field '{name}' must be one of: {}",
                allowed.join(", ")
            )),
        },
    }
}

/// Integer view of a JSON scalar: integers as-is, floats truncated toward
/// zero (saturating), numeric strings parsed.  `None` for anything else.
fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|_| i64::MAX))
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> FieldMap {
        match value {
            Value::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn integer_view_of_scalars() {
        assert_eq!(to_integer(&json!(7)), Some(7));
        assert_eq!(to_integer(&json!(-3.9)), Some(-3));
        assert_eq!(to_integer(&json!(" 12 ")), Some(12));
        assert_eq!(to_integer(&json!("4.5")), Some(4));
        assert_eq!(to_integer(&json!(u64::MAX)), Some(i64::MAX));
        assert_eq!(to_integer(&json!("twelve")), None);
        assert_eq!(to_integer(&json!(true)), None);
        assert_eq!(to_integer(&json!(null)), None);
        assert_eq!(to_integer(&json!([1])), None);
    }

    #[test]
    fn led_channels_always_become_bytes() {
        let schema = Schema::for_command(CommandName::Led);
        let (fields, notes) = schema.coerce(&map(json!({"r": -5, "g": 300, "b": "12"})));
        assert_eq!(fields["r"], json!(0));
        assert_eq!(fields["g"], json!(255));
        assert_eq!(fields["b"], json!(12));
        assert_eq!(notes.len(), 2);
        assert!(schema.check(&fields).is_ok());
    }

    #[test]
    fn led_missing_and_garbage_channels_default_to_zero() {
        let schema = Schema::for_command(CommandName::Led);
        let (fields, notes) = schema.coerce(&map(json!({"g": {"nested": 1}})));
        assert_eq!(fields["r"], json!(0));
        assert_eq!(fields["g"], json!(0));
        assert_eq!(fields["b"], json!(0));
        assert_eq!(notes, vec!["g was not numeric; using 0".to_string()]);
    }

    #[test]
    fn heading_wraps_with_non_negative_representative() {
        let schema = Schema::for_command(CommandName::Drive);
        for (input, expected) in [(400, 40), (-10, 350), (360, 0), (-720, 0), (359, 359)] {
            let (fields, _) = schema.coerce(&map(json!({"speed": 1, "heading": input})));
            assert_eq!(fields["heading"], json!(expected), "heading {input}");
        }
    }

    #[test]
    fn drive_values_clamp_and_wrap() {
        let schema = Schema::for_command(CommandName::Drive);
        let (fields, notes) =
            schema.coerce(&map(json!({"speed": 300, "heading": 400, "ms": 10000})));
        assert_eq!(fields["speed"], json!(255));
        assert_eq!(fields["heading"], json!(40));
        assert_eq!(fields["ms"], json!(5000));
        assert_eq!(notes.len(), 3);
        assert!(schema.check(&fields).is_ok());
    }

    #[test]
    fn in_range_integers_produce_no_notes() {
        let schema = Schema::for_command(CommandName::Drive);
        let (_, notes) = schema.coerce(&map(json!({"speed": 100, "heading": 90, "ms": 250})));
        assert!(notes.is_empty());
    }

    #[test]
    fn undeclared_fields_are_rejected() {
        let schema = Schema::for_command(CommandName::Stop);
        let err = schema.check(&map(json!({"speed": 1}))).unwrap_err();
        assert!(err.contains("unexpected field 'speed'"));
    }

    #[test]
    fn required_fields_are_enforced() {
        let schema = Schema::for_command(CommandName::Drive);
        let err = schema.check(&map(json!({"heading": 0}))).unwrap_err();
        assert_eq!(err, "missing required field 'speed'");
    }

    #[test]
    fn uncoercible_drive_speed_is_a_type_error() {
        let schema = Schema::for_command(CommandName::Drive);
        let (fields, _) = schema.coerce(&map(json!({"speed": "fast", "heading": 0})));
        let err = schema.check(&fields).unwrap_err();
        assert!(err.contains("'speed' must be an integer"));
    }

    #[test]
    fn cid_charset_and_length() {
        let schema = Schema::for_command(CommandName::Estop);
        assert!(schema.check(&map(json!({"cid": "abc_DEF-123"}))).is_ok());
        assert!(schema.check(&map(json!({"cid": ""}))).is_err());
        assert!(schema.check(&map(json!({"cid": "has space"}))).is_err());
        assert!(schema.check(&map(json!({"cid": "x".repeat(33)}))).is_err());
        assert!(schema.check(&map(json!({"cid": 42}))).is_err());
    }

    #[test]
    fn power_action_vocabulary() {
        let schema = Schema::for_command(CommandName::Power);
        assert!(schema.check(&map(json!({"action": "wake"}))).is_ok());
        assert!(schema.check(&map(json!({"action": "sleep"}))).is_ok());
        let err = schema.check(&map(json!({"action": "reboot"}))).unwrap_err();
        assert!(err.contains("wake, sleep"));
    }
}

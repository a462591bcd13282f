use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use thiserror::Error;

/// Action tags emitted by the daemon's `on_event_*` / `on_picture_save` hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    EventStart,
    EventEnd,
    MotionDetected,
    PictureSave,
    Unknown,
}

impl Action {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "event_start" => Self::EventStart,
            "event_end" => Self::EventEnd,
            "motion_detected" => Self::MotionDetected,
            "picture_save" => Self::PictureSave,
            _ => Self::Unknown,
        }
    }
}

/// One decoded line of daemon output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Event {
    EventStart {
        #[serde(rename = "eventid")]
        event_id: u64,
    },
    EventEnd {
        #[serde(rename = "eventid")]
        event_id: u64,
    },
    MotionDetected {
        #[serde(rename = "eventid")]
        event_id: u64,
    },
    PictureSave {
        #[serde(rename = "eventid")]
        event_id: u64,
        #[serde(rename = "img")]
        image: PathBuf,
    },
    /// Object without a usable `action`; decoded fine, ignored by the pipeline.
    Unknown { raw_action: Option<String> },
}

impl Event {
    pub fn action(&self) -> Action {
        match self {
            Event::EventStart { .. } => Action::EventStart,
            Event::EventEnd { .. } => Action::EventEnd,
            Event::MotionDetected { .. } => Action::MotionDetected,
            Event::PictureSave { .. } => Action::PictureSave,
            Event::Unknown { .. } => Action::Unknown,
        }
    }

    pub fn event_id(&self) -> Option<u64> {
        match self {
            Event::EventStart { event_id }
            | Event::EventEnd { event_id }
            | Event::MotionDetected { event_id }
            | Event::PictureSave { event_id, .. } => Some(*event_id),
            Event::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("`{action}` event is missing field `{field}`")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },
    #[error("invalid eventid: {0}")]
    InvalidEventId(String),
}

/// Decodes one line of daemon stdout.
///
/// Anything that is not a JSON object is a [`DecodeError`]. A well-formed
/// object with a missing or unrecognised `action` decodes to
/// [`Event::Unknown`].
pub fn decode_line(line: &str) -> Result<Event, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    let obj = match value {
        Value::Object(obj) => obj,
        other => return Err(DecodeError::NotAnObject(json_kind(&other))),
    };

    let raw_action = obj.get("action").and_then(Value::as_str);
    let action = raw_action.map(Action::from_tag).unwrap_or(Action::Unknown);

    let event = match action {
        Action::EventStart => Event::EventStart {
            event_id: require_event_id(&obj, "event_start")?,
        },
        Action::EventEnd => Event::EventEnd {
            event_id: require_event_id(&obj, "event_end")?,
        },
        Action::MotionDetected => Event::MotionDetected {
            event_id: require_event_id(&obj, "motion_detected")?,
        },
        Action::PictureSave => {
            let event_id = require_event_id(&obj, "picture_save")?;
            let image = obj
                .get("img")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(DecodeError::MissingField {
                    action: "picture_save",
                    field: "img",
                })?;
            Event::PictureSave {
                event_id,
                image: PathBuf::from(image),
            }
        }
        Action::Unknown => Event::Unknown {
            raw_action: raw_action.map(str::to_string),
        },
    };

    Ok(event)
}

fn require_event_id(obj: &Map<String, Value>, action: &'static str) -> Result<u64, DecodeError> {
    let value = obj.get("eventid").ok_or(DecodeError::MissingField {
        action,
        field: "eventid",
    })?;
    parse_event_id(value)
}

// The daemon substitutes `%v` into a string, but accept plain numbers too.
fn parse_event_id(value: &Value) -> Result<u64, DecodeError> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| DecodeError::InvalidEventId(s.clone())),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| DecodeError::InvalidEventId(n.to_string())),
        other => Err(DecodeError::InvalidEventId(other.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_picture_save_with_string_event_id() {
        let event =
            decode_line(r#"{"action":"picture_save","eventid":"12","img":"/var/lib/motion/a.jpg"}"#)
                .unwrap();
        assert_eq!(
            event,
            Event::PictureSave {
                event_id: 12,
                image: PathBuf::from("/var/lib/motion/a.jpg"),
            }
        );
        assert_eq!(event.action(), Action::PictureSave);
        assert_eq!(event.event_id(), Some(12));
    }

    #[test]
    fn decodes_numeric_event_id() {
        let event = decode_line(r#"{"action":"event_start","eventid":3}"#).unwrap();
        assert_eq!(event, Event::EventStart { event_id: 3 });
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let err = decode_line("{not json").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }

    #[test]
    fn non_object_is_a_decode_error() {
        assert_eq!(
            decode_line("[1,2]").unwrap_err(),
            DecodeError::NotAnObject("array")
        );
        assert_eq!(decode_line("   ").unwrap_err(), DecodeError::Empty);
    }

    #[test]
    fn missing_or_unknown_action_is_unknown_event() {
        assert_eq!(
            decode_line(r#"{"eventid":"1"}"#).unwrap(),
            Event::Unknown { raw_action: None }
        );
        let event = decode_line(r#"{"action":"camera_lost","eventid":"1"}"#).unwrap();
        assert_eq!(
            event,
            Event::Unknown {
                raw_action: Some("camera_lost".to_string())
            }
        );
        assert_eq!(event.event_id(), None);
    }

    #[test]
    fn picture_save_requires_image() {
        assert_eq!(
            decode_line(r#"{"action":"picture_save","eventid":"1"}"#).unwrap_err(),
            DecodeError::MissingField {
                action: "picture_save",
                field: "img"
            }
        );
    }

    #[test]
    fn rejects_bad_event_id() {
        assert_eq!(
            decode_line(r#"{"action":"event_end","eventid":"x1"}"#).unwrap_err(),
            DecodeError::InvalidEventId("x1".to_string())
        );
        assert!(matches!(
            decode_line(r#"{"action":"event_end","eventid":-4}"#).unwrap_err(),
            DecodeError::InvalidEventId(_)
        ));
    }

    #[test]
    fn serializes_back_to_daemon_field_names() {
        let event = Event::PictureSave {
            event_id: 4,
            image: PathBuf::from("b.jpg"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "picture_save", "eventid": 4, "img": "b.jpg"})
        );
    }
}

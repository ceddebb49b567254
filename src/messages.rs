// Message types between the operator and the bridge

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_SMOOTHING;

/// Per-wheel velocity, `None` meaning "no command, motor off"
pub type WheelVelocities = [Option<f64>; 2];

/// Command from operator -> bridge
///
/// Both fields are optional; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vs: Option<Vec<Option<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wheel targets carried by this message, if it has exactly two slots
    pub fn wheel_velocities(&self) -> Option<WheelVelocities> {
        match self.vs.as_deref() {
            Some(&[a, b]) => Some([finite(a), finite(b)]),
            _ => None,
        }
    }

    /// Smoothing coefficient carried by this message, if finite
    pub fn smoothing(&self) -> Option<f64> {
        self.smoothing.filter(|s| s.is_finite())
    }
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|v| v.is_finite())
}

/// What the active session wants the wheels to do
///
/// Written by the session controller, read as one snapshot per tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlTarget {
    pub velocities: WheelVelocities,
    pub smoothing: f64,
}

impl Default for ControlTarget {
    fn default() -> Self {
        Self {
            velocities: [None, None],
            smoothing: DEFAULT_SMOOTHING,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_message() {
        let msg = ControlMessage::parse(r#"{"vs":[1.0,-1.0],"smoothing":0.1}"#).unwrap();
        assert_eq!(msg.wheel_velocities(), Some([Some(1.0), Some(-1.0)]));
        assert_eq!(msg.smoothing(), Some(0.1));
    }

    #[test]
    fn test_null_slots_are_absent() {
        let msg = ControlMessage::parse(r#"{"vs":[null,0.3]}"#).unwrap();
        assert_eq!(msg.wheel_velocities(), Some([None, Some(0.3)]));
        assert_eq!(msg.smoothing(), None);
    }

    #[test]
    fn test_wrong_length_is_ignored() {
        for text in [r#"{"vs":[1.0]}"#, r#"{"vs":[1.0,2.0,3.0]}"#, r#"{"vs":[]}"#] {
            let msg = ControlMessage::parse(text).unwrap();
            assert_eq!(msg.wheel_velocities(), None, "{}", text);
        }
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let msg = ControlMessage::parse(r#"{"mode":"tank","smoothing":0.5}"#).unwrap();
        assert_eq!(msg.vs, None);
        assert_eq!(msg.smoothing(), Some(0.5));
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        for text in [
            "not json",
            r#"{"vs":"fast"}"#,
            r#"{"vs":[1.0,"x"]}"#,
            r#"{"smoothing":"0.2"}"#,
            "[1,2]",
        ] {
            assert!(ControlMessage::parse(text).is_err(), "{}", text);
        }
    }

    #[test]
    fn test_serialize_skips_missing_fields() {
        let msg = ControlMessage {
            vs: Some(vec![None, None]),
            smoothing: None,
        };
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"vs":[null,null]}"#);
    }
}

//! `roamer-types` – shared vocabulary for the Roamer workspace.
//!
//! Holds the plain data exchanged between the HAL, the kernel and the
//! runtime: control-stream messages, sensor events, typed command values and
//! the error taxonomy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod command;
pub mod error;

pub use command::{ParamType, ParamValue, ParsedCommand};
pub use error::{ConfigError, DispatchError, ParseError, RoamerError};

/// Identifier of one autonomous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control lease
// ─────────────────────────────────────────────────────────────────────────────

/// Priority carried by a control request. Higher values outrank lower ones
/// on the robot side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlPriority {
    /// Take over from the robot's idle behaviors.
    #[default]
    OverrideBehaviors,
    Default,
    /// Keep control even when the robot would normally reclaim it.
    ReserveControl,
}

impl ControlPriority {
    /// Wire value used by the robot's control protocol.
    pub fn wire_value(&self) -> i32 {
        match self {
            ControlPriority::OverrideBehaviors => 10,
            ControlPriority::Default => 20,
            ControlPriority::ReserveControl => 30,
        }
    }
}

/// Lifecycle of a control lease.
///
/// `Idle → Requesting → Granted → Releasing → Released`, with `Lost` when the
/// robot revokes control and `Failed` when the stream breaks before a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    Idle,
    Requesting,
    Granted,
    Releasing,
    Released,
    Lost,
    Failed,
}

impl LeaseState {
    /// `true` once the lease can no longer become granted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeaseState::Released | LeaseState::Lost | LeaseState::Failed)
    }
}

/// Client → robot message on the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Request { priority: ControlPriority },
    Release,
}

/// Robot → client message on the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    Granted,
    Lost,
    /// Keep-alives and other traffic the arbitrator ignores.
    Other(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sensor feed
// ─────────────────────────────────────────────────────────────────────────────

/// Named filter for the robot's event feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFilter {
    /// Periodic robot state, which carries the raw touch intensity.
    RobotState,
    WakeWord,
}

impl EventFilter {
    pub fn name(&self) -> &'static str {
        match self {
            EventFilter::RobotState => "robot_state",
            EventFilter::WakeWord => "wake_word",
        }
    }
}

/// One event from the robot's sensor feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SensorEventKind,
}

impl SensorEvent {
    pub fn now(kind: SensorEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn touch(raw_value: u32) -> Self {
        Self::now(SensorEventKind::Touch { raw_value })
    }

    pub fn wake_word() -> Self {
        Self::now(SensorEventKind::WakeWord)
    }

    /// The filter under which this event is delivered.
    pub fn filter(&self) -> Option<EventFilter> {
        match self.kind {
            SensorEventKind::Touch { .. } | SensorEventKind::RobotState => {
                Some(EventFilter::RobotState)
            }
            SensorEventKind::WakeWord => Some(EventFilter::WakeWord),
            SensorEventKind::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorEventKind {
    /// Robot state carrying a raw capacitive touch reading.
    Touch { raw_value: u32 },
    /// Robot state without touch data.
    RobotState,
    WakeWord,
    Other(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Actuator requests
// ─────────────────────────────────────────────────────────────────────────────

/// Rotation direction for an in-place turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnDirection {
    Clockwise,
    CounterClockwise,
}

impl TryFrom<i32> for TurnDirection {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TurnDirection::Clockwise),
            1 => Ok(TurnDirection::CounterClockwise),
            other => Err(format!("direction must be 0 or 1, got {other}")),
        }
    }
}

/// Drive both wheels for a fixed duration. Speeds are in mm/s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveWheels {
    pub left_mmps: f32,
    pub right_mmps: f32,
    pub duration_ms: u32,
}

/// Turn in place, relative to the current heading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnInPlace {
    pub angle_rad: f32,
    pub speed_rad_per_sec: f32,
    pub accel_rad_per_sec_sq: f32,
    pub direction: TurnDirection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_terminal_states() {
        assert!(LeaseState::Released.is_terminal());
        assert!(LeaseState::Lost.is_terminal());
        assert!(LeaseState::Failed.is_terminal());
        assert!(!LeaseState::Granted.is_terminal());
        assert!(!LeaseState::Requesting.is_terminal());
    }

    #[test]
    fn priority_wire_values_are_ordered() {
        assert!(
            ControlPriority::OverrideBehaviors.wire_value() < ControlPriority::Default.wire_value()
        );
        assert!(
            ControlPriority::Default.wire_value() < ControlPriority::ReserveControl.wire_value()
        );
    }

    #[test]
    fn sensor_events_map_to_filters() {
        assert_eq!(SensorEvent::touch(10).filter(), Some(EventFilter::RobotState));
        assert_eq!(SensorEvent::wake_word().filter(), Some(EventFilter::WakeWord));
        assert_eq!(
            SensorEvent::now(SensorEventKind::Other("cube".into())).filter(),
            None
        );
        assert_eq!(EventFilter::RobotState.name(), "robot_state");
        assert_eq!(EventFilter::WakeWord.name(), "wake_word");
    }

    #[test]
    fn turn_direction_from_wire() {
        assert_eq!(TurnDirection::try_from(0), Ok(TurnDirection::Clockwise));
        assert_eq!(TurnDirection::try_from(1), Ok(TurnDirection::CounterClockwise));
        assert!(TurnDirection::try_from(2).is_err());
    }

    #[test]
    fn sensor_event_roundtrip() {
        let event = SensorEvent::touch(4200);
        let json = serde_json::to_string(&event).unwrap();
        let back: SensorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}

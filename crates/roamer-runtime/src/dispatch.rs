//! Command dispatch – from a [`ParsedCommand`] to one bounded actuator call.
//!
//! Every registry entry with a bound [`CommandAction`] goes through the same
//! gate in [`Dispatcher::dispatch`]:
//!
//! 1. the session's control lease must be `Granted`;
//! 2. every declared parameter must be present with its declared type;
//! 3. the action's own [`CommandAction::validate`] must pass;
//! 4. the action runs under a fixed timeout inside a per-command child of the
//!    session scope, so one stuck actuator call cannot hang the loop.
//!
//! Extra commands plug in by implementing [`CommandAction`] and registering a
//! [`CommandSpec`][crate::command::CommandSpec] at startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roamer_hal::RobotLink;
use roamer_kernel::ControlLease;
use roamer_types::{
    DispatchError, DriveWheels, ParamType, ParamValue, ParsedCommand, RoamerError, TurnDirection,
    TurnInPlace,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandRegistry;

/// Per-command execution timeout.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(20);

/// Max head / lift speed used for position moves.
pub const MOTION_MAX_SPEED_RAD_PER_SEC: f32 = 2.0;

/// Angular acceleration used for in-place turns.
pub const TURN_ACCEL_RAD_PER_SEC_SQ: f32 = 10.0;

// ─────────────────────────────────────────────────────────────────────────────
// CommandAction
// ─────────────────────────────────────────────────────────────────────────────

/// A capability that can be bound to a command name.
///
/// `validate` runs before any actuator traffic and should reject values that
/// are well-typed but meaningless (negative durations, unknown directions).
/// Presence and type of declared parameters are already checked by the
/// dispatcher.
#[async_trait]
pub trait CommandAction: Send + Sync {
    fn validate(&self, _command: &ParsedCommand) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn execute(
        &self,
        robot: &dyn RobotLink,
        command: &ParsedCommand,
    ) -> Result<(), RoamerError>;
}

// ── Parameter accessors ──────────────────────────────────────────────────────

fn param<'a>(command: &'a ParsedCommand, name: &str) -> Result<&'a ParamValue, DispatchError> {
    command.get(name).ok_or_else(|| DispatchError::MissingParam {
        command: command.name.clone(),
        param: name.to_string(),
    })
}

fn wrong_type(
    command: &ParsedCommand,
    name: &str,
    expected: ParamType,
    actual: &ParamValue,
) -> DispatchError {
    DispatchError::WrongParamType {
        command: command.name.clone(),
        param: name.to_string(),
        expected,
        actual: actual.param_type(),
    }
}

fn invalid(command: &ParsedCommand, name: &str, reason: impl Into<String>) -> DispatchError {
    DispatchError::InvalidParam {
        command: command.name.clone(),
        param: name.to_string(),
        reason: reason.into(),
    }
}

pub fn float_param(command: &ParsedCommand, name: &str) -> Result<f32, DispatchError> {
    match param(command, name)? {
        ParamValue::Float(v) if v.is_finite() => Ok(*v),
        ParamValue::Float(_) => Err(invalid(command, name, "must be a finite number")),
        other => Err(wrong_type(command, name, ParamType::Float, other)),
    }
}

pub fn int_param(command: &ParsedCommand, name: &str) -> Result<i32, DispatchError> {
    match param(command, name)? {
        ParamValue::Int(v) => Ok(*v),
        other => Err(wrong_type(command, name, ParamType::Int, other)),
    }
}

pub fn string_param<'a>(command: &'a ParsedCommand, name: &str) -> Result<&'a str, DispatchError> {
    match param(command, name)? {
        ParamValue::String(v) => Ok(v),
        other => Err(wrong_type(command, name, ParamType::String, other)),
    }
}

pub fn bool_param(command: &ParsedCommand, name: &str) -> Result<bool, DispatchError> {
    match param(command, name)? {
        ParamValue::Bool(v) => Ok(*v),
        other => Err(wrong_type(command, name, ParamType::Bool, other)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in actions
// ─────────────────────────────────────────────────────────────────────────────

pub struct DriveWheelsAction;

impl DriveWheelsAction {
    fn request(command: &ParsedCommand) -> Result<DriveWheels, DispatchError> {
        let duration = int_param(command, "durationMs")?;
        let duration_ms = u32::try_from(duration)
            .map_err(|_| invalid(command, "durationMs", "must not be negative"))?;
        Ok(DriveWheels {
            left_mmps: float_param(command, "leftWheelSpeed")?,
            right_mmps: float_param(command, "rightWheelSpeed")?,
            duration_ms,
        })
    }
}

#[async_trait]
impl CommandAction for DriveWheelsAction {
    fn validate(&self, command: &ParsedCommand) -> Result<(), DispatchError> {
        Self::request(command).map(|_| ())
    }

    async fn execute(
        &self,
        robot: &dyn RobotLink,
        command: &ParsedCommand,
    ) -> Result<(), RoamerError> {
        robot.drive_wheels(Self::request(command)?).await
    }
}

pub struct TurnInPlaceAction;

impl TurnInPlaceAction {
    fn request(command: &ParsedCommand) -> Result<TurnInPlace, DispatchError> {
        let direction = TurnDirection::try_from(int_param(command, "direction")?)
            .map_err(|reason| invalid(command, "direction", reason))?;
        Ok(TurnInPlace {
            angle_rad: float_param(command, "angleRad")?,
            speed_rad_per_sec: float_param(command, "speedRadPerSec")?,
            accel_rad_per_sec_sq: TURN_ACCEL_RAD_PER_SEC_SQ,
            direction,
        })
    }
}

#[async_trait]
impl CommandAction for TurnInPlaceAction {
    fn validate(&self, command: &ParsedCommand) -> Result<(), DispatchError> {
        Self::request(command).map(|_| ())
    }

    async fn execute(
        &self,
        robot: &dyn RobotLink,
        command: &ParsedCommand,
    ) -> Result<(), RoamerError> {
        robot.turn_in_place(Self::request(command)?).await
    }
}

pub struct SayTextAction;

#[async_trait]
impl CommandAction for SayTextAction {
    fn validate(&self, command: &ParsedCommand) -> Result<(), DispatchError> {
        if string_param(command, "textToSay")?.trim().is_empty() {
            return Err(invalid(command, "textToSay", "must not be empty"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        robot: &dyn RobotLink,
        command: &ParsedCommand,
    ) -> Result<(), RoamerError> {
        robot.say_text(string_param(command, "textToSay")?).await
    }
}

pub struct MoveHeadAction;

#[async_trait]
impl CommandAction for MoveHeadAction {
    fn validate(&self, command: &ParsedCommand) -> Result<(), DispatchError> {
        float_param(command, "angleRad").map(|_| ())
    }

    async fn execute(
        &self,
        robot: &dyn RobotLink,
        command: &ParsedCommand,
    ) -> Result<(), RoamerError> {
        let angle = float_param(command, "angleRad")?;
        robot.move_head(angle, MOTION_MAX_SPEED_RAD_PER_SEC).await
    }
}

pub struct MoveLiftAction;

#[async_trait]
impl CommandAction for MoveLiftAction {
    fn validate(&self, command: &ParsedCommand) -> Result<(), DispatchError> {
        float_param(command, "heightMm").map(|_| ())
    }

    async fn execute(
        &self,
        robot: &dyn RobotLink,
        command: &ParsedCommand,
    ) -> Result<(), RoamerError> {
        let height = float_param(command, "heightMm")?;
        robot.move_lift(height, MOTION_MAX_SPEED_RAD_PER_SEC).await
    }
}

pub struct PlayAnimationAction;

#[async_trait]
impl CommandAction for PlayAnimationAction {
    fn validate(&self, command: &ParsedCommand) -> Result<(), DispatchError> {
        if string_param(command, "animationName")?.trim().is_empty() {
            return Err(invalid(command, "animationName", "must not be empty"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        robot: &dyn RobotLink,
        command: &ParsedCommand,
    ) -> Result<(), RoamerError> {
        robot.play_animation(string_param(command, "animationName")?, 1).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Routes parsed commands to their bound actions.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    action_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self {
            registry,
            action_timeout: ACTION_TIMEOUT,
        }
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Validate and execute `command` while `lease` is granted.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`]; none of them is fatal to the session.
    pub async fn dispatch(
        &self,
        robot: &dyn RobotLink,
        lease: &ControlLease,
        command: &ParsedCommand,
        scope: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let name = command.name.clone();
        if !lease.is_granted() {
            return Err(DispatchError::LeaseNotGranted(name));
        }
        let spec = self
            .registry
            .get(&name)
            .ok_or_else(|| DispatchError::NotDispatchable(name.clone()))?;
        let action = spec
            .action()
            .ok_or_else(|| DispatchError::NotDispatchable(name.clone()))?;

        for declared in &spec.params {
            let value = param(command, &declared.name)?;
            if value.param_type() != declared.ty {
                return Err(wrong_type(command, &declared.name, declared.ty, value));
            }
        }
        action.validate(command)?;

        debug!(command = %name, timeout = ?self.action_timeout, "dispatching");
        let command_scope = scope.child_token();
        let outcome = tokio::select! {
            biased;
            _ = command_scope.cancelled() => Err(DispatchError::Cancelled(name.clone())),
            result = tokio::time::timeout(self.action_timeout, action.execute(robot, command)) => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(RoamerError::Dispatch(e))) => Err(e),
                    Ok(Err(e)) => Err(DispatchError::Actuator {
                        command: name.clone(),
                        details: e.to_string(),
                    }),
                    Err(_) => Err(DispatchError::Timeout {
                        command: name.clone(),
                        timeout_ms: u64::try_from(self.action_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    }),
                }
            }
        };
        command_scope.cancel();

        match &outcome {
            Ok(()) => info!(command = %name, "command executed"),
            Err(e) => warn!(command = %name, error = %e, "command failed"),
        }
        outcome
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

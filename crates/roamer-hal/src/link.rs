//! [`RobotLink`] – the narrow transport interface to a physical robot.
//!
//! The perception-action loop never talks to a wire protocol directly. It
//! holds an `Arc<dyn RobotLink>` and uses three kinds of calls:
//!
//! * a persistent, bidirectional [`ControlStream`] for the control lease;
//! * a filtered [`EventStream`] for touch and wake-word events;
//! * unary actuator and camera calls.
//!
//! Real transports (gRPC, serial, ...) and the in-process
//! [`SimRobot`][crate::sim::SimRobot] implement the same traits, so the
//! kernel and runtime are exercised identically in tests and on hardware.

use async_trait::async_trait;
use roamer_types::{
    ControlMessage, ControlResponse, DriveWheels, EventFilter, RoamerError, SensorEvent,
    TurnInPlace,
};

use crate::camera::CameraFrame;

/// Client side of the control request/grant/release stream.
#[async_trait]
pub trait ControlStream: Send {
    /// Send one message to the robot.
    async fn send(&mut self, message: ControlMessage) -> Result<(), RoamerError>;

    /// Wait for the next response. `Ok(None)` means the robot closed the
    /// stream.
    async fn recv(&mut self) -> Result<Option<ControlResponse>, RoamerError>;

    /// Half-close the stream. Further sends fail.
    async fn close(&mut self);
}

/// A subscription to the robot's sensor event feed.
#[async_trait]
pub trait EventStream: Send {
    /// Wait for the next event. `Ok(None)` means the feed ended.
    async fn recv(&mut self) -> Result<Option<SensorEvent>, RoamerError>;

    /// Tell the robot to stop sending events on this subscription.
    async fn close(&mut self);
}

/// Everything the loop needs from a robot.
#[async_trait]
pub trait RobotLink: Send + Sync {
    /// Stable identifier, e.g. the robot's serial number.
    fn id(&self) -> &str;

    async fn open_control_stream(&self) -> Result<Box<dyn ControlStream>, RoamerError>;

    /// Subscribe to events matching any of `filters`.
    async fn event_stream(
        &self,
        filters: &[EventFilter],
    ) -> Result<Box<dyn EventStream>, RoamerError>;

    async fn set_mirror_mode(&self, enable: bool) -> Result<(), RoamerError>;

    async fn capture_image(&self, high_resolution: bool) -> Result<CameraFrame, RoamerError>;

    async fn drive_wheels(&self, request: DriveWheels) -> Result<(), RoamerError>;

    async fn turn_in_place(&self, request: TurnInPlace) -> Result<(), RoamerError>;

    async fn move_head(&self, angle_rad: f32, max_speed_rad_per_sec: f32)
    -> Result<(), RoamerError>;

    async fn move_lift(&self, height_mm: f32, max_speed_rad_per_sec: f32)
    -> Result<(), RoamerError>;

    async fn say_text(&self, text: &str) -> Result<(), RoamerError>;

    async fn play_animation(&self, name: &str, loops: u32) -> Result<(), RoamerError>;
}

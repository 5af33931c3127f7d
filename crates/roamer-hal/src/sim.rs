//! In-process simulated robot for CI and headless runs.
//!
//! [`SimRobot`] implements [`RobotLink`] without any hardware. It records
//! every actuator call, counts control requests and releases, and honours the
//! one-grant-at-a-time rule of a real robot through a single-permit
//! [`Semaphore`]. Behaviour can be scripted per test:
//!
//! | Knob | Effect |
//! |---|---|
//! | [`GrantPolicy`] | Grant immediately, after a delay, never, refuse, or grant and revoke later |
//! | [`SimRobot::fail_next_captures`] | The next *n* image captures fail |
//! | [`SimRobot::stall_captures`] | Image captures never complete |
//! | [`SimRobot::with_actuator_delay`] | Every actuator call sleeps first |
//! | [`SimRobot::push_event`] | Inject touch / wake-word events into the feed |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use roamer_hal::sim::{GrantPolicy, SimRobot};
//!
//! let robot = Arc::new(SimRobot::new("sim-01").with_grant_policy(GrantPolicy::Immediate));
//! assert_eq!(robot.calls().len(), 0);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use roamer_types::{
    ControlMessage, ControlResponse, DriveWheels, EventFilter, RoamerError, SensorEvent,
    TurnInPlace,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::camera::CameraFrame;
use crate::link::{ControlStream, EventStream, RobotLink};

/// A minimal JPEG (SOI + EOI markers) returned by every simulated capture.
const SIM_FRAME: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

const EVENT_FEED_CAPACITY: usize = 64;

/// How the simulated robot answers control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantPolicy {
    Immediate,
    After(Duration),
    /// Accept the request but never answer it.
    Never,
    /// Answer every request with a loss notification.
    Refuse,
    /// Grant, then revoke control after the given delay.
    LoseAfter(Duration),
}

/// One recorded actuator call.
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorCall {
    DriveWheels(DriveWheels),
    TurnInPlace(TurnInPlace),
    MoveHead { angle_rad: f32 },
    MoveLift { height_mm: f32 },
    SayText(String),
    PlayAnimation { name: String, loops: u32 },
}

#[derive(Default)]
struct Counters {
    control_requests: AtomicUsize,
    releases: AtomicUsize,
    captures: AtomicUsize,
    capture_failures_pending: AtomicUsize,
    event_streams_closed: AtomicUsize,
    ungranted_calls: AtomicUsize,
    mirror_mode: AtomicBool,
    stall_captures: AtomicBool,
}

/// Simulated robot. Share it as `Arc<SimRobot>`; it coerces to
/// `Arc<dyn RobotLink>`.
pub struct SimRobot {
    id: String,
    grant_policy: GrantPolicy,
    actuator_delay: Option<Duration>,
    fail_control_stream: bool,
    fail_event_stream: bool,
    control_slot: Arc<Semaphore>,
    events: broadcast::Sender<SensorEvent>,
    calls: Mutex<Vec<ActuatorCall>>,
    counters: Arc<Counters>,
}

impl SimRobot {
    pub fn new(id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        Self {
            id: id.into(),
            grant_policy: GrantPolicy::Immediate,
            actuator_delay: None,
            fail_control_stream: false,
            fail_event_stream: false,
            control_slot: Arc::new(Semaphore::new(1)),
            events,
            calls: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_grant_policy(mut self, policy: GrantPolicy) -> Self {
        self.grant_policy = policy;
        self
    }

    /// Make every actuator call sleep for `delay` before completing.
    pub fn with_actuator_delay(mut self, delay: Duration) -> Self {
        self.actuator_delay = Some(delay);
        self
    }

    /// Make [`RobotLink::open_control_stream`] fail.
    pub fn with_failing_control_stream(mut self) -> Self {
        self.fail_control_stream = true;
        self
    }

    /// Make [`RobotLink::event_stream`] fail.
    pub fn with_failing_event_stream(mut self) -> Self {
        self.fail_event_stream = true;
        self
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// While set, every image capture hangs forever.
    pub fn stall_captures(&self, stall: bool) {
        self.counters.stall_captures.store(stall, Ordering::SeqCst);
    }

    /// Make the next `n` image captures fail.
    pub fn fail_next_captures(&self, n: usize) {
        self.counters
            .capture_failures_pending
            .store(n, Ordering::SeqCst);
    }

    /// Inject an event into the sensor feed. Returns the number of live
    /// subscriptions that saw it.
    pub fn push_event(&self, event: SensorEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Number of live event subscriptions.
    pub fn event_subscribers(&self) -> usize {
        self.events.receiver_count()
    }

    /// Yield until at least one event subscription exists.
    pub async fn wait_for_event_subscriber(&self) {
        while self.event_subscribers() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Snapshot of every actuator call so far, in order.
    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.lock_calls().clone()
    }

    pub fn control_requests(&self) -> usize {
        self.counters.control_requests.load(Ordering::SeqCst)
    }

    /// Number of release messages received on any control stream.
    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.counters.captures.load(Ordering::SeqCst)
    }

    pub fn event_streams_closed(&self) -> usize {
        self.counters.event_streams_closed.load(Ordering::SeqCst)
    }

    /// Actuator calls that arrived while nobody held control.
    pub fn ungranted_calls(&self) -> usize {
        self.counters.ungranted_calls.load(Ordering::SeqCst)
    }

    /// `true` while some control stream holds the grant.
    pub fn is_control_held(&self) -> bool {
        self.control_slot.available_permits() == 0
    }

    /// Last value passed to [`RobotLink::set_mirror_mode`].
    pub fn mirror_mode(&self) -> bool {
        self.counters.mirror_mode.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn lock_calls(&self) -> MutexGuard<'_, Vec<ActuatorCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn actuate(&self, call: ActuatorCall) -> Result<(), RoamerError> {
        if !self.is_control_held() {
            warn!(robot = %self.id, ?call, "actuator call without control");
            self.counters.ungranted_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.lock_calls().push(call);
        if let Some(delay) = self.actuator_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RobotLink for SimRobot {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open_control_stream(&self) -> Result<Box<dyn ControlStream>, RoamerError> {
        if self.fail_control_stream {
            return Err(RoamerError::transport(
                "open_control_stream",
                "simulated stream failure",
            ));
        }
        let (client_tx, client_rx) = mpsc::channel(8);
        let (robot_tx, robot_rx) = mpsc::channel(8);
        let desk = ControlDesk {
            policy: self.grant_policy,
            slot: Arc::clone(&self.control_slot),
            counters: Arc::clone(&self.counters),
        };
        tokio::spawn(desk.serve(client_rx, robot_tx));
        Ok(Box::new(SimControlStream {
            outbound: Some(client_tx),
            inbound: robot_rx,
        }))
    }

    async fn event_stream(
        &self,
        filters: &[EventFilter],
    ) -> Result<Box<dyn EventStream>, RoamerError> {
        if self.fail_event_stream {
            return Err(RoamerError::transport(
                "event_stream",
                "simulated stream failure",
            ));
        }
        Ok(Box::new(SimEventStream {
            feed: Some(self.events.subscribe()),
            filters: filters.to_vec(),
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn set_mirror_mode(&self, enable: bool) -> Result<(), RoamerError> {
        self.counters.mirror_mode.store(enable, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_image(&self, _high_resolution: bool) -> Result<CameraFrame, RoamerError> {
        self.counters.captures.fetch_add(1, Ordering::SeqCst);
        if self.counters.stall_captures.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failing = self
            .counters
            .capture_failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RoamerError::transport(
                "capture_image",
                "simulated camera failure",
            ));
        }
        Ok(CameraFrame::jpeg(SIM_FRAME.to_vec()))
    }

    async fn drive_wheels(&self, request: DriveWheels) -> Result<(), RoamerError> {
        self.actuate(ActuatorCall::DriveWheels(request)).await
    }

    async fn turn_in_place(&self, request: TurnInPlace) -> Result<(), RoamerError> {
        self.actuate(ActuatorCall::TurnInPlace(request)).await
    }

    async fn move_head(
        &self,
        angle_rad: f32,
        _max_speed_rad_per_sec: f32,
    ) -> Result<(), RoamerError> {
        self.actuate(ActuatorCall::MoveHead { angle_rad }).await
    }

    async fn move_lift(
        &self,
        height_mm: f32,
        _max_speed_rad_per_sec: f32,
    ) -> Result<(), RoamerError> {
        self.actuate(ActuatorCall::MoveLift { height_mm }).await
    }

    async fn say_text(&self, text: &str) -> Result<(), RoamerError> {
        self.actuate(ActuatorCall::SayText(text.to_string())).await
    }

    async fn play_animation(&self, name: &str, loops: u32) -> Result<(), RoamerError> {
        self.actuate(ActuatorCall::PlayAnimation {
            name: name.to_string(),
            loops,
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control stream
// ─────────────────────────────────────────────────────────────────────────────

/// Robot side of one control stream.
struct ControlDesk {
    policy: GrantPolicy,
    slot: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl ControlDesk {
    async fn serve(
        self,
        mut from_client: mpsc::Receiver<ControlMessage>,
        to_client: mpsc::Sender<ControlResponse>,
    ) {
        // Dropping the permit hands control back to the robot.
        let mut permit: Option<OwnedSemaphorePermit> = None;
        let mut lose_at: Option<Instant> = None;

        loop {
            let revoke = async move {
                match lose_at {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = revoke => {
                    permit.take();
                    debug!("sim: revoking control");
                    let _ = to_client.send(ControlResponse::Lost).await;
                    return;
                }
                message = from_client.recv() => match message {
                    Some(ControlMessage::Request { priority }) => {
                        self.counters.control_requests.fetch_add(1, Ordering::SeqCst);
                        debug!(?priority, policy = ?self.policy, "sim: control requested");
                        match self.policy {
                            GrantPolicy::Never => {}
                            GrantPolicy::Refuse => {
                                let _ = to_client.send(ControlResponse::Lost).await;
                                return;
                            }
                            policy => {
                                if let GrantPolicy::After(delay) = policy {
                                    tokio::time::sleep(delay).await;
                                }
                                let acquired = tokio::select! {
                                    p = Arc::clone(&self.slot).acquire_owned() => p.ok(),
                                    _ = to_client.closed() => None,
                                };
                                let Some(acquired) = acquired else { return };
                                permit = Some(acquired);
                                if to_client.send(ControlResponse::Granted).await.is_err() {
                                    return;
                                }
                                if let GrantPolicy::LoseAfter(delay) = policy {
                                    lose_at = Some(Instant::now() + delay);
                                }
                            }
                        }
                    }
                    Some(ControlMessage::Release) => {
                        self.counters.releases.fetch_add(1, Ordering::SeqCst);
                        debug!(held = permit.is_some(), "sim: control released");
                        return;
                    }
                    None => return,
                },
            }
        }
    }
}

struct SimControlStream {
    outbound: Option<mpsc::Sender<ControlMessage>>,
    inbound: mpsc::Receiver<ControlResponse>,
}

#[async_trait]
impl ControlStream for SimControlStream {
    async fn send(&mut self, message: ControlMessage) -> Result<(), RoamerError> {
        let Some(outbound) = &self.outbound else {
            return Err(RoamerError::transport("control_send", "stream closed"));
        };
        outbound
            .send(message)
            .await
            .map_err(|e| RoamerError::transport("control_send", e))
    }

    async fn recv(&mut self) -> Result<Option<ControlResponse>, RoamerError> {
        Ok(self.inbound.recv().await)
    }

    async fn close(&mut self) {
        self.outbound.take();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event stream
// ─────────────────────────────────────────────────────────────────────────────

struct SimEventStream {
    feed: Option<broadcast::Receiver<SensorEvent>>,
    filters: Vec<EventFilter>,
    counters: Arc<Counters>,
}

#[async_trait]
impl EventStream for SimEventStream {
    async fn recv(&mut self) -> Result<Option<SensorEvent>, RoamerError> {
        let Some(feed) = self.feed.as_mut() else {
            return Ok(None);
        };
        loop {
            match feed.recv().await {
                Ok(event) => {
                    if event.filter().is_some_and(|f| self.filters.contains(&f)) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "sim: event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if self.feed.take().is_some() {
            self.counters.event_streams_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

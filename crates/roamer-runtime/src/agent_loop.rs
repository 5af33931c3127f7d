//! [`PerceptionLoop`] – the perception-action orchestrator.
//!
//! One call to [`PerceptionLoop::run`] is one autonomous session:
//!
//! ```text
//! AcquiringControl ──grant──▶ Running ──▶ Draining(reason) ──▶ Released
//!        │                                     ▲
//!        └──── timeout / loss / cancel ────────┘
//! ```
//!
//! While `Running`, each iteration:
//!
//! 1. **Check** – poll the interrupt signal and the session scope, and make
//!    sure the lease is still granted.
//! 2. **Observe** – capture one high-resolution frame (mirror mode on, short
//!    settle, capture, mirror mode off). A failed capture ends the session on
//!    the first iteration and degrades to a text-only turn afterwards.
//! 3. **Decide** – send system prompt + transcript + observation to the
//!    [`ChatModel`]. Transport errors and empty replies play a cue, pause and
//!    move on; the iteration counter still advances.
//! 4. **Parse** – turn the reply into a [`ParsedCommand`]. Parse failures play
//!    a cue and move on. The two sentinels are handled here.
//! 5. **Act** – hand the command to the [`Dispatcher`] under its own timeout,
//!    then pace briefly before the next iteration.
//!
//! Every exit path goes through the drain step, which plays the closing cue
//! while control is still held, releases the lease once, and cancels the
//! interrupt monitor's scope once.
//!
//! # Cancellation scopes
//!
//! ```text
//! caller token
//! └── session scope
//!     ├── arbitrator scope   (releases control when cancelled)
//!     ├── monitor scope      (closes the event stream when cancelled)
//!     └── per-command scope  (one per dispatched command)
//! ```

use std::sync::Arc;
use std::time::Duration;

use roamer_hal::{CameraFrame, RobotLink};
use roamer_kernel::{
    ControlLease, InterruptMonitor, InterruptReceiver, InterruptSource, MonitorExit,
    interrupt_channel,
};
use roamer_types::{
    ConfigError, ControlPriority, DispatchError, ParsedCommand, RoamerError, SessionId,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::command::{CommandRegistry, Sentinel};
use crate::dispatch::{ACTION_TIMEOUT, Dispatcher};
use crate::llm_driver::{ChatModel, LlmDriver};
use crate::prompt::{DEFAULT_TRANSCRIPT_WINDOW, Observation, Transcript, system_prompt};
use crate::settings::{AutonomySettings, DEFAULT_MAX_LOOP_ITERATIONS};

// ─────────────────────────────────────────────────────────────────────────────
// Cues
// ─────────────────────────────────────────────────────────────────────────────

pub const ANIM_WAKE_UP: &str = "anim_wakeup_getout_01";
pub const ANIM_ERROR: &str = "anim_feedback_facepalmerror_01";
pub const ANIM_CONNECTION_ERROR: &str = "anim_feedback_connectionerror_01";
pub const ANIM_NO_ANSWER: &str = "anim_knowledgegraph_noanswer_01";
pub const ANIM_CONFUSED: &str = "anim_knowledgegraph_confused_01";
pub const ANIM_PHOTO_TAKEN: &str = "anim_phototaken_01";
pub const ANIM_GOODBYE: &str = "anim_goodbye_01";

pub const LINE_ENTERING: &str = "Entering autonomous mode.";

#[derive(Debug, Clone, Copy)]
enum Cue {
    Say(&'static str),
    Animation(&'static str),
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Timing and sizing knobs for [`PerceptionLoop`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub priority: ControlPriority,
    pub acquire_timeout: Duration,
    /// Bound on waiting for the arbitrator (and the monitor) during drain.
    pub release_wait: Duration,
    /// Per-command timeout; also bounds cues and captures.
    pub action_timeout: Duration,
    /// Pause after a dispatched command.
    pub pacing: Duration,
    /// Bound on one model exchange, whatever the [`ChatModel`].
    pub model_timeout: Duration,
    pub model_retry_pause: Duration,
    pub empty_reply_pause: Duration,
    /// Pause after the opening cue.
    pub opening_pause: Duration,
    /// Wait between enabling mirror mode and capturing.
    pub frame_settle: Duration,
    pub transcript_window: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
            priority: ControlPriority::OverrideBehaviors,
            acquire_timeout: roamer_kernel::ACQUIRE_TIMEOUT,
            release_wait: roamer_kernel::RELEASE_WAIT,
            action_timeout: ACTION_TIMEOUT,
            pacing: Duration::from_millis(200),
            model_timeout: crate::llm_driver::MODEL_TIMEOUT,
            model_retry_pause: Duration::from_secs(2),
            empty_reply_pause: Duration::from_secs(1),
            opening_pause: Duration::from_secs(1),
            frame_settle: Duration::from_millis(100),
            transcript_window: DEFAULT_TRANSCRIPT_WINDOW,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session types
// ─────────────────────────────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    /// The model asked to stop.
    Stopped,
    Interrupted,
    Cancelled,
    /// The iteration budget ran out.
    Exhausted,
    /// Unrecoverable error while running (first capture failed).
    Fatal,
    ControlNotAcquired,
    ControlLost,
}

impl DrainReason {
    fn closing_line(&self) -> Option<&'static str> {
        match self {
            DrainReason::Stopped => Some("Stopping autonomous mode."),
            DrainReason::Interrupted => Some("Autonomous mode interrupted."),
            DrainReason::Fatal => Some("I couldn't get a view from my camera. Exiting."),
            // Cancelled sessions never reach a cue: the scope is already gone.
            DrainReason::Cancelled
            | DrainReason::Exhausted
            | DrainReason::ControlNotAcquired
            | DrainReason::ControlLost => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AcquiringControl,
    Running,
    Draining(DrainReason),
    Released,
}

/// Live state of one session. Owned by [`PerceptionLoop::run`] and dropped
/// when the session is released.
pub struct LoopSession {
    id: SessionId,
    phase: SessionPhase,
    iteration: u32,
    commands_executed: u32,
    transcript: Transcript,
    lease: ControlLease,
    interrupts: InterruptReceiver,
    interrupt: Option<InterruptSource>,
    scope: CancellationToken,
    monitor_scope: CancellationToken,
    monitor: Option<JoinHandle<MonitorExit>>,
    error: Option<RoamerError>,
}

impl LoopSession {
    fn set_phase(&mut self, phase: SessionPhase) {
        debug!(from = ?self.phase, to = ?phase, "session phase");
        self.phase = phase;
    }

    /// Cues are actuator calls: only while control is held and the session
    /// has not been cancelled.
    fn may_actuate(&self) -> bool {
        self.lease.is_granted() && !self.scope.is_cancelled()
    }
}

/// Outcome of one session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: SessionId,
    pub reason: DrainReason,
    /// Iterations started.
    pub iterations: u32,
    pub commands_executed: u32,
    /// The error behind a fatal or control-related exit.
    pub error: Option<RoamerError>,
    pub interrupt: Option<InterruptSource>,
    /// `false` if the arbitrator did not finish within the release wait.
    pub released_cleanly: bool,
    pub monitor_exit: Option<MonitorExit>,
}

enum Step {
    Continue,
    Drain(DrainReason),
}

// ─────────────────────────────────────────────────────────────────────────────
// PerceptionLoop
// ─────────────────────────────────────────────────────────────────────────────

/// Runs autonomous sessions against one robot with one model.
pub struct PerceptionLoop {
    robot: Arc<dyn RobotLink>,
    model: Arc<dyn ChatModel>,
    dispatcher: Dispatcher,
    system_prompt: String,
    config: LoopConfig,
}

impl PerceptionLoop {
    pub fn new(
        robot: Arc<dyn RobotLink>,
        model: Arc<dyn ChatModel>,
        registry: Arc<CommandRegistry>,
        behavior_prompt: Option<&str>,
        config: LoopConfig,
    ) -> Self {
        let system_prompt = system_prompt(behavior_prompt, &registry);
        let dispatcher = Dispatcher::new(registry).with_action_timeout(config.action_timeout);
        Self {
            robot,
            model,
            dispatcher,
            system_prompt,
            config,
        }
    }

    /// Validate `settings` and wire an [`LlmDriver`] for them.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`]; nothing is sent to the robot.
    pub fn from_settings(
        robot: Arc<dyn RobotLink>,
        settings: &AutonomySettings,
        registry: Arc<CommandRegistry>,
    ) -> Result<Self, ConfigError> {
        let validated = settings.validate()?;
        let config = LoopConfig {
            max_iterations: validated.max_loop_iterations,
            ..LoopConfig::default()
        };
        let driver = LlmDriver::from_settings(&validated).with_timeout(config.model_timeout);
        let model = Arc::new(driver);
        Ok(Self::new(
            robot,
            model,
            registry,
            validated.system_prompt.as_deref(),
            config,
        ))
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Run one session to completion. Cancelling `cancel` ends it early; the
    /// lease is still released.
    pub async fn run(&self, cancel: CancellationToken) -> SessionReport {
        let id = SessionId::new();
        let span = info_span!("session", id = %id, robot = %self.robot.id());
        self.run_session(id, cancel).instrument(span).await
    }

    async fn run_session(&self, id: SessionId, cancel: CancellationToken) -> SessionReport {
        let scope = cancel.child_token();
        let monitor_scope = scope.child_token();
        let (trigger, interrupts) = interrupt_channel();

        info!(priority = ?self.config.priority, "requesting control");
        let lease = ControlLease::request(
            Arc::clone(&self.robot),
            self.config.priority,
            scope.child_token(),
        );
        let mut session = LoopSession {
            id,
            phase: SessionPhase::AcquiringControl,
            iteration: 0,
            commands_executed: 0,
            transcript: Transcript::new(self.config.transcript_window),
            lease,
            interrupts,
            interrupt: None,
            scope,
            monitor_scope,
            monitor: None,
            error: None,
        };

        let acquired = session
            .lease
            .acquire(self.config.acquire_timeout, &session.scope)
            .await;
        let reason = match acquired {
            Ok(()) => {
                info!("control acquired");
                session.monitor = Some(
                    InterruptMonitor::new(Arc::clone(&self.robot))
                        .spawn(session.monitor_scope.clone(), trigger),
                );
                self.running(&mut session).await
            }
            Err(RoamerError::Cancelled) => DrainReason::Cancelled,
            Err(e) => {
                warn!(error = %e, "could not acquire control");
                let reason = if e == RoamerError::ControlLost {
                    DrainReason::ControlLost
                } else {
                    DrainReason::ControlNotAcquired
                };
                session.error = Some(e);
                reason
            }
        };

        self.drain(session, reason).await
    }

    // -------------------------------------------------------------------------
    // Running
    // -------------------------------------------------------------------------

    async fn running(&self, session: &mut LoopSession) -> DrainReason {
        session.set_phase(SessionPhase::Running);
        self.cue(session, Cue::Say(LINE_ENTERING)).await;
        self.cue(session, Cue::Animation(ANIM_WAKE_UP)).await;
        self.pause(self.config.opening_pause, &session.scope).await;

        for iteration in 1..=self.config.max_iterations {
            session.iteration = iteration;
            let span = info_span!("iteration", n = iteration, of = self.config.max_iterations);
            if let Step::Drain(reason) = self.iterate(session).instrument(span).await {
                return reason;
            }
        }
        info!("iteration budget exhausted");
        DrainReason::Exhausted
    }

    async fn iterate(&self, session: &mut LoopSession) -> Step {
        // ── 1. Check ──────────────────────────────────────────────────────
        if let Some(source) = session.interrupts.poll() {
            info!(%source, "interrupt received");
            session.interrupt = Some(source);
            return Step::Drain(DrainReason::Interrupted);
        }
        if session.scope.is_cancelled() {
            info!("session cancelled");
            return Step::Drain(DrainReason::Cancelled);
        }
        if !session.lease.is_granted() {
            warn!(state = ?session.lease.state(), "control no longer held");
            session.error = Some(RoamerError::ControlLost);
            return Step::Drain(DrainReason::ControlLost);
        }

        // ── 2. Observe ────────────────────────────────────────────────────
        let observation = match self.capture(&session.scope).await {
            Ok(frame) => Observation::Frame(frame),
            Err(RoamerError::Cancelled) => return Step::Drain(DrainReason::Cancelled),
            Err(e) => {
                warn!(error = %e, "camera capture failed");
                self.cue(session, Cue::Animation(ANIM_ERROR)).await;
                if session.iteration == 1 {
                    session.error = Some(e);
                    return Step::Drain(DrainReason::Fatal);
                }
                Observation::CaptureFailed
            }
        };

        // ── 3. Decide ─────────────────────────────────────────────────────
        let current = observation.to_message(self.model.supports_images());
        let request = session.transcript.request(&self.system_prompt, current.clone());
        debug!(messages = request.len(), image = current.has_image(), "querying model");
        let timed =
            tokio::time::timeout(self.config.model_timeout, self.model.complete(&request));
        let completion = tokio::select! {
            biased;
            _ = session.scope.cancelled() => return Step::Drain(DrainReason::Cancelled),
            completion = timed => match completion {
                Ok(reply) => reply.map_err(RoamerError::from),
                Err(_) => Err(RoamerError::transport("model_call", "timed out")),
            },
        };
        let reply = match completion {
            Ok(reply) => reply.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "model call failed");
                self.cue(session, Cue::Animation(ANIM_CONNECTION_ERROR)).await;
                self.pause(self.config.model_retry_pause, &session.scope).await;
                return Step::Continue;
            }
        };
        if reply.is_empty() {
            warn!(error = %RoamerError::EmptyModelResponse, "skipping iteration");
            self.cue(session, Cue::Animation(ANIM_NO_ANSWER)).await;
            self.pause(self.config.empty_reply_pause, &session.scope).await;
            return Step::Continue;
        }
        info!(%reply, "model replied");

        // ── 4. Parse ──────────────────────────────────────────────────────
        let command: ParsedCommand = match self.dispatcher.registry().parse(&reply) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, %reply, "could not parse model reply");
                self.cue(session, Cue::Animation(ANIM_CONFUSED)).await;
                return Step::Continue;
            }
        };
        session.transcript.record(&current, &reply);

        match Sentinel::from_name(&command.name) {
            Some(Sentinel::RefreshObservation) => {
                debug!("fresh observation requested");
                self.cue(session, Cue::Animation(ANIM_PHOTO_TAKEN)).await;
                return Step::Continue;
            }
            Some(Sentinel::StopSession) => {
                info!("model asked to stop");
                return Step::Drain(DrainReason::Stopped);
            }
            None => {}
        }

        // ── 5. Act ────────────────────────────────────────────────────────
        let dispatched = self
            .dispatcher
            .dispatch(self.robot.as_ref(), &session.lease, &command, &session.scope)
            .await;
        match dispatched {
            Ok(()) => session.commands_executed += 1,
            Err(DispatchError::Cancelled(_)) => return Step::Drain(DrainReason::Cancelled),
            Err(DispatchError::LeaseNotGranted(_)) => {
                session.error = Some(RoamerError::ControlLost);
                return Step::Drain(DrainReason::ControlLost);
            }
            Err(_) => self.cue(session, Cue::Animation(ANIM_ERROR)).await,
        }

        self.pause(self.config.pacing, &session.scope).await;
        Step::Continue
    }

    // -------------------------------------------------------------------------
    // Draining
    // -------------------------------------------------------------------------

    async fn drain(&self, mut session: LoopSession, reason: DrainReason) -> SessionReport {
        session.set_phase(SessionPhase::Draining(reason));
        info!(
            ?reason,
            iterations = session.iteration,
            commands = session.commands_executed,
            "draining session"
        );

        if session.may_actuate() {
            if let Some(line) = reason.closing_line() {
                self.cue(&session, Cue::Say(line)).await;
            }
            self.cue(&session, Cue::Animation(ANIM_GOODBYE)).await;
        }

        let released_cleanly = session.lease.release(self.config.release_wait).await;
        session.monitor_scope.cancel();
        let monitor_exit = match session.monitor.take() {
            Some(handle) => match tokio::time::timeout(self.config.release_wait, handle).await {
                Ok(Ok(exit)) => Some(exit),
                Ok(Err(e)) => {
                    warn!(error = %e, "interrupt monitor task failed");
                    None
                }
                Err(_) => {
                    warn!("interrupt monitor did not stop in time");
                    None
                }
            },
            None => None,
        };
        session.scope.cancel();
        session.set_phase(SessionPhase::Released);
        info!(?reason, lease = ?session.lease.state(), "session released");

        SessionReport {
            id: session.id,
            reason,
            iterations: session.iteration,
            commands_executed: session.commands_executed,
            error: session.error.take(),
            interrupt: session.interrupt.take(),
            released_cleanly,
            monitor_exit,
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Mirror mode on, settle, high-resolution capture, mirror mode off.
    ///
    /// Only the capture itself is bounded by the action timeout and raced
    /// against the scope; mirror mode is switched off on every path.
    async fn capture(&self, scope: &CancellationToken) -> Result<CameraFrame, RoamerError> {
        self.set_mirror_mode(true).await;
        self.pause(self.config.frame_settle, scope).await;
        let timed =
            tokio::time::timeout(self.config.action_timeout, self.robot.capture_image(true));
        let frame = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(RoamerError::Cancelled),
            captured = timed => match captured {
                Ok(frame) => frame,
                Err(_) => Err(RoamerError::transport("capture_image", "timed out")),
            },
        };
        self.set_mirror_mode(false).await;
        frame?.non_empty()
    }

    async fn set_mirror_mode(&self, enable: bool) {
        let set = tokio::time::timeout(
            self.config.action_timeout,
            self.robot.set_mirror_mode(enable),
        )
        .await;
        match set {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(enable, error = %e, "could not set mirror mode"),
            Err(_) => debug!(enable, "setting mirror mode timed out"),
        }
    }

    async fn cue(&self, session: &LoopSession, cue: Cue) {
        if !session.may_actuate() {
            debug!(?cue, "skipping cue without control");
            return;
        }
        let played = tokio::time::timeout(self.config.action_timeout, async {
            match cue {
                Cue::Say(text) => self.robot.say_text(text).await,
                Cue::Animation(name) => self.robot.play_animation(name, 1).await,
            }
        })
        .await;
        match played {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(?cue, error = %e, "cue failed"),
            Err(_) => debug!(?cue, "cue timed out"),
        }
    }

    async fn pause(&self, duration: Duration, scope: &CancellationToken) {
        tokio::select! {
            _ = scope.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use roamer_hal::{ActuatorCall, GrantPolicy, SimRobot};
    use roamer_types::SensorEvent;

    use super::*;
    use crate::llm_driver::{ChatMessage, LlmError};

    enum Reply {
        Text(&'static str),
        Fail,
        Hang,
    }

    /// Replays a fixed script, then repeats `fallback` forever.
    struct ScriptedModel {
        name: &'static str,
        script: Mutex<VecDeque<Reply>>,
        fallback: &'static str,
        requests: Mutex<Vec<Vec<ChatMessage>>>,
        /// Capture failures to inject after the first model call.
        break_camera: Option<Arc<SimRobot>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Reply>, fallback: &'static str) -> Self {
            Self {
                name: "gpt-4o",
                script: Mutex::new(script.into()),
                fallback,
                requests: Mutex::new(Vec::new()),
                break_camera: None,
            }
        }

        fn requests(&self) -> Vec<Vec<ChatMessage>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            self.name
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
            let first = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(messages.to_vec());
                requests.len() == 1
            };
            if first && let Some(robot) = &self.break_camera {
                robot.fail_next_captures(1);
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Reply::Text(text)) => Ok(text.to_string()),
                Some(Reply::Fail) => Err(LlmError::BadResponse("scripted failure".into())),
                Some(Reply::Hang) => std::future::pending().await,
                None => Ok(self.fallback.to_string()),
            }
        }
    }

    const STOP: &str = "CMD_STOP_AUTONOMOUS_MODE()";
    const REFRESH: &str = "CMD_TAKE_PHOTO_AND_CONTINUE()";

    fn build(
        robot: &Arc<SimRobot>,
        model: &Arc<ScriptedModel>,
        config: LoopConfig,
    ) -> PerceptionLoop {
        PerceptionLoop::new(
            robot.clone(),
            model.clone(),
            Arc::new(CommandRegistry::builtin()),
            None,
            config,
        )
    }

    fn animations(robot: &SimRobot) -> Vec<String> {
        robot
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ActuatorCall::PlayAnimation { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    fn speech(robot: &SimRobot) -> Vec<String> {
        robot
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ActuatorCall::SayText(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn stop_sentinel_runs_a_full_session() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(
            vec![Reply::Text("CMD_DRIVE_WHEELS(50, 50, 1000)"), Reply::Text(STOP)],
            STOP,
        ));
        let report = build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.reason, DrainReason::Stopped);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.commands_executed, 1);
        assert!(report.error.is_none());
        assert!(report.released_cleanly);
        assert_eq!(report.monitor_exit, Some(MonitorExit::Cancelled));

        let calls = robot.calls();
        assert_eq!(calls.first(), Some(&ActuatorCall::SayText(LINE_ENTERING.into())));
        assert!(calls.iter().any(|c| matches!(c, ActuatorCall::DriveWheels(_))));
        assert_eq!(
            calls.last(),
            Some(&ActuatorCall::PlayAnimation { name: ANIM_GOODBYE.into(), loops: 1 })
        );
        assert_eq!(speech(&robot).last().map(String::as_str), Some("Stopping autonomous mode."));

        assert_eq!(robot.control_requests(), 1);
        assert_eq!(robot.releases(), 1);
        assert_eq!(robot.ungranted_calls(), 0);
        assert_eq!(robot.event_streams_closed(), 1);
        assert!(!robot.is_control_held());
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_timeout_never_touches_actuators() {
        let robot = Arc::new(SimRobot::new("sim").with_grant_policy(GrantPolicy::Never));
        let model = Arc::new(ScriptedModel::new(vec![], STOP));
        let report = build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.reason, DrainReason::ControlNotAcquired);
        assert_eq!(report.error, Some(RoamerError::ControlAcquisitionTimeout));
        assert_eq!(report.iterations, 0);
        assert!(robot.calls().is_empty());
        assert_eq!(robot.captures(), 0);
        assert!(model.requests().is_empty());
        assert_eq!(robot.releases(), 0);
        assert_eq!(robot.event_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_control_is_reported_as_lost() {
        let robot = Arc::new(SimRobot::new("sim").with_grant_policy(GrantPolicy::Refuse));
        let model = Arc::new(ScriptedModel::new(vec![], STOP));
        let report = build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.reason, DrainReason::ControlLost);
        assert_eq!(report.error, Some(RoamerError::ControlLost));
        assert!(robot.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_interrupts_the_session() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(vec![], REFRESH));
        let session = build(&robot, &model, LoopConfig::default());

        let run = tokio::spawn(async move { session.run(CancellationToken::new()).await });
        robot.wait_for_event_subscriber().await;
        robot.push_event(SensorEvent::touch(100));
        robot.push_event(SensorEvent::touch(200));

        let report = run.await.unwrap();
        assert_eq!(report.reason, DrainReason::Interrupted);
        assert_eq!(
            report.interrupt,
            Some(InterruptSource::Touch { baseline: 100, sample: 200 })
        );
        assert!(matches!(report.monitor_exit, Some(MonitorExit::Interrupted(_))));
        assert_eq!(
            speech(&robot).last().map(String::as_str),
            Some("Autonomous mode interrupted.")
        );
        assert_eq!(robot.releases(), 1);
        assert_eq!(robot.event_streams_closed(), 1);
        assert_eq!(robot.ungranted_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_word_interrupts_the_session() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(vec![], REFRESH));
        let session = build(&robot, &model, LoopConfig::default());

        let run = tokio::spawn(async move { session.run(CancellationToken::new()).await });
        robot.wait_for_event_subscriber().await;
        robot.push_event(SensorEvent::wake_word());

        let report = run.await.unwrap();
        assert_eq!(report.reason, DrainReason::Interrupted);
        assert_eq!(report.interrupt, Some(InterruptSource::WakeWord));
        assert_eq!(
            report.monitor_exit,
            Some(MonitorExit::Interrupted(InterruptSource::WakeWord))
        );
        assert_eq!(robot.releases(), 1);
        assert!(!robot.is_control_held());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_without_closing_cue() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(vec![], REFRESH));
        let session = build(&robot, &model, LoopConfig::default());
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let run = tokio::spawn(async move { session.run(token).await });
        robot.wait_for_event_subscriber().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();

        let report = run.await.unwrap();
        assert_eq!(report.reason, DrainReason::Cancelled);
        assert!(!animations(&robot).contains(&ANIM_GOODBYE.to_string()));
        assert_eq!(speech(&robot), vec![LINE_ENTERING.to_string()]);
        assert_eq!(report.monitor_exit, Some(MonitorExit::Cancelled));
        assert_eq!(robot.releases(), 1);
        assert_eq!(robot.event_streams_closed(), 1);
        assert_eq!(robot.ungranted_calls(), 0);
        assert!(!robot.is_control_held());
    }

    #[tokio::test(start_paused = true)]
    async fn first_capture_failure_is_fatal() {
        let robot = Arc::new(SimRobot::new("sim"));
        robot.fail_next_captures(1);
        let model = Arc::new(ScriptedModel::new(vec![], STOP));
        let report = build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.reason, DrainReason::Fatal);
        assert!(matches!(report.error, Some(RoamerError::Transport { .. })));
        assert_eq!(report.iterations, 1);
        assert!(model.requests().is_empty());
        assert_eq!(
            animations(&robot),
            vec![ANIM_WAKE_UP.to_string(), ANIM_ERROR.to_string(), ANIM_GOODBYE.to_string()]
        );
        assert_eq!(robot.releases(), 1);
        assert_eq!(report.monitor_exit, Some(MonitorExit::Cancelled));
        assert_eq!(robot.event_streams_closed(), 1);
        assert!(!robot.mirror_mode());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_first_capture_is_fatal_and_restores_mirror() {
        let robot = Arc::new(SimRobot::new("sim"));
        robot.stall_captures(true);
        let model = Arc::new(ScriptedModel::new(vec![], STOP));
        let config = LoopConfig {
            action_timeout: Duration::from_secs(2),
            ..LoopConfig::default()
        };
        let report = build(&robot, &model, config).run(CancellationToken::new()).await;

        assert_eq!(report.reason, DrainReason::Fatal);
        assert!(matches!(
            report.error,
            Some(RoamerError::Transport { ref operation, .. }) if operation == "capture_image"
        ));
        assert!(model.requests().is_empty());
        assert!(!robot.mirror_mode());
        assert_eq!(robot.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_stalled_capture_drains_promptly() {
        let robot = Arc::new(SimRobot::new("sim"));
        robot.stall_captures(true);
        let model = Arc::new(ScriptedModel::new(vec![], STOP));
        let session = build(&robot, &model, LoopConfig::default());
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let run = tokio::spawn(async move { session.run(token).await });
        robot.wait_for_event_subscriber().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(robot.captures(), 1);
        let cancelled_at = tokio::time::Instant::now();
        cancel.cancel();

        let report = run.await.unwrap();
        assert!(cancelled_at.elapsed() < ACTION_TIMEOUT);
        assert_eq!(report.reason, DrainReason::Cancelled);
        assert!(report.error.is_none());
        assert!(!robot.mirror_mode());
        assert_eq!(robot.releases(), 1);
        assert!(!robot.is_control_held());
    }

    #[tokio::test(start_paused = true)]
    async fn later_capture_failure_degrades_to_text() {
        let robot = Arc::new(SimRobot::new("sim"));
        let mut model = ScriptedModel::new(
            vec![Reply::Text("CMD_MOVE_HEAD(0.2)"), Reply::Text(STOP)],
            STOP,
        );
        model.break_camera = Some(robot.clone());
        let model = Arc::new(model);
        let report = build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.reason, DrainReason::Stopped);
        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].last().unwrap().has_image());
        let second = requests[1].last().unwrap();
        assert!(!second.has_image());
        assert!(second.text().contains("failed to capture"));
        assert!(animations(&robot).contains(&ANIM_ERROR.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn model_failures_are_recovered() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(
            vec![
                Reply::Fail,
                Reply::Text("  "),
                Reply::Text("I would like to dance"),
                Reply::Text(STOP),
            ],
            STOP,
        ));
        let report = build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.reason, DrainReason::Stopped);
        assert_eq!(report.iterations, 4);
        assert_eq!(
            animations(&robot),
            vec![
                ANIM_WAKE_UP.to_string(),
                ANIM_CONNECTION_ERROR.to_string(),
                ANIM_NO_ANSWER.to_string(),
                ANIM_CONFUSED.to_string(),
                ANIM_GOODBYE.to_string(),
            ]
        );
        // Failed turns leave no trace in the transcript.
        let last = model.requests().pop().unwrap();
        assert_eq!(last.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_model_call_times_out_and_retries() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(vec![Reply::Hang, Reply::Text(STOP)], STOP));
        let config = LoopConfig {
            model_timeout: Duration::from_secs(5),
            ..LoopConfig::default()
        };
        let report = build(&robot, &model, config).run(CancellationToken::new()).await;

        assert_eq!(report.reason, DrainReason::Stopped);
        assert_eq!(report.iterations, 2);
        assert_eq!(model.requests().len(), 2);
        assert!(animations(&robot).contains(&ANIM_CONNECTION_ERROR.to_string()));
        assert_eq!(robot.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_errors_do_not_end_the_session() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(
            vec![Reply::Text("CMD_TURN_IN_PLACE(1.0, 1.0, 5)"), Reply::Text(STOP)],
            STOP,
        ));
        let report = build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.reason, DrainReason::Stopped);
        assert_eq!(report.commands_executed, 0);
        assert!(animations(&robot).contains(&ANIM_ERROR.to_string()));
        assert!(!robot.calls().iter().any(|c| matches!(c, ActuatorCall::TurnInPlace(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_budget_is_enforced() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(vec![], "CMD_MOVE_LIFT(30)"));
        let config = LoopConfig {
            max_iterations: 3,
            ..LoopConfig::default()
        };
        let report = build(&robot, &model, config).run(CancellationToken::new()).await;

        assert_eq!(report.reason, DrainReason::Exhausted);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.commands_executed, 3);
        assert_eq!(model.requests().len(), 3);
        assert_eq!(robot.releases(), 1);
        assert_eq!(report.monitor_exit, Some(MonitorExit::Cancelled));
        assert!(!robot.is_control_held());
        assert_eq!(speech(&robot), vec![LINE_ENTERING.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_carries_earlier_turns() {
        let robot = Arc::new(SimRobot::new("sim"));
        let model = Arc::new(ScriptedModel::new(
            vec![Reply::Text("CMD_MOVE_HEAD(0.1)"), Reply::Text(STOP)],
            STOP,
        ));
        build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        let requests = model.requests();
        assert_eq!(requests[0].len(), 2);
        assert_eq!(requests[1].len(), 4);
        assert_eq!(requests[1][2], ChatMessage::assistant("CMD_MOVE_HEAD(0.1)"));
        assert!(!requests[1][1].has_image());
        assert!(requests[1][0].text().contains("CMD_DRIVE_WHEELS"));
    }

    #[tokio::test(start_paused = true)]
    async fn text_only_model_gets_no_image() {
        let robot = Arc::new(SimRobot::new("sim"));
        let mut model = ScriptedModel::new(vec![], STOP);
        model.name = "llama3";
        let model = Arc::new(model);
        build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        let first = model.requests().remove(0);
        assert!(!first.last().unwrap().has_image());
        assert!(first.last().unwrap().text().contains("No image"));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_control_ends_the_session() {
        let robot = Arc::new(
            SimRobot::new("sim").with_grant_policy(GrantPolicy::LoseAfter(Duration::from_secs(5))),
        );
        let model = Arc::new(ScriptedModel::new(vec![], "CMD_MOVE_HEAD(0.3)"));
        let report = build(&robot, &model, LoopConfig::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.reason, DrainReason::ControlLost);
        assert_eq!(report.error, Some(RoamerError::ControlLost));
        assert!(report.iterations < DEFAULT_MAX_LOOP_ITERATIONS);
        // The robot already revoked the grant; nothing is sent back.
        assert_eq!(robot.releases(), 0);
        assert!(report.released_cleanly);
        assert_eq!(report.monitor_exit, Some(MonitorExit::Cancelled));
        assert_eq!(robot.event_streams_closed(), 1);
        assert!(!animations(&robot).contains(&ANIM_GOODBYE.to_string()));
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected_before_contacting_the_robot() {
        let robot = Arc::new(SimRobot::new("sim"));
        let settings = AutonomySettings::default();
        let result = PerceptionLoop::from_settings(
            robot.clone(),
            &settings,
            Arc::new(CommandRegistry::builtin()),
        );
        assert!(matches!(result, Err(ConfigError::MissingApiKey)));
        assert_eq!(robot.control_requests(), 0);
    }
}

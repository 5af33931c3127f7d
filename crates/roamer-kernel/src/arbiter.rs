//! [`ControlLease`] – exclusive ownership of the robot's actuators.
//!
//! A lease is negotiated over the robot's bidirectional control stream by a
//! background arbitrator task:
//!
//! 1. open the stream and send a control request with the lease priority;
//! 2. read responses until a grant or a loss notification arrives;
//! 3. on grant, signal the waiting caller exactly once through a one-shot
//!    channel. If the caller already gave up (or the scope is cancelled) the
//!    grant is released straight away instead of being left dangling;
//! 4. hold control until the stop signal fires or the scope is cancelled,
//!    then send a release and close the stream;
//! 5. a loss notification at any point ends the task without further traffic.
//!
//! The caller side waits on the grant, a fixed timeout and the scope,
//! whichever comes first. Anything but the grant is an acquisition failure.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use roamer_hal::{RobotLink, SimRobot};
//! use roamer_kernel::arbiter::{ControlLease, ACQUIRE_TIMEOUT, RELEASE_WAIT};
//! use roamer_types::ControlPriority;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test_block_on(async {
//! let robot: Arc<dyn RobotLink> = Arc::new(SimRobot::new("sim"));
//! let scope = CancellationToken::new();
//! let priority = ControlPriority::OverrideBehaviors;
//! let mut lease = ControlLease::request(robot, priority, scope.child_token());
//! lease.acquire(ACQUIRE_TIMEOUT, &scope).await.expect("sim grants immediately");
//! assert!(lease.is_granted());
//! lease.release(RELEASE_WAIT).await;
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use roamer_hal::{ControlStream, RobotLink};
use roamer_types::{ControlMessage, ControlPriority, ControlResponse, LeaseState, RoamerError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a caller waits for the grant before giving up.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the drain step waits for the arbitrator to finish releasing.
pub const RELEASE_WAIT: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// ControlLease (caller side)
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one control lease and its background arbitrator.
///
/// The lease state is owned by the arbitrator task and observed here through
/// a [`watch`] channel. Dropping the handle acts as a stop signal.
pub struct ControlLease {
    priority: ControlPriority,
    state: watch::Receiver<LeaseState>,
    granted: Option<oneshot::Receiver<()>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ControlLease {
    /// Spawn the arbitrator and start requesting control at `priority`.
    ///
    /// `scope` governs the arbitrator: cancelling it releases a held grant
    /// and closes the stream.
    pub fn request(
        link: Arc<dyn RobotLink>,
        priority: ControlPriority,
        scope: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(LeaseState::Idle);
        let (grant_tx, grant_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let arbitrator = Arbitrator {
            link,
            priority,
            state: state_tx,
            scope,
        };
        let task = tokio::spawn(arbitrator.run(grant_tx, stop_rx));

        Self {
            priority,
            state: state_rx,
            granted: Some(grant_rx),
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Wait for the grant, at most `timeout`, unless `scope` is cancelled
    /// first.
    ///
    /// May be called once; a second call reports the current state.
    ///
    /// # Errors
    ///
    /// * [`RoamerError::ControlAcquisitionTimeout`] when no grant arrives in time.
    /// * [`RoamerError::ControlLost`] when the robot answered with a loss.
    /// * [`RoamerError::Transport`] when the stream could not be opened or broke.
    /// * [`RoamerError::Cancelled`] when `scope` was cancelled.
    pub async fn acquire(
        &mut self,
        timeout: Duration,
        scope: &CancellationToken,
    ) -> Result<(), RoamerError> {
        let Some(granted) = self.granted.take() else {
            return if self.is_granted() {
                Ok(())
            } else {
                Err(self.failure())
            };
        };

        // The receiver is dropped on every non-grant path, so a grant that
        // shows up later is released by the arbitrator.
        tokio::select! {
            biased;
            _ = scope.cancelled() => Err(RoamerError::Cancelled),
            signal = granted => match signal {
                Ok(()) => Ok(()),
                Err(_) => Err(self.failure()),
            },
            _ = tokio::time::sleep(timeout) => Err(RoamerError::ControlAcquisitionTimeout),
        }
    }

    /// Ask the arbitrator to release control and wait up to `wait` for it to
    /// finish. Best effort: returns `false` if the arbitrator did not finish
    /// in time. Calling it again is a no-op.
    pub async fn release(&mut self, wait: Duration) -> bool {
        self.granted.take();
        if let Some(stop) = self.stop.take() {
            // Err means the arbitrator already exited.
            let _ = stop.send(());
        }
        let Some(task) = self.task.take() else {
            return true;
        };
        match tokio::time::timeout(wait, task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(?wait, "arbitrator did not finish releasing in time");
                false
            }
        }
    }

    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    pub fn is_granted(&self) -> bool {
        self.state() == LeaseState::Granted
    }

    pub fn priority(&self) -> ControlPriority {
        self.priority
    }

    fn failure(&self) -> RoamerError {
        match self.state() {
            LeaseState::Lost => RoamerError::ControlLost,
            state => RoamerError::transport(
                "control_stream",
                format!("arbitration ended without a grant (state {state:?})"),
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arbitrator (task side)
// ─────────────────────────────────────────────────────────────────────────────

struct Arbitrator {
    link: Arc<dyn RobotLink>,
    priority: ControlPriority,
    state: watch::Sender<LeaseState>,
    scope: CancellationToken,
}

impl Arbitrator {
    async fn run(self, grant: oneshot::Sender<()>, mut stop: oneshot::Receiver<()>) {
        let opened = tokio::select! {
            _ = self.scope.cancelled() => {
                self.set(LeaseState::Released);
                return;
            }
            opened = self.link.open_control_stream() => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to open control stream");
                self.set(LeaseState::Failed);
                return;
            }
        };

        let request = ControlMessage::Request {
            priority: self.priority,
        };
        if let Err(e) = stream.send(request).await {
            warn!(error = %e, "failed to send control request");
            stream.close().await;
            self.set(LeaseState::Failed);
            return;
        }
        self.set(LeaseState::Requesting);
        debug!(priority = ?self.priority, "control requested");

        // ── Wait for the grant ────────────────────────────────────────────
        loop {
            tokio::select! {
                _ = self.scope.cancelled() => {
                    debug!("scope cancelled while waiting for grant");
                    stream.close().await;
                    self.set(LeaseState::Released);
                    return;
                }
                _ = &mut stop => {
                    debug!("stop requested before grant");
                    stream.close().await;
                    self.set(LeaseState::Released);
                    return;
                }
                response = stream.recv() => match response {
                    Ok(Some(ControlResponse::Granted)) => break,
                    Ok(Some(ControlResponse::Lost)) => {
                        warn!("control lost while waiting for grant");
                        self.set(LeaseState::Lost);
                        return;
                    }
                    Ok(Some(ControlResponse::Other(kind))) => {
                        debug!(%kind, "ignoring control response");
                    }
                    Ok(None) => {
                        warn!("control stream closed before grant");
                        self.set(LeaseState::Failed);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "control stream receive error");
                        self.set(LeaseState::Failed);
                        return;
                    }
                },
            }
        }

        self.set(LeaseState::Granted);
        if self.scope.is_cancelled() || grant.send(()).is_err() {
            info!("control granted after the caller stopped waiting; releasing");
            self.release(stream).await;
            return;
        }
        info!("control granted");

        // ── Hold until stopped ────────────────────────────────────────────
        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("releasing control (stop signal)");
                    break;
                }
                _ = self.scope.cancelled() => {
                    info!("releasing control (scope cancelled)");
                    break;
                }
                response = stream.recv() => match response {
                    Ok(Some(ControlResponse::Lost)) => {
                        warn!("control lost while held");
                        self.set(LeaseState::Lost);
                        return;
                    }
                    Ok(Some(other)) => debug!(?other, "ignoring control response"),
                    Ok(None) => {
                        warn!("control stream closed while holding control");
                        self.set(LeaseState::Lost);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "control stream receive error while holding control");
                        self.set(LeaseState::Lost);
                        return;
                    }
                },
            }
        }
        self.release(stream).await;
    }

    async fn release(&self, mut stream: Box<dyn ControlStream>) {
        self.set(LeaseState::Releasing);
        if let Err(e) = stream.send(ControlMessage::Release).await {
            warn!(error = %e, "failed to send control release");
        }
        stream.close().await;
        self.set(LeaseState::Released);
        info!("control released");
    }

    fn set(&self, state: LeaseState) {
        self.state.send_replace(state);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

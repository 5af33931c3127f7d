//! Interrupt monitor – watches the sensor feed for a human wanting the
//! robot back.
//!
//! Two kinds of events end an autonomous session:
//!
//! | Event | Condition |
//! |---|---|
//! | Wake word | Always, on first sight |
//! | Touch | Raw value moved more than [`TOUCH_DELTA_THRESHOLD`] from the previous sample |
//!
//! The monitor raises at most one interrupt per session. The signal travels
//! through a capacity-one channel and is sent with `try_send`, so the monitor
//! never blocks on a loop that is busy elsewhere; the loop polls the
//! [`InterruptReceiver`] between iterations.

use std::sync::Arc;

use roamer_hal::RobotLink;
use roamer_types::{EventFilter, SensorEventKind};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum absolute change between consecutive touch samples that counts as
/// a touch.
pub const TOUCH_DELTA_THRESHOLD: u32 = 50;

/// What raised the interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptSource {
    Touch { baseline: u32, sample: u32 },
    WakeWord,
}

impl std::fmt::Display for InterruptSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterruptSource::Touch { baseline, sample } => {
                write!(f, "touch ({baseline} -> {sample})")
            }
            InterruptSource::WakeWord => f.write_str("wake word"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Touch baseline
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks the last touch sample and flags large jumps.
///
/// The first sample only establishes the baseline. Every later sample
/// replaces it, including the one that triggers, so a slow drift never
/// registers as a touch.
#[derive(Debug, Clone)]
pub struct TouchBaseline {
    last: Option<u32>,
    threshold: u32,
}

impl TouchBaseline {
    pub fn new(threshold: u32) -> Self {
        Self {
            last: None,
            threshold,
        }
    }

    pub fn value(&self) -> Option<u32> {
        self.last
    }

    /// Feed one raw sample. Returns the interrupt it raises, if any.
    pub fn observe(&mut self, sample: u32) -> Option<InterruptSource> {
        let baseline = self.last.replace(sample)?;
        (baseline.abs_diff(sample) > self.threshold)
            .then_some(InterruptSource::Touch { baseline, sample })
    }
}

impl Default for TouchBaseline {
    fn default() -> Self {
        Self::new(TOUCH_DELTA_THRESHOLD)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal channel
// ─────────────────────────────────────────────────────────────────────────────

/// Sending half of the interrupt signal.
#[derive(Debug, Clone)]
pub struct InterruptTrigger {
    tx: mpsc::Sender<InterruptSource>,
}

/// Receiving half, polled by the loop between iterations.
#[derive(Debug)]
pub struct InterruptReceiver {
    rx: mpsc::Receiver<InterruptSource>,
}

/// Create a capacity-one interrupt channel.
pub fn interrupt_channel() -> (InterruptTrigger, InterruptReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (InterruptTrigger { tx }, InterruptReceiver { rx })
}

impl InterruptTrigger {
    /// Raise `source` without waiting. Returns `false` when a signal is
    /// already pending or nobody is listening anymore; the new one is dropped.
    pub fn fire(&self, source: InterruptSource) -> bool {
        match self.tx.try_send(source) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                debug!(%dropped, "interrupt already pending; dropping");
                false
            }
            Err(TrySendError::Closed(dropped)) => {
                debug!(%dropped, "interrupt receiver gone; dropping");
                false
            }
        }
    }
}

impl InterruptReceiver {
    /// Non-blocking check for a pending interrupt.
    pub fn poll(&mut self) -> Option<InterruptSource> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next interrupt. `None` once every trigger is gone.
    pub async fn recv(&mut self) -> Option<InterruptSource> {
        self.rx.recv().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor
// ─────────────────────────────────────────────────────────────────────────────

/// Why the monitor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    Interrupted(InterruptSource),
    Cancelled,
    StreamClosed,
    StreamError(String),
    SubscribeFailed(String),
}

/// Subscribes to robot-state and wake-word events and raises one interrupt.
pub struct InterruptMonitor {
    link: Arc<dyn RobotLink>,
    threshold: u32,
}

impl InterruptMonitor {
    pub fn new(link: Arc<dyn RobotLink>) -> Self {
        Self {
            link,
            threshold: TOUCH_DELTA_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Run the monitor on its own task.
    pub fn spawn(
        self,
        scope: CancellationToken,
        trigger: InterruptTrigger,
    ) -> JoinHandle<MonitorExit> {
        tokio::spawn(self.run(scope, trigger))
    }

    /// Watch the feed until an interrupt, cancellation of `scope`, or the end
    /// of the stream. The subscription is closed whenever the monitor stops
    /// on its own account.
    pub async fn run(self, scope: CancellationToken, trigger: InterruptTrigger) -> MonitorExit {
        let filters = [EventFilter::RobotState, EventFilter::WakeWord];
        let subscribed = tokio::select! {
            _ = scope.cancelled() => return MonitorExit::Cancelled,
            subscribed = self.link.event_stream(&filters) => subscribed,
        };
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "interrupt monitor could not subscribe to events");
                return MonitorExit::SubscribeFailed(e.to_string());
            }
        };
        info!(robot = %self.link.id(), threshold = self.threshold, "interrupt monitor started");

        let mut baseline = TouchBaseline::new(self.threshold);
        loop {
            let next = tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    debug!("interrupt monitor cancelled");
                    stream.close().await;
                    return MonitorExit::Cancelled;
                }
                next = stream.recv() => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    warn!("event stream ended");
                    return MonitorExit::StreamClosed;
                }
                Err(e) => {
                    warn!(error = %e, "event stream error");
                    stream.close().await;
                    return MonitorExit::StreamError(e.to_string());
                }
            };

            let source = match event.kind {
                SensorEventKind::WakeWord => Some(InterruptSource::WakeWord),
                SensorEventKind::Touch { raw_value } => baseline.observe(raw_value),
                _ => None,
            };
            if let Some(source) = source {
                info!(%source, "interrupt detected");
                trigger.fire(source.clone());
                stream.close().await;
                return MonitorExit::Interrupted(source);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! `roamer-runtime` – the autonomous perception-action loop.
//!
//! # Modules
//!
//! - [`agent_loop`] – [`PerceptionLoop`]: one session from control
//!   acquisition to release, wiring the lease, the interrupt monitor, the
//!   model and the dispatcher together.
//! - [`command`] – [`CommandRegistry`]: the command catalog shown to the
//!   model and the parser for its one-line replies.
//! - [`dispatch`] – [`Dispatcher`] and the built-in [`CommandAction`]s that
//!   turn parsed commands into actuator calls.
//! - [`llm_driver`] – [`LlmDriver`]: an OpenAI-compatible chat-completions
//!   client behind the [`ChatModel`] trait.
//! - [`prompt`] – system prompt assembly, observations and the bounded
//!   [`Transcript`].
//! - [`settings`] – [`AutonomySettings`] and their validation.
//! - [`telemetry`] – [`init_tracing`].

pub mod agent_loop;
pub mod command;
pub mod dispatch;
pub mod llm_driver;
pub mod prompt;
pub mod settings;
pub mod telemetry;

pub use agent_loop::{
    DrainReason, LoopConfig, LoopSession, PerceptionLoop, SessionPhase, SessionReport,
};
pub use command::{
    CMD_STOP_AUTONOMOUS_MODE, CMD_TAKE_PHOTO_AND_CONTINUE, CommandRegistry, CommandSpec,
    ParamSpec, Sentinel,
};
pub use dispatch::{ACTION_TIMEOUT, CommandAction, Dispatcher};
pub use llm_driver::{ChatMessage, ChatModel, LlmDriver, LlmError, Role};
pub use prompt::{Observation, Transcript, system_prompt};
pub use settings::{ApiKey, AutonomySettings, ModelProvider, ValidatedSettings};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

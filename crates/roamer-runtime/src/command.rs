//! [`CommandRegistry`] – the model-facing command grammar.
//!
//! The model answers every turn with exactly one command string:
//!
//! ```text
//! NAME(arg1, arg2, ...)
//! ```
//!
//! Each registered [`CommandSpec`] fixes the parameter names, their order and
//! their [`ParamType`]. [`CommandRegistry::parse`] turns a reply into a
//! [`ParsedCommand`] whose values are already coerced, so dispatch never has
//! to guess at types.
//!
//! | Type | Accepted text |
//! |---|---|
//! | `int` | signed 32-bit decimal (`-3`, `+7`) |
//! | `float` | 32-bit float (`1.57`, `-40`, `2e3`) |
//! | `bool` | `1 t T TRUE true True 0 f F FALSE false False` |
//! | `string` | anything; one pair of matching `"` then `'` quotes is stripped |
//!
//! Arguments are split on every comma, so a string argument cannot itself
//! contain a comma.
//!
//! # Example
//!
//! ```rust
//! use roamer_runtime::command::CommandRegistry;
//! use roamer_types::ParamValue;
//!
//! let registry = CommandRegistry::builtin();
//! let cmd = registry.parse("CMD_SAY_TEXT(\"Hello there\")").unwrap();
//! assert_eq!(cmd.name, "CMD_SAY_TEXT");
//! assert_eq!(cmd.get("textToSay"), Some(&ParamValue::String("Hello there".into())));
//! ```

use std::fmt;
use std::sync::Arc;

use roamer_types::{ParamType, ParamValue, ParseError, ParsedCommand};

use crate::dispatch::{
    CommandAction, DriveWheelsAction, MoveHeadAction, MoveLiftAction, PlayAnimationAction,
    SayTextAction, TurnInPlaceAction,
};

/// Asks the loop for a fresh observation before the next model call.
pub const CMD_TAKE_PHOTO_AND_CONTINUE: &str = "CMD_TAKE_PHOTO_AND_CONTINUE";

/// Asks the loop to end the session.
pub const CMD_STOP_AUTONOMOUS_MODE: &str = "CMD_STOP_AUTONOMOUS_MODE";

/// Commands the loop handles itself instead of dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    RefreshObservation,
    StopSession,
}

impl Sentinel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            CMD_TAKE_PHOTO_AND_CONTINUE => Some(Sentinel::RefreshObservation),
            CMD_STOP_AUTONOMOUS_MODE => Some(Sentinel::StopSession),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CommandSpec
// ─────────────────────────────────────────────────────────────────────────────

/// One named, typed parameter of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
}

/// Registry entry: name, ordered parameter contract, and an optional bound
/// action. Entries without an action are loop sentinels.
#[derive(Clone)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    action: Option<Arc<dyn CommandAction>>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            action: None,
        }
    }

    /// Append a positional parameter.
    pub fn param(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            ty,
        });
        self
    }

    /// Bind the action that executes this command.
    pub fn with_action(mut self, action: impl CommandAction + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn action(&self) -> Option<&Arc<dyn CommandAction>> {
        self.action.as_ref()
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    /// `NAME(param: type, ...)`, as shown to the model.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{}: {}", p.name, p.ty))
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("bound", &self.action.is_some())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CommandRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered set of [`CommandSpec`]s, keyed by command name.
///
/// Built at startup, then shared immutably (usually as `Arc<CommandRegistry>`).
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    specs: Vec<CommandSpec>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard catalog: wheel drive, in-place turn, speech, head, lift,
    /// animation, and the two loop sentinels.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            CommandSpec::new(
                "CMD_DRIVE_WHEELS",
                "Drive both wheels. Speeds in mm/s (-150 to 150), duration in ms.",
            )
            .param("leftWheelSpeed", ParamType::Float)
            .param("rightWheelSpeed", ParamType::Float)
            .param("durationMs", ParamType::Int)
            .with_action(DriveWheelsAction),
        );
        registry.register(
            CommandSpec::new(
                "CMD_TURN_IN_PLACE",
                "Turn in place. Angle in radians (1.57 is about 90 degrees), speed in rad/s, \
                 direction 0 for clockwise or 1 for counter-clockwise.",
            )
            .param("angleRad", ParamType::Float)
            .param("speedRadPerSec", ParamType::Float)
            .param("direction", ParamType::Int)
            .with_action(TurnInPlaceAction),
        );
        registry.register(
            CommandSpec::new("CMD_SAY_TEXT", "Speak the given text aloud.")
                .param("textToSay", ParamType::String)
                .with_action(SayTextAction),
        );
        registry.register(
            CommandSpec::new(
                "CMD_MOVE_HEAD",
                "Move the head to an angle in radians (about -0.38 down to 0.73 up).",
            )
            .param("angleRad", ParamType::Float)
            .with_action(MoveHeadAction),
        );
        registry.register(
            CommandSpec::new(
                "CMD_MOVE_LIFT",
                "Move the lift to a height in millimetres (about 0 to 92).",
            )
            .param("heightMm", ParamType::Float)
            .with_action(MoveLiftAction),
        );
        registry.register(
            CommandSpec::new(
                "CMD_PLAY_ANIMATION",
                "Play a named full-body animation, e.g. anim_eyepose_happy.",
            )
            .param("animationName", ParamType::String)
            .with_action(PlayAnimationAction),
        );
        registry.register(CommandSpec::new(
            CMD_TAKE_PHOTO_AND_CONTINUE,
            "Take a fresh photo and decide again with the new view.",
        ));
        registry.register(CommandSpec::new(
            CMD_STOP_AUTONOMOUS_MODE,
            "Finish and leave autonomous mode.",
        ));
        registry
    }

    /// Add `spec`. An existing entry with the same name is replaced in place.
    pub fn register(&mut self, spec: CommandSpec) {
        match self.specs.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.specs.push(spec),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Markdown list of every command, appended to the system prompt.
    pub fn catalog(&self) -> String {
        self.specs
            .iter()
            .map(|s| format!("- `{}`: {}", s.signature(), s.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parse one model reply.
    ///
    /// # Errors
    ///
    /// * [`ParseError::Malformed`] – no trailing `)`, no `(`, or no name.
    /// * [`ParseError::UnknownCommand`] – the name is not registered.
    /// * [`ParseError::ArityMismatch`] – wrong number of arguments.
    /// * [`ParseError::TypeMismatch`] – an argument does not coerce to its
    ///   declared type.
    pub fn parse(&self, text: &str) -> Result<ParsedCommand, ParseError> {
        let text = text.trim();
        let malformed = |reason: &str| ParseError::Malformed {
            input: text.to_string(),
            reason: reason.to_string(),
        };

        let Some(body) = text.strip_suffix(')') else {
            return Err(malformed("does not end with ')'"));
        };
        let Some((name, raw_args)) = body.split_once('(') else {
            return Err(malformed("missing '('"));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(malformed("missing command name"));
        }

        let spec = self
            .get(name)
            .ok_or_else(|| ParseError::UnknownCommand(name.to_string()))?;

        // Only a literally empty list means "no arguments"; `( )` is one
        // blank argument.
        let args: Vec<&str> = if raw_args.is_empty() {
            Vec::new()
        } else {
            raw_args.split(',').map(str::trim).collect()
        };
        if args.len() != spec.params.len() {
            return Err(ParseError::ArityMismatch {
                command: spec.name.clone(),
                expected: spec.params.len(),
                got: args.len(),
            });
        }

        let mut command = ParsedCommand::new(spec.name.clone());
        for (param, raw) in spec.params.iter().zip(args) {
            let value = coerce(param.ty, raw).ok_or_else(|| ParseError::TypeMismatch {
                command: spec.name.clone(),
                param: param.name.clone(),
                expected: param.ty,
                value: raw.to_string(),
            })?;
            command.params.insert(param.name.clone(), value);
        }
        Ok(command)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coercion
// ─────────────────────────────────────────────────────────────────────────────

fn coerce(ty: ParamType, raw: &str) -> Option<ParamValue> {
    match ty {
        ParamType::Int => raw.parse::<i32>().ok().map(ParamValue::Int),
        ParamType::Float => raw.parse::<f32>().ok().map(ParamValue::Float),
        ParamType::Bool => parse_bool(raw).map(ParamValue::Bool),
        ParamType::String => Some(ParamValue::String(unquote(raw).to_string())),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Strip one pair of double quotes, then one pair of single quotes.
fn unquote(raw: &str) -> &str {
    let raw = strip_pair(raw, '"');
    strip_pair(raw, '\'')
}

fn strip_pair(raw: &str, quote: char) -> &str {
    raw.strip_prefix(quote)
        .and_then(|s| s.strip_suffix(quote))
        .unwrap_or(raw)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

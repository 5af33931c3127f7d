//! Typed command values shared by the parser and the dispatch table.
//!
//! A model reply such as `CMD_DRIVE_WHEELS(50, 50, 1000)` is turned into a
//! [`ParsedCommand`] whose parameters are closed [`ParamValue`] variants.
//! Types are fixed once at parse time, so downstream code never has to guess
//! what a parameter holds.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Type tag attached to every parameter of a registered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Signed 32-bit integer.
    Int,
    /// 32-bit float.
    Float,
    /// Literal text, optionally quoted by the model.
    String,
    /// Boolean in canonical form (`true`, `1`, `t`, `FALSE`, ...).
    Bool,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::String => "string",
            ParamType::Bool => "bool",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(ParamType::Int),
            "float" => Ok(ParamType::Float),
            "string" => Ok(ParamType::String),
            "bool" => Ok(ParamType::Bool),
            other => Err(format!("unknown parameter type '{other}'")),
        }
    }
}

/// A single coerced parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    String(String),
    Bool(bool),
}

impl ParamValue {
    /// The [`ParamType`] tag this value was coerced to.
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::String(_) => ParamType::String,
            ParamValue::Bool(_) => ParamType::Bool,
        }
    }
}

/// Renders the value back into grammar form. Strings are double-quoted so the
/// output parses back to the same value. The parser strips a double-quote
/// pair and then a single-quote pair, so a string that is itself wrapped in
/// single quotes gets one extra pair.
impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::String(v) if is_single_quoted(v) => write!(f, "\"'{v}'\""),
            ParamValue::String(v) => write!(f, "\"{v}\""),
            ParamValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

fn is_single_quoted(v: &str) -> bool {
    v.len() >= 2 && v.starts_with('\'') && v.ends_with('\'')
}

/// A command name plus its typed parameters, keyed by parameter name.
///
/// Produced fresh for every model reply and consumed once by dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub name: String,
    pub params: HashMap<String, ParamValue>,
}

impl ParsedCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: HashMap::new(),
        }
    }

    /// Builder-style insert, mostly useful in tests and custom actions.
    pub fn with_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Re-serialize into grammar form using the supplied parameter order.
    ///
    /// Parameters missing from the map are skipped.
    pub fn to_command_string(&self, order: &[&str]) -> String {
        let args: Vec<String> = order
            .iter()
            .filter_map(|name| self.params.get(*name).map(|v| v.to_string()))
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_type_from_str_matches_display() {
        for ty in [ParamType::Int, ParamType::Float, ParamType::String, ParamType::Bool] {
            assert_eq!(ty.to_string().parse::<ParamType>().unwrap(), ty);
        }
        assert!("double".parse::<ParamType>().is_err());
    }

    #[test]
    fn param_value_reports_its_type() {
        assert_eq!(ParamValue::Int(3).param_type(), ParamType::Int);
        assert_eq!(ParamValue::Float(1.5).param_type(), ParamType::Float);
        assert_eq!(ParamValue::String("hi".into()).param_type(), ParamType::String);
        assert_eq!(ParamValue::Bool(true).param_type(), ParamType::Bool);
    }

    #[test]
    fn command_string_follows_declared_order() {
        let cmd = ParsedCommand::new("CMD_DRIVE_WHEELS")
            .with_param("durationMs", ParamValue::Int(1000))
            .with_param("leftWheelSpeed", ParamValue::Float(50.0))
            .with_param("rightWheelSpeed", ParamValue::Float(-25.5));
        let s = cmd.to_command_string(&["leftWheelSpeed", "rightWheelSpeed", "durationMs"]);
        assert_eq!(s, "CMD_DRIVE_WHEELS(50, -25.5, 1000)");
    }

    #[test]
    fn string_values_are_quoted() {
        let cmd = ParsedCommand::new("CMD_SAY_TEXT")
            .with_param("textToSay", ParamValue::String("Hello there".into()));
        assert_eq!(
            cmd.to_command_string(&["textToSay"]),
            "CMD_SAY_TEXT(\"Hello there\")"
        );
    }

    #[test]
    fn single_quoted_strings_get_an_extra_pair() {
        assert_eq!(ParamValue::String("'a'".into()).to_string(), "\"''a''\"");
        assert_eq!(ParamValue::String("'a".into()).to_string(), "\"'a\"");
        assert_eq!(ParamValue::String("'".into()).to_string(), "\"'\"");
    }

    #[test]
    fn param_value_serializes_with_tag() {
        let json = serde_json::to_string(&ParamValue::Int(7)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":7}"#);
    }
}

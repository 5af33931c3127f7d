//! Autonomy settings – the configuration surface of a session.
//!
//! [`AutonomySettings`] is what gets persisted (TOML in the CLI). A session
//! never runs on it directly: [`AutonomySettings::validate`] turns it into
//! [`ValidatedSettings`] or a [`ConfigError`] before any control lease is
//! requested.

use std::fmt;

use roamer_types::ConfigError;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Iteration budget used when the configuration does not set one.
pub const DEFAULT_MAX_LOOP_ITERATIONS: u32 = 100;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const TOGETHER_BASE_URL: &str = "https://api.together.xyz/v1";

// ─────────────────────────────────────────────────────────────────────────────
// ApiKey
// ─────────────────────────────────────────────────────────────────────────────

/// LLM provider secret. Wiped from memory on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw secret, for the `Authorization` header only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<not set>")
        } else {
            f.write_str("<redacted>")
        }
    }
}

impl From<String> for ApiKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Where chat completions are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelProvider {
    OpenAi,
    Together,
    /// Any OpenAI-compatible server at the given base URL.
    Custom(String),
}

impl ModelProvider {
    pub fn base_url(&self) -> &str {
        match self {
            ModelProvider::OpenAi => OPENAI_BASE_URL,
            ModelProvider::Together => TOGETHER_BASE_URL,
            ModelProvider::Custom(endpoint) => endpoint.trim_end_matches('/'),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelProvider::OpenAi => "openai",
            ModelProvider::Together => "together",
            ModelProvider::Custom(_) => "custom",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AutonomySettings
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted autonomy configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AutonomySettings {
    #[serde(default = "default_enable")]
    pub enable: bool,

    /// `openai`, `together` or `custom`.
    #[serde(default = "default_provider")]
    pub llm_provider: String,

    #[serde(default, skip_serializing_if = "ApiKey::is_empty")]
    pub llm_key: ApiKey,

    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL for the `custom` provider.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    /// Replaces the built-in behavioral prompt when non-empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_prompt: String,

    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
}

fn default_enable() -> bool {
    true
}
fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_max_loop_iterations() -> u32 {
    DEFAULT_MAX_LOOP_ITERATIONS
}

impl Default for AutonomySettings {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            llm_provider: default_provider(),
            llm_key: ApiKey::default(),
            model: default_model(),
            endpoint: String::new(),
            system_prompt: String::new(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

impl fmt::Debug for AutonomySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutonomySettings")
            .field("enable", &self.enable)
            .field("llm_provider", &self.llm_provider)
            .field("llm_key", &self.llm_key)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field(
                "system_prompt",
                if self.system_prompt.is_empty() { &"<default>" } else { &"<custom>" },
            )
            .field("max_loop_iterations", &self.max_loop_iterations)
            .finish()
    }
}

impl AutonomySettings {
    /// Check everything a session needs before it touches the robot.
    ///
    /// Checks run in a fixed order and the first failure is returned:
    /// enable flag, API key, provider (and its endpoint), model, iteration
    /// budget.
    pub fn validate(&self) -> Result<ValidatedSettings, ConfigError> {
        if !self.enable {
            return Err(ConfigError::Disabled);
        }
        if self.llm_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        let provider = match self.llm_provider.trim().to_ascii_lowercase().as_str() {
            "openai" => ModelProvider::OpenAi,
            "together" => ModelProvider::Together,
            "custom" => {
                let endpoint = self.endpoint.trim();
                if endpoint.is_empty() {
                    return Err(ConfigError::MissingEndpoint);
                }
                ModelProvider::Custom(endpoint.to_string())
            }
            _ => return Err(ConfigError::UnsupportedProvider(self.llm_provider.clone())),
        };
        let model = self.model.trim();
        if model.is_empty() {
            return Err(ConfigError::MissingModel);
        }
        if self.max_loop_iterations == 0 {
            return Err(ConfigError::InvalidIterations);
        }
        let system_prompt = match self.system_prompt.trim() {
            "" => None,
            prompt => Some(prompt.to_string()),
        };
        Ok(ValidatedSettings {
            provider,
            api_key: self.llm_key.clone(),
            model: model.to_string(),
            system_prompt,
            max_loop_iterations: self.max_loop_iterations,
        })
    }
}

/// Settings that passed [`AutonomySettings::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedSettings {
    pub provider: ModelProvider,
    pub api_key: ApiKey,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_loop_iterations: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> AutonomySettings {
        AutonomySettings {
            llm_key: ApiKey::new("sk-test"),
            ..AutonomySettings::default()
        }
    }

    #[test]
    fn defaults_validate_once_a_key_is_set() {
        let v = configured().validate().unwrap();
        assert_eq!(v.provider, ModelProvider::OpenAi);
        assert_eq!(v.model, "gpt-4o");
        assert_eq!(v.max_loop_iterations, DEFAULT_MAX_LOOP_ITERATIONS);
        assert!(v.system_prompt.is_none());
    }

    #[test]
    fn disabled_wins_over_everything_else() {
        let s = AutonomySettings {
            enable: false,
            ..AutonomySettings::default()
        };
        assert_eq!(s.validate().unwrap_err(), ConfigError::Disabled);
    }

    #[test]
    fn missing_key_is_reported() {
        let s = AutonomySettings {
            llm_key: ApiKey::new("   "),
            ..AutonomySettings::default()
        };
        assert_eq!(s.validate().unwrap_err(), ConfigError::MissingApiKey);
    }

    #[test]
    fn unsupported_provider_is_named() {
        let s = AutonomySettings {
            llm_provider: "carrier-pigeon".into(),
            ..configured()
        };
        assert_eq!(
            s.validate().unwrap_err(),
            ConfigError::UnsupportedProvider("carrier-pigeon".into())
        );
    }

    #[test]
    fn custom_provider_needs_endpoint() {
        let mut s = AutonomySettings {
            llm_provider: "custom".into(),
            ..configured()
        };
        assert_eq!(s.validate().unwrap_err(), ConfigError::MissingEndpoint);

        s.endpoint = "http://localhost:8000/v1/".into();
        let v = s.validate().unwrap();
        assert_eq!(v.provider.base_url(), "http://localhost:8000/v1");
    }

    #[test]
    fn together_has_fixed_base_url() {
        let s = AutonomySettings {
            llm_provider: "Together".into(),
            ..configured()
        };
        assert_eq!(s.validate().unwrap().provider.base_url(), TOGETHER_BASE_URL);
    }

    #[test]
    fn empty_model_and_zero_iterations_are_rejected() {
        let s = AutonomySettings {
            model: " ".into(),
            ..configured()
        };
        assert_eq!(s.validate().unwrap_err(), ConfigError::MissingModel);

        let s = AutonomySettings {
            max_loop_iterations: 0,
            ..configured()
        };
        assert_eq!(s.validate().unwrap_err(), ConfigError::InvalidIterations);
    }

    #[test]
    fn debug_output_redacts_the_key() {
        let s = AutonomySettings {
            llm_key: ApiKey::new("sk-super-secret"),
            ..AutonomySettings::default()
        };
        let debug = format!("{s:?}");
        assert!(!debug.contains("sk-super-secret"));
        assert!(debug.contains("<redacted>"));

        let v = s.validate().unwrap();
        assert!(!format!("{v:?}").contains("sk-super-secret"));
        assert_eq!(v.api_key.expose(), "sk-super-secret");
    }
}

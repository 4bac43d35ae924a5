use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::CommandError;

pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 2.0;

/// Per-agent provider/model selection as it is cached and persisted.
///
/// There is no secret field on this type: API keys live in the
/// secret store and are only joined in by [`AgentLlmView`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentLlmConfig {
    #[serde(alias = "agent_name")]
    pub agent_name: String,
    #[serde(alias = "provider_name", alias = "provider")]
    pub provider_name: String,
    #[serde(alias = "model_name", alias = "model")]
    pub model_name: String,
    pub temperature: f32,
    #[serde(
        default,
        alias = "max_tokens",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_tokens: Option<u32>,
}

impl AgentLlmConfig {
    pub fn validate(&self) -> Result<(), CommandError> {
        if self.agent_name.trim().is_empty() {
            return Err(CommandError::invalid("agent name cannot be empty"));
        }
        if self.provider_name.trim().is_empty() {
            return Err(CommandError::invalid("provider name cannot be empty"));
        }
        if self.model_name.trim().is_empty() {
            return Err(CommandError::invalid("model name cannot be empty"));
        }
        if !self.temperature.is_finite()
            || !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&self.temperature)
        {
            return Err(CommandError::invalid(format!(
                "temperature {} is outside [{MIN_TEMPERATURE}, {MAX_TEMPERATURE}]",
                self.temperature
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(CommandError::invalid("maxTokens must be a positive integer"));
        }
        Ok(())
    }
}

/// What the UI sends when saving an agent's LLM settings. May carry a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfigUpdate {
    #[serde(alias = "provider_name", alias = "provider")]
    pub provider_name: String,
    #[serde(alias = "model_name", alias = "model")]
    pub model_name: String,
    pub temperature: f32,
    #[serde(default, alias = "max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, alias = "api_key")]
    pub api_key: Option<String>,
}

impl LlmConfigUpdate {
    /// Splits the update into the storable config and the secret, if any.
    pub fn into_parts(self, agent_name: impl Into<String>) -> (AgentLlmConfig, Option<String>) {
        let config = AgentLlmConfig {
            agent_name: agent_name.into(),
            provider_name: self.provider_name,
            model_name: self.model_name,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let api_key = self.api_key.filter(|key| !key.trim().is_empty());
        (config, api_key)
    }
}

/// Read-time merge of a cached config with the provider's key. UI only.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentLlmView {
    #[serde(flatten)]
    pub config: AgentLlmConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProviderModels {
    #[serde(default)]
    pub models: Vec<String>,
}

pub type ProviderCatalog = BTreeMap<String, ProviderModels>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmStatus {
    pub status: String,
    #[serde(default)]
    pub provider: Option<String>,
}

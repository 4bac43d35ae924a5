use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crewdesk_observability::redact_text;
use crewdesk_types::{
    AgentLlmConfig, AgentLlmView, Command, LlmConfigUpdate, LlmStatus, ModelsRequest,
    ProviderCatalog, SaveLlmConfigRequest,
};
use parking_lot::RwLock;
use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::secrets::{validate_api_key, SecretStore};

/// Last-known per-agent LLM settings.
///
/// Only identity values are cached. Keys stay in the [`SecretStore`] and are
/// joined in when a view is built.
pub struct LlmConfigCache {
    cache: RwLock<BTreeMap<String, AgentLlmConfig>>,
    secrets: Arc<dyn SecretStore>,
}

impl LlmConfigCache {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            cache: RwLock::new(BTreeMap::new()),
            secrets,
        }
    }

    pub async fn get_configs(&self, dispatcher: &Dispatcher) -> Result<Vec<AgentLlmView>> {
        self.get_configs_with_timeout(dispatcher, None).await
    }

    pub async fn get_configs_with_timeout(
        &self,
        dispatcher: &Dispatcher,
        timeout: Option<Duration>,
    ) -> Result<Vec<AgentLlmView>> {
        let data = dispatcher
            .dispatch_with_timeout(Command::GetLlmConfigs, timeout)
            .await?;
        let configs = parse_configs(data)?;
        {
            let mut cache = self.cache.write();
            cache.clear();
            for config in &configs {
                cache.insert(config.agent_name.clone(), config.clone());
            }
        }

        let mut views = Vec::with_capacity(configs.len());
        for config in configs {
            views.push(self.merge(config).await);
        }
        Ok(views)
    }

    pub async fn save_config(
        &self,
        dispatcher: &Dispatcher,
        agent_name: &str,
        update: LlmConfigUpdate,
    ) -> Result<AgentLlmView> {
        self.save_config_with_timeout(dispatcher, agent_name, update, None)
            .await
    }

    /// The cache changes only once the backend accepted the config and any
    /// new key is stored.
    pub async fn save_config_with_timeout(
        &self,
        dispatcher: &Dispatcher,
        agent_name: &str,
        update: LlmConfigUpdate,
        timeout: Option<Duration>,
    ) -> Result<AgentLlmView> {
        let (config, api_key) = update.into_parts(agent_name.trim());
        config.validate()?;
        if let Some(key) = &api_key {
            validate_api_key(key)?;
        }

        // The key never travels over the command channel.
        dispatcher
            .dispatch_with_timeout(
                Command::SaveLlmConfig(SaveLlmConfigRequest {
                    agent_name: config.agent_name.clone(),
                    config: config.clone(),
                }),
                timeout,
            )
            .await?;

        if let Some(key) = &api_key {
            self.secrets.store(&config.provider_name, key).await?;
            tracing::info!(
                provider = %config.provider_name,
                key = %redact_text(key),
                "stored provider key"
            );
        }

        self.cache
            .write()
            .insert(config.agent_name.clone(), config.clone());

        let view = match api_key {
            Some(key) => AgentLlmView {
                config,
                api_key: Some(key),
            },
            None => self.merge(config).await,
        };
        Ok(view)
    }

    pub async fn get_providers(&self, dispatcher: &Dispatcher) -> Result<ProviderCatalog> {
        let data = dispatcher.dispatch(Command::GetLlmProviders).await?;
        let data = unwrap_field(data, "providers");
        serde_json::from_value(data)
            .map_err(|e| BridgeError::Protocol(format!("get_llm_providers reply: {e}")))
    }

    pub async fn get_models(&self, dispatcher: &Dispatcher, provider: &str) -> Result<Vec<String>> {
        let data = dispatcher
            .dispatch(Command::GetLlmModels(ModelsRequest {
                provider: provider.trim().to_string(),
            }))
            .await?;
        let data = unwrap_field(data, "models");
        serde_json::from_value(data)
            .map_err(|e| BridgeError::Protocol(format!("get_llm_models reply: {e}")))
    }

    pub async fn status(&self, dispatcher: &Dispatcher) -> Result<LlmStatus> {
        let data = dispatcher.dispatch(Command::GetLlmStatus).await?;
        serde_json::from_value(data)
            .map_err(|e| BridgeError::Protocol(format!("get_llm_status reply: {e}")))
    }

    pub fn cached(&self, agent_name: &str) -> Option<AgentLlmConfig> {
        self.cache.read().get(agent_name).cloned()
    }

    pub async fn delete_api_key(&self, provider: &str) -> Result<bool> {
        self.secrets.delete(provider).await
    }

    pub async fn configured_providers(&self) -> Result<Vec<String>> {
        self.secrets.list().await
    }

    /// A failing lookup only costs this entry its key.
    async fn merge(&self, config: AgentLlmConfig) -> AgentLlmView {
        let api_key = match self.secrets.get(&config.provider_name).await {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(
                    agent = %config.agent_name,
                    provider = %config.provider_name,
                    "secret lookup failed: {}",
                    err
                );
                None
            }
        };
        AgentLlmView { config, api_key }
    }
}

/// Accepts a list of configs, `{agent: config}`, or either wrapped in
/// `{configs: ...}`. Map keys fill in a missing agent name.
fn parse_configs(data: Value) -> Result<Vec<AgentLlmConfig>> {
    let data = unwrap_field(data, "configs");
    let protocol =
        |e: serde_json::Error| BridgeError::Protocol(format!("get_llm_configs reply: {e}"));
    match data {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => serde_json::from_value(Value::Array(items)).map_err(protocol),
        Value::Object(map) => {
            let mut configs = Vec::with_capacity(map.len());
            for (agent, mut raw) in map {
                if let Value::Object(obj) = &mut raw {
                    if !obj.contains_key("agentName") && !obj.contains_key("agent_name") {
                        obj.insert("agentName".to_string(), Value::String(agent));
                    }
                }
                configs.push(serde_json::from_value(raw).map_err(protocol)?);
            }
            Ok(configs)
        }
        other => Err(BridgeError::Protocol(format!(
            "get_llm_configs reply is not a list or map: {other}"
        ))),
    }
}

fn unwrap_field(data: Value, field: &str) -> Value {
    match data {
        Value::Object(mut obj) if obj.len() == 1 && obj.contains_key(field) => {
            obj.remove(field).unwrap_or(Value::Null)
        }
        other => other,
    }
}

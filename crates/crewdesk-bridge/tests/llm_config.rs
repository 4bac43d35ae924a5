mod support;

use std::sync::Arc;

use async_trait::async_trait;
use crewdesk_bridge::{BridgeError, BridgeSession, Result, SecretStore};
use crewdesk_types::LlmConfigUpdate;
use serde_json::json;
use support::{connected_session, test_config, Reply, ScriptedBackend};

/// Reads fine, refuses every write.
struct ReadOnlyStore;

#[async_trait]
impl SecretStore for ReadOnlyStore {
    async fn store(&self, _provider: &str, _key: &str) -> Result<()> {
        Err(BridgeError::Secret("keystore is read-only".to_string()))
    }

    async fn get(&self, _provider: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn delete(&self, _provider: &str) -> Result<bool> {
        Ok(false)
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

fn update(provider: &str, model: &str, temperature: f32, api_key: Option<&str>) -> LlmConfigUpdate {
    LlmConfigUpdate {
        provider_name: provider.to_string(),
        model_name: model.to_string(),
        temperature,
        max_tokens: None,
        api_key: api_key.map(str::to_string),
    }
}

#[tokio::test]
async fn saved_config_merges_stored_key_without_sending_it() {
    let backend = ScriptedBackend::new();
    backend.respond_with(|ty, _| match ty {
        "get_llm_configs" => Reply::Success(json!([{
            "agentName": "code_agent",
            "providerName": "openai",
            "modelName": "gpt-4",
            "temperature": 0.7
        }])),
        _ => Reply::Success(json!({"saved": true})),
    });
    let (session, secrets) = connected_session(&backend).await;
    secrets.store("openai", "sk-test").await.unwrap();

    let view = session
        .save_llm_config("code_agent", update("openai", "gpt-4", 0.7, None))
        .await
        .unwrap();

    assert_eq!(view.config.agent_name, "code_agent");
    assert_eq!(view.config.model_name, "gpt-4");
    assert_eq!(view.api_key.as_deref(), Some("sk-test"));

    let cached = session.cached_llm_config("code_agent").unwrap();
    assert_eq!(cached.provider_name, "openai");
    assert!(!serde_json::to_string(&cached).unwrap().contains("sk-test"));

    let sent = backend.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["type"], "save_llm_config");
    assert_eq!(sent[0]["payload"]["agentName"], "code_agent");
    assert_eq!(sent[0]["payload"]["config"]["providerName"], "openai");
    assert!(!backend.sent_raw().contains("sk-test"));

    let views = session.get_llm_configs().await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].config.agent_name, "code_agent");
    assert_eq!(views[0].api_key.as_deref(), Some("sk-test"));
    assert!(!serde_json::to_string(&session.cached_llm_config("code_agent"))
        .unwrap()
        .contains("sk-test"));
}

#[tokio::test]
async fn generic_save_stores_new_key_locally() {
    let backend = ScriptedBackend::new();
    let (session, secrets) = connected_session(&backend).await;

    let reply = session
        .dispatch(
            "save_llm_config",
            json!({
                "agentName": "planner",
                "config": {
                    "providerName": "Anthropic",
                    "modelName": "claude-3-5-sonnet",
                    "temperature": 0.2,
                    "apiKey": "sk-ant-secret"
                }
            }),
        )
        .await
        .unwrap();

    assert_eq!(reply["agentName"], "planner");
    assert_eq!(reply["apiKey"], "sk-ant-secret");
    assert_eq!(
        secrets.get("anthropic").await.unwrap().as_deref(),
        Some("sk-ant-secret")
    );
    assert!(!backend.sent_raw().contains("sk-ant-secret"));
    assert_eq!(session.configured_providers().await.unwrap(), vec!["anthropic"]);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_sending() {
    let backend = ScriptedBackend::new();
    let (session, secrets) = connected_session(&backend).await;

    let hot = session
        .save_llm_config("code_agent", update("openai", "gpt-4", 3.5, Some("sk-test")))
        .await
        .unwrap_err();
    assert_eq!(hot.kind(), "validation");

    let blank_model = session
        .save_llm_config("code_agent", update("openai", " ", 0.5, None))
        .await
        .unwrap_err();
    assert_eq!(blank_model.kind(), "validation");

    let spaced_key = session
        .save_llm_config("code_agent", update("openai", "gpt-4", 0.5, Some("sk test")))
        .await
        .unwrap_err();
    assert_eq!(spaced_key.kind(), "secret");

    assert!(backend.sent().is_empty());
    assert!(secrets.list().await.unwrap().is_empty());
    assert!(session.cached_llm_config("code_agent").is_none());
}

#[tokio::test]
async fn backend_rejection_leaves_cache_and_store_untouched() {
    let backend = ScriptedBackend::new();
    backend.respond_with(|_, _| Reply::Error("unknown agent".to_string()));
    let (session, secrets) = connected_session(&backend).await;

    let err = session
        .save_llm_config("ghost_agent", update("openai", "gpt-4", 0.7, Some("sk-new")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "backend");
    assert!(session.cached_llm_config("ghost_agent").is_none());
    assert!(secrets.get("openai").await.unwrap().is_none());
}

#[tokio::test]
async fn fetched_configs_are_cached_and_merged() {
    let backend = ScriptedBackend::new();
    backend.respond_with(|ty, _| match ty {
        "get_llm_configs" => Reply::Success(json!({
            "configs": {
                "code_agent": {"provider": "openai", "model": "gpt-4", "temperature": 0.7},
                "planner": {
                    "providerName": "anthropic",
                    "modelName": "claude-3-5-sonnet",
                    "temperature": 0.2,
                    "maxTokens": 4096
                }
            }
        })),
        _ => Reply::Success(json!({})),
    });
    let (session, secrets) = connected_session(&backend).await;
    secrets.store("openai", "sk-test").await.unwrap();

    let views = session.get_llm_configs().await.unwrap();
    assert_eq!(views.len(), 2);
    let code = views
        .iter()
        .find(|v| v.config.agent_name == "code_agent")
        .unwrap();
    assert_eq!(code.api_key.as_deref(), Some("sk-test"));
    let planner = views
        .iter()
        .find(|v| v.config.agent_name == "planner")
        .unwrap();
    assert_eq!(planner.api_key, None);
    assert_eq!(planner.config.max_tokens, Some(4096));

    assert_eq!(
        session.cached_llm_config("planner").unwrap().model_name,
        "claude-3-5-sonnet"
    );
}

#[tokio::test]
async fn providers_and_models_are_forwarded() {
    let backend = ScriptedBackend::new();
    backend.respond_with(|ty, payload| match ty {
        "get_llm_providers" => Reply::Success(json!({
            "providers": {
                "openai": {"models": ["gpt-4", "gpt-4o"]},
                "anthropic": {"models": ["claude-3-5-sonnet"]}
            }
        })),
        "get_llm_models" if payload["provider"] == "openai" => {
            Reply::Success(json!({"models": ["gpt-4", "gpt-4o"]}))
        }
        "get_llm_status" => Reply::Success(json!({"status": "ready", "provider": "openai"})),
        _ => Reply::Error("unknown provider".to_string()),
    });
    let (session, _) = connected_session(&backend).await;

    let providers = session.get_llm_providers().await.unwrap();
    assert_eq!(providers.len(), 2);
    assert_eq!(providers["anthropic"].models, vec!["claude-3-5-sonnet"]);

    let models = session.get_llm_models(" openai ").await.unwrap();
    assert_eq!(models, vec!["gpt-4", "gpt-4o"]);

    let status = session.get_llm_status().await.unwrap();
    assert_eq!(status.status, "ready");

    let err = session.get_llm_models("mistral").await.unwrap_err();
    assert_eq!(err.kind(), "backend");
}

#[tokio::test]
async fn deleting_a_key_drops_it_from_views() {
    let backend = ScriptedBackend::new();
    let (session, _) = connected_session(&backend).await;

    session
        .save_llm_config("code_agent", update("openai", "gpt-4", 0.7, Some("sk-test")))
        .await
        .unwrap();
    assert!(session.delete_api_key("OpenAI").await.unwrap());

    let view = session
        .save_llm_config("code_agent", update("openai", "gpt-4o", 0.7, None))
        .await
        .unwrap();
    assert_eq!(view.api_key, None);
}

#[tokio::test]
async fn failed_key_store_leaves_cache_untouched() {
    let backend = ScriptedBackend::new();
    let session =
        BridgeSession::new(test_config(), backend.transport(), Arc::new(ReadOnlyStore)).unwrap();
    session.connect().await.unwrap();

    let err = session
        .save_llm_config("code_agent", update("openai", "gpt-4", 0.7, Some("sk-test")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "secret");
    assert!(session.cached_llm_config("code_agent").is_none());

    let view = session
        .save_llm_config("code_agent", update("openai", "gpt-4", 0.7, None))
        .await
        .unwrap();
    assert_eq!(view.api_key, None);
    assert_eq!(session.cached_llm_config("code_agent").unwrap().model_name, "gpt-4");
}

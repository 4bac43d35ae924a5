mod support;

use std::time::Duration;

use crewdesk_bridge::BridgeError;
use crewdesk_types::{Command, CommandType, Mode};
use serde_json::json;
use support::{connected_session, wait_for, Reply, ScriptedBackend};

#[tokio::test]
async fn implement_code_in_plan_mode_is_refused_before_sending() {
    let backend = ScriptedBackend::new();
    let (session, _) = connected_session(&backend).await;

    let err = session
        .dispatch("implement_code", json!({"task": "add a login form"}))
        .await
        .unwrap_err();

    match &err {
        BridgeError::ModeForbidden {
            command_type, mode, ..
        } => {
            assert_eq!(*command_type, CommandType::ImplementCode);
            assert_eq!(*mode, Mode::Plan);
        }
        other => panic!("expected ModeForbidden, got {other:?}"),
    }
    assert!(err.recoverable());
    assert!(backend.sent().is_empty());
    assert_eq!(session.registry_stats().issued, 0);
}

#[tokio::test]
async fn execution_and_mutating_tools_are_refused_in_plan_mode() {
    let backend = ScriptedBackend::new();
    let (session, _) = connected_session(&backend).await;

    let exec = session
        .dispatch("execute_command", json!({"command": "cargo build"}))
        .await
        .unwrap_err();
    assert_eq!(exec.kind(), "mode_forbidden");

    let write = session
        .dispatch(
            "run_tool",
            json!({"tool": "create_file", "params": {"path": "a.txt", "content": "x"}}),
        )
        .await
        .unwrap_err();
    assert_eq!(write.kind(), "mode_forbidden");
    assert!(backend.sent().is_empty());

    let read = session
        .dispatch("run_tool", json!({"tool": "read_file", "params": {"path": "a.txt"}}))
        .await
        .unwrap();
    assert_eq!(read, json!({"ok": true}));
    assert_eq!(backend.sent_types(), vec!["run_tool"]);
}

#[tokio::test]
async fn act_mode_sends_correlated_frames() {
    let backend = ScriptedBackend::new();
    let (session, _) = connected_session(&backend).await;
    session.switch_mode(Mode::Act).await.unwrap();

    session
        .dispatch("implement_code", json!({"task": "add a login form"}))
        .await
        .unwrap();

    let sent = backend.sent();
    assert_eq!(sent.len(), 2);
    let frame = &sent[1];
    assert_eq!(frame["type"], "implement_code");
    assert_eq!(frame["payload"]["task"], "add a login form");
    assert!(frame["correlationId"].as_str().is_some_and(|id| !id.is_empty()));
    assert_ne!(sent[0]["correlationId"], sent[1]["correlationId"]);
}

#[tokio::test]
async fn unknown_and_malformed_commands_fail_validation() {
    let backend = ScriptedBackend::new();
    let (session, _) = connected_session(&backend).await;

    let unknown = session.dispatch("format_disk", json!({})).await.unwrap_err();
    assert_eq!(unknown.kind(), "validation");

    let empty_task = session
        .dispatch("submit_task", json!({"task": "   "}))
        .await
        .unwrap_err();
    assert_eq!(empty_task.kind(), "validation");

    let wrong_shape = session
        .dispatch("get_llm_models", json!({"provider": 42}))
        .await
        .unwrap_err();
    assert_eq!(wrong_shape.kind(), "validation");
    assert!(!wrong_shape.recoverable());

    assert!(backend.sent().is_empty());
}

#[tokio::test]
async fn silent_backend_times_out_and_leaves_no_pending_entry() {
    let backend = ScriptedBackend::silent();
    let (session, _) = connected_session(&backend).await;

    let err = session
        .execute_with_timeout(Command::GetMode, Duration::from_millis(100))
        .await
        .unwrap_err();

    match err {
        BridgeError::Timeout {
            command_type,
            timeout_ms,
        } => {
            assert_eq!(command_type, CommandType::GetMode);
            assert_eq!(timeout_ms, 100);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    let stats = session.registry_stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(backend.sent_types(), vec!["get_mode"]);
}

#[tokio::test]
async fn late_response_after_timeout_is_dropped() {
    let backend = ScriptedBackend::new();
    backend.hold_replies();
    let (session, _) = connected_session(&backend).await;

    let err = session
        .execute_with_timeout(Command::GetLlmStatus, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");

    assert_eq!(backend.release_held_reversed(), 1);
    assert!(wait_for(|| session.registry_stats().dropped_unknown == 1).await);
    assert_eq!(session.registry_stats().live, 0);
}

#[tokio::test]
async fn out_of_order_responses_reach_their_callers() {
    let backend = ScriptedBackend::new();
    backend.respond_with(|_, payload| Reply::Success(payload["params"].clone()));
    backend.hold_replies();
    let (session, _) = connected_session(&backend).await;

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .dispatch("run_tool", json!({"tool": "read_file", "params": {"path": "first.rs"}}))
                .await
        })
    };
    let second = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .dispatch("run_tool", json!({"tool": "list_files", "params": {"path": "src"}}))
                .await
        })
    };

    assert!(wait_for(|| backend.sent().len() == 2).await);
    assert_eq!(backend.release_held_reversed(), 2);

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first, json!({"path": "first.rs"}));
    assert_eq!(second, json!({"path": "src"}));
    assert_eq!(session.registry_stats().live, 0);
}

#[tokio::test]
async fn backend_errors_are_reported_with_their_message() {
    let backend = ScriptedBackend::new();
    backend.respond_with(|ty, _| match ty {
        "submit_task" => Reply::Error("planner is busy".to_string()),
        _ => Reply::Success(json!({})),
    });
    let (session, _) = connected_session(&backend).await;

    let err = session
        .dispatch("submit_task", json!({"task": "summarize the repo"}))
        .await
        .unwrap_err();
    match &err {
        BridgeError::Backend {
            command_type,
            message,
        } => {
            assert_eq!(*command_type, CommandType::SubmitTask);
            assert_eq!(message, "planner is busy");
        }
        other => panic!("expected Backend, got {other:?}"),
    }
    assert!(err.recoverable());
}

#[tokio::test]
async fn dispatch_connects_on_demand() {
    let backend = ScriptedBackend::new();
    let (session, _) = support::session_with(&backend, support::test_config());

    let data = session
        .dispatch("submit_task", json!({"task": "plan the sprint"}))
        .await
        .unwrap();
    assert_eq!(data, json!({"ok": true}));
    assert_eq!(backend.opens(), 1);
    assert_eq!(session.connection_snapshot().generation, 1);
}

#[tokio::test]
async fn malformed_response_fails_only_its_request() {
    let backend = ScriptedBackend::silent();
    let (session, _) = connected_session(&backend).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.execute(Command::GetLlmStatus).await })
    };
    assert!(wait_for(|| backend.sent().len() == 1).await);
    let id = backend.sent()[0]["correlationId"]
        .as_str()
        .unwrap()
        .to_string();

    backend.push_raw(&format!(r#"{{"correlationId":"{id}","status":"maybe"}}"#));

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "protocol");
    assert_eq!(session.registry_stats().live, 0);
}

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::{AgentLlmConfig, CapabilityNeeds, EventQuery, Mode, ModeSet};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command type: {0}")]
    UnknownType(String),
    #[error("invalid payload for {command_type}: {reason}")]
    InvalidPayload {
        command_type: CommandType,
        reason: String,
    },
    #[error("{0}")]
    Invalid(String),
}

impl CommandError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SubmitTask,
    ImplementCode,
    RunTool,
    ExecuteCommand,
    GetMode,
    SwitchMode,
    GetEvents,
    ClearLogs,
    GetLlmConfigs,
    GetLlmProviders,
    GetLlmModels,
    SaveLlmConfig,
    GetLlmStatus,
}

impl CommandType {
    pub const ALL: [CommandType; 13] = [
        CommandType::SubmitTask,
        CommandType::ImplementCode,
        CommandType::RunTool,
        CommandType::ExecuteCommand,
        CommandType::GetMode,
        CommandType::SwitchMode,
        CommandType::GetEvents,
        CommandType::ClearLogs,
        CommandType::GetLlmConfigs,
        CommandType::GetLlmProviders,
        CommandType::GetLlmModels,
        CommandType::SaveLlmConfig,
        CommandType::GetLlmStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::SubmitTask => "submit_task",
            CommandType::ImplementCode => "implement_code",
            CommandType::RunTool => "run_tool",
            CommandType::ExecuteCommand => "execute_command",
            CommandType::GetMode => "get_mode",
            CommandType::SwitchMode => "switch_mode",
            CommandType::GetEvents => "get_events",
            CommandType::ClearLogs => "clear_logs",
            CommandType::GetLlmConfigs => "get_llm_configs",
            CommandType::GetLlmProviders => "get_llm_providers",
            CommandType::GetLlmModels => "get_llm_models",
            CommandType::SaveLlmConfig => "save_llm_config",
            CommandType::GetLlmStatus => "get_llm_status",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        CommandType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == wanted)
            .ok_or_else(|| CommandError::UnknownType(wanted.to_string()))
    }
}

/// File tools the backend exposes through `run_tool`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileTool {
    ReadFile,
    ListFiles,
    GetFileInfo,
    CreateFile,
    DeleteFile,
    RenameFile,
    CopyFile,
    CreateDirectory,
}

impl FileTool {
    pub fn mutates(self) -> bool {
        !matches!(
            self,
            FileTool::ReadFile | FileTool::ListFiles | FileTool::GetFileInfo
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRequest {
    pub tool: FileTool,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeRequest {
    pub mode: Mode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelsRequest {
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SaveLlmConfigRequest {
    #[serde(alias = "agent_name")]
    pub agent_name: String,
    pub config: AgentLlmConfig,
}

/// Closed set of commands the bridge can send to the backend.
///
/// Serializes adjacently tagged as `{"type": ..., "payload": ...}`; unit
/// variants omit the payload, [`Command::to_wire`] fills it in.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Command {
    SubmitTask(TaskRequest),
    ImplementCode(TaskRequest),
    RunTool(ToolRequest),
    ExecuteCommand(ExecRequest),
    GetMode,
    SwitchMode(ModeRequest),
    GetEvents(EventQuery),
    ClearLogs,
    GetLlmConfigs,
    GetLlmProviders,
    GetLlmModels(ModelsRequest),
    SaveLlmConfig(SaveLlmConfigRequest),
    GetLlmStatus,
}

impl Command {
    /// Builds a command from the untyped `(type, payload)` pair the UI sends.
    pub fn from_parts(command_type: &str, payload: Value) -> Result<Self, CommandError> {
        let ty: CommandType = command_type.parse()?;
        let command = match ty {
            CommandType::SubmitTask => Command::SubmitTask(payload_as(ty, payload)?),
            CommandType::ImplementCode => Command::ImplementCode(payload_as(ty, payload)?),
            CommandType::RunTool => Command::RunTool(payload_as(ty, payload)?),
            CommandType::ExecuteCommand => Command::ExecuteCommand(payload_as(ty, payload)?),
            CommandType::GetMode => Command::GetMode,
            CommandType::SwitchMode => Command::SwitchMode(payload_as(ty, payload)?),
            CommandType::GetEvents => Command::GetEvents(payload_as(ty, payload)?),
            CommandType::ClearLogs => Command::ClearLogs,
            CommandType::GetLlmConfigs => Command::GetLlmConfigs,
            CommandType::GetLlmProviders => Command::GetLlmProviders,
            CommandType::GetLlmModels => Command::GetLlmModels(payload_as(ty, payload)?),
            CommandType::SaveLlmConfig => Command::SaveLlmConfig(payload_as(ty, payload)?),
            CommandType::GetLlmStatus => Command::GetLlmStatus,
        };
        command.validate()?;
        Ok(command)
    }

    pub fn switch_mode(mode: Mode) -> Self {
        Command::SwitchMode(ModeRequest { mode })
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            Command::SubmitTask(_) => CommandType::SubmitTask,
            Command::ImplementCode(_) => CommandType::ImplementCode,
            Command::RunTool(_) => CommandType::RunTool,
            Command::ExecuteCommand(_) => CommandType::ExecuteCommand,
            Command::GetMode => CommandType::GetMode,
            Command::SwitchMode(_) => CommandType::SwitchMode,
            Command::GetEvents(_) => CommandType::GetEvents,
            Command::ClearLogs => CommandType::ClearLogs,
            Command::GetLlmConfigs => CommandType::GetLlmConfigs,
            Command::GetLlmProviders => CommandType::GetLlmProviders,
            Command::GetLlmModels(_) => CommandType::GetLlmModels,
            Command::SaveLlmConfig(_) => CommandType::SaveLlmConfig,
            Command::GetLlmStatus => CommandType::GetLlmStatus,
        }
    }

    pub fn capability_needs(&self) -> CapabilityNeeds {
        match self {
            Command::ImplementCode(_) => CapabilityNeeds {
                file_operations: true,
                execution: false,
            },
            Command::RunTool(req) if req.tool.mutates() => CapabilityNeeds {
                file_operations: true,
                execution: false,
            },
            Command::ExecuteCommand(_) => CapabilityNeeds {
                file_operations: false,
                execution: true,
            },
            _ => CapabilityNeeds::NONE,
        }
    }

    /// Modes in which this command may be dispatched.
    pub fn required_modes(&self) -> ModeSet {
        self.capability_needs().permitted_modes()
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        let ty = self.command_type();
        match self {
            Command::SubmitTask(req) | Command::ImplementCode(req) => {
                if req.task.trim().is_empty() {
                    return Err(invalid_payload(ty, "task cannot be empty"));
                }
            }
            Command::ExecuteCommand(req) => {
                if req.command.trim().is_empty() {
                    return Err(invalid_payload(ty, "command cannot be empty"));
                }
            }
            Command::GetLlmModels(req) => {
                if req.provider.trim().is_empty() {
                    return Err(invalid_payload(ty, "provider cannot be empty"));
                }
            }
            Command::GetEvents(query) => {
                if query.limit == Some(0) {
                    return Err(invalid_payload(ty, "limit must be positive"));
                }
            }
            Command::SaveLlmConfig(req) => {
                req.config.validate()?;
                if req.agent_name != req.config.agent_name {
                    return Err(invalid_payload(
                        ty,
                        format!(
                            "agent name {} does not match config agent {}",
                            req.agent_name, req.config.agent_name
                        ),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Outbound frame: `{type, correlationId, payload}`.
    pub fn to_wire(&self, correlation_id: &str) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "correlationId".to_string(),
                Value::String(correlation_id.to_string()),
            );
            obj.entry("payload")
                .or_insert_with(|| Value::Object(Map::new()));
        }
        Ok(value)
    }
}

fn payload_as<T: DeserializeOwned>(ty: CommandType, payload: Value) -> Result<T, CommandError> {
    let payload = if payload.is_null() {
        Value::Object(Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|err| invalid_payload(ty, err.to_string()))
}

fn invalid_payload(command_type: CommandType, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidPayload {
        command_type,
        reason: reason.into(),
    }
}

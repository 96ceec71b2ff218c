//! IPC protocol definitions (JSON messages)

use crate::manager::{ManagerEvent, ManagerStatus};
use crate::power::PowerBehaviour;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    ListProcesses,
    ListRules,
    GetStatus,
    HastenScan,
    FreeMemory {
        #[serde(default)]
        params: FreeMemoryParams,
    },
    IgnorePid { params: PidParams },
    UnignorePid { params: PidParams },
    ForegroundChanged { params: ForegroundParams },
    PowerBehaviour { params: PowerBehaviourParams },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FreeMemoryParams {
    pub ignore_pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidParams {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForegroundParams {
    pub pid: u32,
    #[serde(default)]
    pub fullscreen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerBehaviourParams {
    pub behaviour: PowerBehaviour,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Response { id: Option<String>, data: serde_json::Value },
    Event { data: ManagerEvent },
    Status { data: ManagerStatus },
}

impl Response {
    pub fn data(data: serde_json::Value) -> Self {
        Response::Response { id: None, data }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::data(serde_json::json!({ "error": message.to_string() }))
    }

    pub fn success(success: bool) -> Self {
        Self::data(serde_json::json!({ "success": success }))
    }
}

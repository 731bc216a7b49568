//! Typed views over `task_data`.
//!
//! The queue stores payloads as opaque JSON. Each known task type has a schema
//! here; anything else (or a known type whose data does not fit its schema)
//! decodes to [`TaskPayload::Opaque`] so nothing is ever lost.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const DEPLOY: &str = "deploy";
pub const AGENT: &str = "agent";
pub const CRON: &str = "cron";
pub const GIT_SYNC: &str = "git_sync";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployTask {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronTask {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSyncTask {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    Deploy(DeployTask),
    Agent(AgentTask),
    Cron(CronTask),
    GitSync(GitSyncTask),
    Opaque { task_type: String, data: Value },
}

impl TaskPayload {
    pub fn decode(task_type: &str, data: &Value) -> Self {
        let typed = match task_type {
            DEPLOY => serde_json::from_value(data.clone()).ok().map(TaskPayload::Deploy),
            AGENT => serde_json::from_value(data.clone()).ok().map(TaskPayload::Agent),
            CRON => serde_json::from_value(data.clone()).ok().map(TaskPayload::Cron),
            GIT_SYNC => serde_json::from_value(data.clone())
                .ok()
                .map(TaskPayload::GitSync),
            _ => None,
        };
        typed.unwrap_or_else(|| TaskPayload::Opaque {
            task_type: task_type.to_string(),
            data: data.clone(),
        })
    }

    /// Project the task runs against, used to attribute metrics.
    pub fn project_name(&self) -> Option<&str> {
        let name = match self {
            TaskPayload::Deploy(task) => Some(task.project.as_str()),
            TaskPayload::Agent(task) => Some(task.project.as_str()),
            TaskPayload::Cron(task) => task.project.as_deref(),
            TaskPayload::GitSync(task) => Some(task.project.as_str()),
            TaskPayload::Opaque { data, .. } => data
                .get("project")
                .or_else(|| data.get("projectName"))
                .and_then(Value::as_str),
        };
        name.filter(|name| !name.trim().is_empty())
    }
}

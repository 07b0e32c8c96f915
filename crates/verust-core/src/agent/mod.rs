//! AI agent backends.
//!
//! An agent analyses a cloned workspace with a prompt and returns raw
//! output (from which findings are parsed). Adapters are object-safe and
//! live in a name-keyed registry; the rule's agent preference list picks
//! one at dispatch, with failover to the next on transport errors.

pub mod cli;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSettings;

/// One agent invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub workspace: PathBuf,
    pub timeout: Duration,
    pub model: Option<String>,
}

/// Raw result of a successful invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub raw_output: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Invocation failure, by kind. The executor fails over to the next
/// preferred agent only on [`AgentError::Transport`]; everything else is
/// this agent's answer.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("agent exited with status {code:?}: {stderr}")]
    Failed {
        code: Option<i32>,
        stderr: String,
    },

    #[error("agent invocation cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Adapter interface for agent backends.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Logical agent name (the key used in rule configs).
    fn name(&self) -> &str;

    /// Whether this agent can run the given model.
    fn supports(&self, model: &str) -> bool;

    /// Configured per-invocation timeout for this agent.
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    /// Run the agent against a workspace. Must honour both the request
    /// timeout and the cancellation token.
    async fn invoke(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentInvocation, AgentError>;
}

// Object safety check.
const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};

/// Name-keyed collection of agent adapters.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of CLI adapters from the `agents` settings map.
    pub fn from_settings(settings: &std::collections::BTreeMap<String, AgentSettings>) -> Self {
        let mut registry = Self::new();
        for (name, agent_settings) in settings {
            registry.register(Arc::new(cli::CliAgent::new(name.clone(), agent_settings)));
        }
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.list())
            .finish()
    }
}

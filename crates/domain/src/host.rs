use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a host can do. Tasks are routed by mapping their type to a
/// capability and picking a host that advertises it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Code,
    Text,
    Reasoning,
    General,
    Ops,
    Dev,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Code => "code",
            Capability::Text => "text",
            Capability::Reasoning => "reasoning",
            Capability::General => "general",
            Capability::Ops => "ops",
            Capability::Dev => "dev",
        }
    }

    pub fn parse(s: &str) -> Option<Capability> {
        match s {
            "code" => Some(Capability::Code),
            "text" => Some(Capability::Text),
            "reasoning" => Some(Capability::Reasoning),
            "general" => Some(Capability::General),
            "ops" => Some(Capability::Ops),
            "dev" => Some(Capability::Dev),
            _ => None,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reachable endpoint (LLM runtime or executor service).
///
/// Descriptors are fixed at startup; the router tracks liveness
/// separately and the breaker tracks failure state separately.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDescriptor {
    pub name: String,
    pub url: String,
    /// Model identifier served by this host, carried in LLM requests.
    pub model: String,
    pub capabilities: Vec<Capability>,
    /// Smaller is preferred when several hosts share a capability.
    pub priority: i64,
    pub timeout: Duration,
}

impl HostDescriptor {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Per-host circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

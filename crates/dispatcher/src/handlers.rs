use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use yggdrasil_client::{CallOutput, ResilientClient};
use yggdrasil_domain::Task;
use yggdrasil_errors::{DispatchError, DispatchResult};

use crate::router::Router;

/// Clients a handler may use. Handlers hold no state of their own; all
/// shared state flows through this bundle.
pub struct HandlerContext {
    pub router: Arc<Router>,
    pub client: Arc<ResilientClient>,
}

/// Executes one task type. Handlers must be idempotent: the ledger's
/// `in_progress` gate is the only thing preventing a re-run.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, task: &Task, ctx: &HandlerContext) -> DispatchResult<CallOutput>;
}

/// Task-type prefixes dispatched to executor HTTP services rather than
/// LLM hosts.
const EXECUTOR_PREFIXES: [&str; 10] = [
    "dev-", "code-", "git-", "llm-", "ollama-", "ops-", "power-", "monitor-", "network-", "plan-",
];

/// Maps task types to handlers. Exact registrations win over prefix
/// families; anything else lands on the general LLM handler.
pub struct HandlerRegistry {
    exact: HashMap<String, Arc<dyn TaskHandler>>,
    prefixes: Vec<(&'static str, Arc<dyn TaskHandler>)>,
    fallback: Arc<dyn TaskHandler>,
}

impl HandlerRegistry {
    /// Registry with the built-in LLM handler set and executor-dispatch
    /// prefix families. Registration happens here, once, at startup.
    pub fn builtin() -> Self {
        let mut exact: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
        for task_type in [
            "code-generation",
            "text-processing",
            "reasoning",
            "summarize",
            "general",
        ] {
            exact.insert(task_type.to_string(), Arc::new(LlmHandler { task_type }) as _);
        }

        let executor: Arc<dyn TaskHandler> = Arc::new(ExecutorDispatchHandler);
        let prefixes = EXECUTOR_PREFIXES
            .iter()
            .map(|p| (*p, Arc::clone(&executor)))
            .collect();

        Self {
            exact,
            prefixes,
            fallback: Arc::new(LlmHandler {
                task_type: "general",
            }),
        }
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.exact.insert(task_type.into(), handler);
    }

    pub fn resolve(&self, task_type: &str) -> Arc<dyn TaskHandler> {
        if let Some(handler) = self.exact.get(task_type) {
            return Arc::clone(handler);
        }
        for (prefix, handler) in &self.prefixes {
            if task_type.starts_with(prefix) {
                return Arc::clone(handler);
            }
        }
        Arc::clone(&self.fallback)
    }
}

/// Builds a prompt from the task payload and runs it through the
/// resilient client against the router's candidate chain.
struct LlmHandler {
    task_type: &'static str,
}

impl LlmHandler {
    fn prompt(&self, task: &Task) -> String {
        match self.task_type {
            "code-generation" => format!(
                "Generate code for the following task:\n\n\
                 Title: {}\n\
                 Description: {}\n\n\
                 Provide complete, working code with comments. Include any necessary imports.",
                task.title, task.description
            ),
            "text-processing" => task.description.clone(),
            "summarize" => format!("Please summarize the following:\n\n{}", task.description),
            "reasoning" => format!(
                "Task: {}\n\n{}\n\nPlease analyze this thoroughly and provide clear reasoning.",
                task.title, task.description
            ),
            _ => format!(
                "Task: {}\n\n{}\n\nPlease complete this task and provide a clear response.",
                task.title, task.description
            ),
        }
    }
}

#[async_trait]
impl TaskHandler for LlmHandler {
    fn name(&self) -> &str {
        self.task_type
    }

    async fn execute(&self, task: &Task, ctx: &HandlerContext) -> DispatchResult<CallOutput> {
        let candidates = ctx.router.candidates(task);
        if candidates.is_empty() {
            return Err(DispatchError::AllHostsUnavailable {
                task_type: task.effective_type().to_string(),
            });
        }
        let prompt = self.prompt(task);
        ctx.client
            .chat(&task.id, task.effective_type(), &candidates, &prompt)
            .await
    }
}

/// Forwards the task payload to the executor service the router picks;
/// the executor's JSON response `output` is surfaced verbatim.
struct ExecutorDispatchHandler;

#[async_trait]
impl TaskHandler for ExecutorDispatchHandler {
    fn name(&self) -> &str {
        "executor-dispatch"
    }

    async fn execute(&self, task: &Task, ctx: &HandlerContext) -> DispatchResult<CallOutput> {
        let candidates = ctx.router.candidates(task);
        if candidates.is_empty() {
            return Err(DispatchError::AllHostsUnavailable {
                task_type: task.effective_type().to_string(),
            });
        }

        let mut params = match &task.params {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => json!({}),
            other => json!({ "value": other }),
        };
        // Code executors expect the work item under `spec`.
        if task.effective_type().starts_with("code-") {
            if let Some(map) = params.as_object_mut() {
                if !map.contains_key("spec") {
                    let spec = if task.description.is_empty() {
                        task.title.clone()
                    } else {
                        task.description.clone()
                    };
                    map.insert("spec".to_string(), Value::String(spec));
                }
            }
        }

        ctx.client
            .dispatch_to_executor(&task.id, task.effective_type(), &candidates, &params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_type_wins_over_prefix_family() {
        let registry = HandlerRegistry::builtin();
        // "code-generation" matches the "code-" prefix but is an LLM type.
        assert_eq!(registry.resolve("code-generation").name(), "code-generation");
        assert_eq!(registry.resolve("code-test").name(), "executor-dispatch");
    }

    #[test]
    fn executor_prefixes_resolve_to_dispatch_handler() {
        let registry = HandlerRegistry::builtin();
        for task_type in [
            "dev-deploy",
            "git-sync",
            "ops-restart",
            "power-cycle",
            "monitor-disk",
            "network-scan",
            "plan-sprint",
            "llm-pull",
            "ollama-pull",
        ] {
            assert_eq!(registry.resolve(task_type).name(), "executor-dispatch");
        }
    }

    #[test]
    fn unknown_type_falls_back_to_general() {
        let registry = HandlerRegistry::builtin();
        assert_eq!(registry.resolve("interpretive-dance").name(), "general");
    }

    #[test]
    fn custom_registration_overrides_builtin() {
        struct Nop;
        #[async_trait]
        impl TaskHandler for Nop {
            fn name(&self) -> &str {
                "nop"
            }
            async fn execute(
                &self,
                _task: &Task,
                _ctx: &HandlerContext,
            ) -> DispatchResult<CallOutput> {
                unimplemented!("test stub")
            }
        }

        let mut registry = HandlerRegistry::builtin();
        registry.register("summarize", Arc::new(Nop));
        assert_eq!(registry.resolve("summarize").name(), "nop");
    }

    #[test]
    fn llm_prompts_embed_title_and_description() {
        let task = Task::new("t1", "Refactor parser")
            .with_description("Split the tokenizer out of parse().");

        let gen = LlmHandler {
            task_type: "code-generation",
        };
        let prompt = gen.prompt(&task);
        assert!(prompt.contains("Refactor parser"));
        assert!(prompt.contains("Split the tokenizer"));

        let text = LlmHandler {
            task_type: "text-processing",
        };
        assert_eq!(text.prompt(&task), "Split the tokenizer out of parse().");

        let summarize = LlmHandler {
            task_type: "summarize",
        };
        assert!(summarize.prompt(&task).starts_with("Please summarize"));
    }
}

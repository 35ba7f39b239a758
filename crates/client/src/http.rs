use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use yggdrasil_errors::{DispatchError, DispatchResult};

/// Output of one successful outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput {
    pub output: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Call attempts consumed across the candidate chain, including the
    /// successful one. Filled in by the resilient client.
    pub attempts: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    task_id: &'a str,
    #[serde(rename = "type")]
    task_type: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    #[allow(dead_code)]
    duration_seconds: f64,
}

/// OpenAI-style chat completion against a local or cloud endpoint.
/// `bearer` carries the cloud credential; local runtimes ignore auth.
pub(crate) async fn call_chat(
    http: &reqwest::Client,
    base_url: &str,
    model: &str,
    prompt: &str,
    timeout: Duration,
    bearer: Option<&str>,
) -> DispatchResult<CallOutput> {
    let url = chat_url(base_url);
    let body = ChatCompletionRequest {
        model,
        messages: vec![ChatMessage {
            role: "user",
            content: prompt,
        }],
        temperature: 0.7,
        stream: false,
    };

    let mut request = http.post(&url).json(&body).timeout(timeout);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| classify_transport(&url, e))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| classify_transport(&url, e))?;

    if !status.is_success() {
        return Err(classify_status(status.as_u16(), &text));
    }

    let parsed: ChatCompletionResponse = serde_json::from_str(&text)
        .map_err(|e| DispatchError::InvalidPayload(format!("chat response decode: {e}")))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| DispatchError::InvalidPayload("chat response has no choices".into()))?;
    let usage = parsed.usage.unwrap_or_default();

    Ok(CallOutput {
        output: content,
        tokens_in: usage.prompt_tokens,
        tokens_out: usage.completion_tokens,
        attempts: 1,
    })
}

/// POST the task payload to an executor's `/execute` endpoint. The
/// executor's own `failed`/`error` statuses are terminal handler errors,
/// not transport failures.
pub(crate) async fn call_executor(
    http: &reqwest::Client,
    base_url: &str,
    task_id: &str,
    task_type: &str,
    params: &Value,
    timeout: Duration,
) -> DispatchResult<CallOutput> {
    let url = format!("{}/execute", base_url.trim_end_matches('/'));
    let body = ExecuteRequest {
        task_id,
        task_type,
        params,
    };

    let response = http
        .post(&url)
        .json(&body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_transport(&url, e))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| classify_transport(&url, e))?;

    if !status.is_success() {
        return Err(classify_status(status.as_u16(), &text));
    }

    let parsed: ExecuteResponse = serde_json::from_str(&text)
        .map_err(|e| DispatchError::InvalidPayload(format!("executor response decode: {e}")))?;

    match parsed.status.as_str() {
        "completed" => Ok(CallOutput {
            output: parsed.output,
            tokens_in: 0,
            tokens_out: 0,
            attempts: 1,
        }),
        other => Err(DispatchError::Internal(format!(
            "executor reported {other}: {}",
            parsed.output
        ))),
    }
}

pub(crate) fn chat_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1/chat/completions")
    }
}

fn classify_transport(url: &str, e: reqwest::Error) -> DispatchError {
    if e.is_timeout() {
        DispatchError::Timeout(format!("request to {url} timed out"))
    } else {
        DispatchError::ConnectionFailed(format!("request to {url} failed: {e}"))
    }
}

fn classify_status(status: u16, body: &str) -> DispatchError {
    if is_oom(body) {
        return DispatchError::MemoryExhausted {
            host: String::new(),
            message: snippet(body),
        };
    }
    if status >= 500 || status == 429 {
        DispatchError::ServerError {
            status,
            message: snippet(body),
        }
    } else {
        DispatchError::InvalidPayload(format!("HTTP {status}: {}", snippet(body)))
    }
}

fn is_oom(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("gpu out of memory")
        || lower.contains("cuda out of memory")
        || lower.contains("cuda oom")
        || lower.contains("out of memory")
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_hundreds_and_429_are_server_errors() {
        assert!(classify_status(500, "boom").is_retryable());
        assert!(classify_status(503, "overloaded").is_retryable());
        assert!(classify_status(429, "slow down").is_retryable());
    }

    #[test]
    fn other_4xx_is_invalid_payload() {
        let err = classify_status(400, "bad request");
        assert_eq!(err.kind(), "invalid_payload");
        assert!(!err.is_retryable());
    }

    #[test]
    fn oom_bodies_classify_as_memory_exhausted() {
        let err = classify_status(500, "CUDA out of memory. Tried to allocate 2GB");
        assert_eq!(err.kind(), "memory_exhausted");
        assert!(err.is_retryable());

        let err = classify_status(400, "GPU out of memory");
        assert_eq!(err.kind(), "memory_exhausted");
    }

    #[test]
    fn chat_url_appends_standard_path_once() {
        assert_eq!(
            chat_url("http://fenrir:8131"),
            "http://fenrir:8131/v1/chat/completions"
        );
        assert_eq!(
            chat_url("http://fenrir:8131/"),
            "http://fenrir:8131/v1/chat/completions"
        );
        assert_eq!(
            chat_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }
}

//! Bundled HTTP provider speaking the two common wire dialects.
//!
//! Most hosted LLM endpoints are either Anthropic-style (`/v1/messages`,
//! `x-api-key` header) or OpenAI-style (`/chat/completions`, bearer auth).
//! One `HttpProvider` instance covers a single named endpoint in one of
//! those dialects; API keys come from `<NAME>_API_KEY` in the environment.

use std::time::Duration;

use async_trait::async_trait;

use super::{
    ChatMessage, CompletionRequest, CompletionResponse, Provider, ProviderError, Role, ToolCall,
    Usage,
};

/// Wire dialect of an HTTP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Anthropic,
    OpenAi,
}

/// A single named HTTP endpoint implementing [`Provider`].
pub struct HttpProvider {
    name: String,
    dialect: Dialect,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

const DEFAULT_MAX_TOKENS: u32 = 4096;

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        dialect: Dialect,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: name.into(),
            dialect,
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Construct a provider for a well-known name, reading
    /// `<NAME>_API_KEY` and optional `<NAME>_BASE_URL` from the
    /// environment. Unrecognized names default to the OpenAI dialect.
    pub fn for_name(name: &str) -> Result<Self, ProviderError> {
        let upper = name.to_uppercase().replace('-', "_");
        let api_key = std::env::var(format!("{}_API_KEY", upper)).map_err(|_| {
            ProviderError::Rejected {
                provider: name.to_string(),
                status: 401,
                message: format!("environment variable {}_API_KEY not set", upper),
            }
        })?;

        let (dialect, default_base) = match name {
            "anthropic" => (Dialect::Anthropic, "https://api.anthropic.com"),
            "openai" => (Dialect::OpenAi, "https://api.openai.com/v1"),
            "groq" => (Dialect::OpenAi, "https://api.groq.com/openai/v1"),
            "deepseek" => (Dialect::OpenAi, "https://api.deepseek.com/v1"),
            _ => (Dialect::OpenAi, ""),
        };

        let base_url = std::env::var(format!("{}_BASE_URL", upper))
            .unwrap_or_else(|_| default_base.to_string());
        if base_url.is_empty() {
            return Err(ProviderError::Rejected {
                provider: name.to_string(),
                status: 400,
                message: format!("no base URL known for '{}'; set {}_BASE_URL", name, upper),
            });
        }

        Ok(Self::new(name, dialect, base_url, api_key, Duration::from_secs(300)))
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: &str, retry_after: Option<Duration>) -> ProviderError {
        let code = status.as_u16();
        if code == 429 {
            ProviderError::RateLimit {
                provider: self.name.clone(),
                retry_after,
            }
        } else if code >= 500 {
            ProviderError::Transport {
                provider: self.name.clone(),
                message: format!("server error {}: {}", code, crate::util::truncate(body, 300)),
            }
        } else {
            ProviderError::Rejected {
                provider: self.name.clone(),
                status: code,
                message: crate::util::truncate(body, 300),
            }
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: self.name.clone(),
                elapsed: Duration::ZERO,
            }
        } else {
            ProviderError::Transport {
                provider: self.name.clone(),
                message: err.to_string(),
            }
        }
    }

    // ─── Anthropic-style messages API ───────────────────────────────────

    fn anthropic_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| match m.role {
                Role::Tool => serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id,
                        "content": m.content,
                    }]
                }),
                Role::Assistant if !m.tool_calls.is_empty() => {
                    let mut blocks: Vec<serde_json::Value> = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": m.content}));
                    }
                    for call in &m.tool_calls {
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    serde_json::json!({"role": "assistant", "content": blocks})
                }
                _ => serde_json::json!({
                    "role": match m.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": m.content,
                }),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::Value::String(system.clone());
        }
        if let Some(temp) = request.temperature {
            if let Some(n) = serde_json::Number::from_f64(temp) {
                body["temperature"] = serde_json::Value::Number(n);
            }
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    fn parse_anthropic(&self, json: &serde_json::Value) -> CompletionResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        if let Some(blocks) = json.get("content").and_then(|c| c.as_array()) {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            if !content.is_empty() {
                                content.push('\n');
                            }
                            content.push_str(text);
                        }
                    }
                    Some("tool_use") => {
                        tool_calls.push(ToolCall {
                            id: block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            arguments: block.get("input").cloned().unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
        }

        CompletionResponse {
            content,
            tool_calls,
            usage: json.get("usage").map(|u| Usage {
                input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            }),
            model: json
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }

    // ─── OpenAI-style chat completions API ──────────────────────────────

    fn openai_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for m in &request.messages {
            match m.role {
                Role::Tool => messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id,
                    "content": m.content,
                })),
                Role::Assistant if !m.tool_calls.is_empty() => messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": m.content,
                    "tool_calls": m.tool_calls.iter().map(|c| serde_json::json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })).collect::<Vec<_>>(),
                })),
                _ => messages.push(serde_json::json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": m.content,
                })),
            }
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(temp) = request.temperature {
            if let Some(n) = serde_json::Number::from_f64(temp) {
                body["temperature"] = serde_json::Value::Number(n);
            }
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    fn parse_openai(&self, json: &serde_json::Value) -> CompletionResponse {
        let message = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"));

        let content = message
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();

        let tool_calls = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(|t| t.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| {
                        let func = c.get("function")?;
                        let raw_args = func.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                        Some(ToolCall {
                            id: c.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                            name: func.get("name").and_then(|v| v.as_str())?.to_string(),
                            arguments: serde_json::from_str(raw_args)
                                .unwrap_or(serde_json::Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        CompletionResponse {
            content,
            tool_calls,
            usage: json.get("usage").map(|u| Usage {
                input_tokens: u
                    .get("prompt_tokens")
                    .or_else(|| u.get("input_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                output_tokens: u
                    .get("completion_tokens")
                    .or_else(|| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            }),
            model: json
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let base = self.base_url.trim_end_matches('/');
        let (url, body) = match self.dialect {
            Dialect::Anthropic => (format!("{}/v1/messages", base), self.anthropic_body(request)),
            Dialect::OpenAi => (
                format!("{}/chat/completions", base),
                self.openai_body(request),
            ),
        };

        tracing::debug!(provider = %self.name, model = %request.model, url = %url, "dispatching completion");

        let mut http = self.client.post(&url).header("content-type", "application/json");
        http = match self.dialect {
            Dialect::Anthropic => http
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01"),
            Dialect::OpenAi => http.header("Authorization", format!("Bearer {}", self.api_key)),
        };

        let response = http
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(self.classify_status(status, &text, retry_after));
        }

        let json: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| ProviderError::Transport {
                provider: self.name.clone(),
                message: format!("malformed response body: {}", e),
            })?;

        let mut parsed = match self.dialect {
            Dialect::Anthropic => self.parse_anthropic(&json),
            Dialect::OpenAi => self.parse_openai(&json),
        };
        if parsed.model.is_empty() {
            parsed.model = request.model.clone();
        }
        Ok(parsed)
    }
}

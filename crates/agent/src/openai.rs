use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use strand_core::{
    CapabilityDescriptor, Error, InvocationOutcome, Message, ReasonerConfig, Result,
};
use tracing::{debug, error, info, warn};

use crate::reasoner::{Decision, PlannedInvocation, Reasoner, ReasoningContext};

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Reasoner backed by an OpenAI-compatible `/chat/completions` endpoint
/// with native function calling.
pub struct OpenAiReasoner {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiReasoner {
    /// `timeout` bounds a single HTTP request; the engine applies its own
    /// reasoning timeout on top.
    pub fn new(config: &ReasonerConfig, timeout: Duration) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::Config(
                "reasoner.apiKey is empty (set it in config or STRAND_API_KEY)".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    async fn send_request(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        info!(
            url = %url,
            model = %self.model,
            tools_count = request.tools.len(),
            messages_count = request.messages.len(),
            "Calling reasoning model"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::ReasoningFailure(format!("Request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = %status, body = %raw_body, "Reasoning API error");
            return Err(Error::ReasoningFailure(format!("API error {}: {}", status, raw_body)));
        }

        {
            let end = truncate_at_char_boundary(&raw_body, 500);
            debug!(body_len = raw_body.len(), preview = %&raw_body[..end], "Reasoning raw response");
        }

        serde_json::from_str(&raw_body).map_err(|e| {
            let end = truncate_at_char_boundary(&raw_body, 500);
            Error::ReasoningFailure(format!("Failed to parse response: {}. Body: {}", e, &raw_body[..end]))
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

fn tool_schema(descriptor: &CapabilityDescriptor) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": descriptor.name,
            "description": descriptor.description,
            "parameters": descriptor.input_schema,
        }
    })
}

/// Chat messages for one request: instructions first, then the windowed log.
fn chat_messages(context: &ReasoningContext) -> Vec<Value> {
    let mut out = Vec::with_capacity(context.messages.len() + 1);
    if !context.instructions.is_empty() {
        out.push(json!({"role": "system", "content": context.instructions}));
    }
    for message in &context.messages {
        let value = match message {
            Message::System { content, .. } => json!({"role": "system", "content": content}),
            Message::User { content, .. } => json!({"role": "user", "content": content}),
            Message::Assistant {
                content,
                invocations,
                ..
            } if invocations.is_empty() => json!({"role": "assistant", "content": content}),
            Message::Assistant {
                content,
                invocations,
                ..
            } => {
                let calls: Vec<Value> = invocations
                    .iter()
                    .map(|r| {
                        json!({
                            "id": r.invocation_id,
                            "type": "function",
                            "function": {
                                "name": r.capability_name,
                                "arguments": r.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                json!({"role": "assistant", "content": content, "tool_calls": calls})
            }
            Message::ToolResult {
                invocation_id,
                outcome,
                ..
            } => {
                let body = match outcome {
                    InvocationOutcome::Output(v) => v.to_string(),
                    InvocationOutcome::Error(e) => json!({"error": e}).to_string(),
                };
                json!({"role": "tool", "tool_call_id": invocation_id, "content": body})
            }
        };
        out.push(value);
    }
    out
}

fn decision_from(response: ChatResponse) -> Result<Decision> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::ReasoningFailure("No choices in response".to_string()))?;

    let invocations = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let arguments = serde_json::from_str(&tc.function.arguments).unwrap_or_else(|e| {
                // Left as a string so schema validation reports it to the model.
                warn!(capability = %tc.function.name, error = %e, "Tool call arguments are not JSON");
                Value::String(tc.function.arguments.clone())
            });
            PlannedInvocation {
                capability_name: tc.function.name,
                arguments,
            }
        })
        .collect();

    Ok(Decision {
        content: choice.message.content.unwrap_or_default(),
        invocations,
    })
}

#[async_trait]
impl Reasoner for OpenAiReasoner {
    async fn reason(&self, context: &ReasoningContext) -> Result<Decision> {
        let tools: Vec<Value> = context.capabilities.iter().map(tool_schema).collect();
        let request = ChatRequest {
            model: self.model.clone(),
            messages: chat_messages(context),
            tool_choice: if tools.is_empty() { None } else { Some("auto".to_string()) },
            tools,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let response = self.send_request(&request).await?;
        decision_from(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{InvocationRequest, InvocationResult, MessageLog};

    fn context() -> ReasoningContext {
        let request = InvocationRequest {
            invocation_id: "inv-1".to_string(),
            capability_name: "calculate_emi".to_string(),
            arguments: json!({"principal": 1000}),
        };
        let mut log = MessageLog::new();
        log.push_user("what is my emi").unwrap();
        log.push_assistant("", vec![request.clone()]).unwrap();
        log.push_result(InvocationResult::output(&request, json!({"emi": 88.0})))
            .unwrap();
        ReasoningContext {
            thread_id: "t".to_string(),
            instructions: "be brief".to_string(),
            messages: log.messages().to_vec(),
            capabilities: vec![],
        }
    }

    #[test]
    fn test_chat_messages_pair_calls_with_results() {
        let messages = chat_messages(&context());
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be brief");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "inv-1");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "calculate_emi");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "inv-1");
    }

    #[test]
    fn test_decision_from_tool_calls() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_0",
                        "type": "function",
                        "function": {"name": "calculate_emi", "arguments": "{\"principal\": 5}"}
                    }]
                }
            }]
        }))
        .unwrap();
        let decision = decision_from(response).unwrap();
        assert!(!decision.is_terminal());
        assert_eq!(decision.invocations[0].arguments, json!({"principal": 5}));
    }

    #[test]
    fn test_decision_from_plain_reply() {
        let response: ChatResponse =
            serde_json::from_value(json!({"choices": [{"message": {"content": "hi"}}]})).unwrap();
        let decision = decision_from(response).unwrap();
        assert!(decision.is_terminal());
        assert_eq!(decision.content, "hi");
    }

    #[test]
    fn test_empty_choices_is_reasoning_failure() {
        let response: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(decision_from(response), Err(Error::ReasoningFailure(_))));
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let config = ReasonerConfig::default();
        assert!(matches!(
            OpenAiReasoner::new(&config, Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
    }
}

//! Inbound request shapes the admission core inspects.
//!
//! Only the fields moderation and accounting read are modelled; everything
//! else is carried through `extra` so a snapshot still shows the full body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token-accounting view of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCountMeta {
    /// All prompt text the tokenizer counts, joined by newlines.
    #[serde(default)]
    pub combine_text: String,
}

/// Capabilities every request shape exposes to the gate.
pub trait RelayRequest: Send + Sync {
    fn model_name(&self) -> &str;

    /// Text of the most recent user turn, if it has any.
    fn last_user_text(&self) -> Option<String>;

    /// Conversation part of the request for violation reports.
    fn messages_snapshot(&self) -> Value;

    fn token_count_meta(&self) -> TokenCountMeta;

    fn to_json(&self) -> Result<Value, serde_json::Error>;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Joins the non-blank `text` parts of a content value; plain strings are
/// returned as is.
fn content_text(content: &Value, part_type: &str) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some(part_type))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn join_non_empty<I>(texts: I) -> String
where
    I: IntoIterator<Item = String>,
{
    texts
        .into_iter()
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `POST /v1/chat/completions` and `/v1/completions`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAiChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelayRequest for OpenAiChatRequest {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .filter(|message| message.role.eq_ignore_ascii_case("user"))
            .map(|message| content_text(&message.content, "text"))
            .find(|text| !text.trim().is_empty())
    }

    fn messages_snapshot(&self) -> Value {
        if self.messages.is_empty() {
            return Value::Null;
        }
        serde_json::to_value(&self.messages).unwrap_or(Value::Null)
    }

    fn token_count_meta(&self) -> TokenCountMeta {
        let prompt = self
            .prompt
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string);
        let messages = self
            .messages
            .iter()
            .map(|message| content_text(&message.content, "text"));
        TokenCountMeta {
            combine_text: join_non_empty(prompt.into_iter().chain(messages)),
        }
    }

    fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// `POST /v1/messages`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaudeMessagesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelayRequest for ClaudeMessagesRequest {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .filter(|message| message.role.eq_ignore_ascii_case("user"))
            .map(|message| content_text(&message.content, "text").trim().to_string())
            .find(|text| !text.is_empty())
    }

    fn messages_snapshot(&self) -> Value {
        if self.messages.is_empty() {
            return Value::Null;
        }
        serde_json::to_value(&self.messages).unwrap_or(Value::Null)
    }

    fn token_count_meta(&self) -> TokenCountMeta {
        let system = self
            .system
            .as_ref()
            .map(|system| content_text(system, "text"));
        let messages = self
            .messages
            .iter()
            .map(|message| content_text(&message.content, "text"));
        TokenCountMeta {
            combine_text: join_non_empty(system.into_iter().chain(messages)),
        }
    }

    fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// One flattened piece of a Responses API `input`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResponsesInputPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// `POST /v1/responses`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponsesRequest {
    /// Flattens `input` (a string, or a list of messages and content parts)
    /// into typed text parts in order.
    pub fn parse_input(&self) -> Vec<ResponsesInputPart> {
        let mut parts = Vec::new();
        match &self.input {
            Value::String(text) => parts.push(ResponsesInputPart {
                kind: "input_text".to_string(),
                text: text.clone(),
            }),
            Value::Array(items) => {
                for item in items {
                    collect_input_parts(item, &mut parts);
                }
            }
            _ => {}
        }
        parts
    }
}

fn collect_input_parts(item: &Value, parts: &mut Vec<ResponsesInputPart>) {
    let kind = item.get("type").and_then(Value::as_str);
    if let (Some(kind), Some(text)) = (kind, item.get("text").and_then(Value::as_str)) {
        parts.push(ResponsesInputPart {
            kind: kind.to_string(),
            text: text.to_string(),
        });
        return;
    }
    let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
    match item.get("content") {
        Some(Value::String(text)) => {
            let kind = if role.eq_ignore_ascii_case("assistant") {
                "output_text"
            } else {
                "input_text"
            };
            parts.push(ResponsesInputPart {
                kind: kind.to_string(),
                text: text.clone(),
            });
        }
        Some(Value::Array(content)) => {
            for part in content {
                collect_input_parts(part, parts);
            }
        }
        _ => {}
    }
}

impl RelayRequest for ResponsesRequest {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn last_user_text(&self) -> Option<String> {
        self.parse_input()
            .into_iter()
            .rev()
            .find(|part| part.kind.eq_ignore_ascii_case("input_text") && !part.text.trim().is_empty())
            .map(|part| part.text)
    }

    fn messages_snapshot(&self) -> Value {
        let parts = self.parse_input();
        if parts.is_empty() {
            return Value::Null;
        }
        serde_json::to_value(parts).unwrap_or(Value::Null)
    }

    fn token_count_meta(&self) -> TokenCountMeta {
        let inputs = self.parse_input().into_iter().map(|part| part.text);
        TokenCountMeta {
            combine_text: join_non_empty(self.instructions.clone().into_iter().chain(inputs)),
        }
    }

    fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn text(&self) -> String {
        join_non_empty(self.parts.iter().filter_map(|part| part.text.clone()))
    }
}

/// `POST /v1beta/models/{model}:generateContent`. The model comes from the
/// path, not the body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiChatRequest {
    #[serde(skip)]
    pub model: String,
    #[serde(default)]
    pub contents: Vec<GeminiContent>,
    #[serde(default, alias = "system_instruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelayRequest for GeminiChatRequest {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn last_user_text(&self) -> Option<String> {
        self.contents
            .iter()
            .rev()
            .filter(|content| content.role.is_empty() || content.role.eq_ignore_ascii_case("user"))
            .map(GeminiContent::text)
            .find(|text| !text.trim().is_empty())
    }

    fn messages_snapshot(&self) -> Value {
        if self.contents.is_empty() {
            return Value::Null;
        }
        serde_json::to_value(&self.contents).unwrap_or(Value::Null)
    }

    /// Counts conversation contents only; the system instruction is billed
    /// separately upstream.
    fn token_count_meta(&self) -> TokenCountMeta {
        TokenCountMeta {
            combine_text: join_non_empty(self.contents.iter().map(GeminiContent::text)),
        }
    }

    fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

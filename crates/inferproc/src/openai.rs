//! Serde models for the OpenAI-compatible wire surface the filter accepts
//! inbound and emits back to clients.
//!
//! These are intentionally lossy on fields the filter never inspects: the
//! OpenAI passthrough paths forward the original bytes untouched, so only
//! translated paths (Bedrock) re-serialize from these structs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
	pub model: String,
	pub messages: Vec<ChatMessage>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub stream: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<StreamOptions>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop: Option<StopSequences>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub frequency_penalty: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub presence_penalty: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub seed: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub n: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	/// Fields the filter does not model are carried through untouched so a
	/// re-serialized request stays faithful.
	#[serde(flatten)]
	pub rest: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamOptions {
	#[serde(default)]
	pub include_usage: bool,
	#[serde(flatten)]
	pub rest: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StopSequences {
	One(String),
	Many(Vec<String>),
}

impl StopSequences {
	pub fn to_vec(&self) -> Vec<String> {
		match self {
			StopSequences::One(s) => vec![s.clone()],
			StopSequences::Many(v) => v.clone(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
	pub role: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<MessageContent>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Parts(Vec<ContentPart>),
}

impl MessageContent {
	/// Collapse the content into plain text, joining multi-part text blocks.
	pub fn as_text(&self) -> String {
		match self {
			MessageContent::Text(t) => t.clone(),
			MessageContent::Parts(parts) => parts
				.iter()
				.filter_map(|p| p.text.as_deref())
				.collect::<Vec<_>>()
				.join(""),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentPart {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_url: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
	#[serde(rename = "type")]
	pub kind: String,
	pub function: ToolFunction,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolFunction {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCallFunction {
	pub name: String,
	pub arguments: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
	pub id: String,
	pub object: String,
	pub created: u64,
	pub model: String,
	pub choices: Vec<ChatChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatChoice {
	pub index: u32,
	pub message: ChatMessage,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
}

/// One `chat.completion.chunk` record in a streamed response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionChunk {
	pub id: String,
	pub object: String,
	pub created: u64,
	pub model: String,
	#[serde(default)]
	pub choices: Vec<ChunkChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkChoice {
	pub index: u32,
	pub delta: ChunkDelta,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChunkDelta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkToolCall {
	pub index: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	pub function: ChunkToolFunction,
}

/// Tool-call delta: the first chunk carries the name, later chunks only
/// append to `arguments`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChunkToolFunction {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default)]
	pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
	#[serde(default)]
	pub prompt_tokens: u32,
	#[serde(default)]
	pub completion_tokens: u32,
	#[serde(default)]
	pub total_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingsRequest {
	pub model: String,
	pub input: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub encoding_format: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dimensions: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(flatten)]
	pub rest: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingsResponse {
	pub object: String,
	pub data: Vec<Value>,
	pub model: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<EmbeddingsUsage>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct EmbeddingsUsage {
	#[serde(default)]
	pub prompt_tokens: u32,
	#[serde(default)]
	pub total_tokens: u32,
}

/// `/v1/models` list shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelList {
	pub object: String,
	pub data: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Model {
	pub id: String,
	pub object: String,
	pub created: u64,
	pub owned_by: String,
}

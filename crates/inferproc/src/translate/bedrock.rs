//! OpenAI → AWS Bedrock translation over the Converse API.
//!
//! Outbound, the chat-completion request is re-encoded as a Converse payload
//! and the path is rewritten to the model-scoped invoke URL
//! (`/model/{id}/converse` or `/model/{id}/converse-stream`). Inbound,
//! non-streamed responses are Converse JSON and streamed responses arrive as
//! AWS event-stream frames, which are decoded and re-emitted as OpenAI SSE
//! `data:` records ending with `data: [DONE]`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use aws_smithy_eventstream::frame::{DecodedFrame, MessageFrameDecoder};
use aws_smithy_types::event_stream::{HeaderValue as FrameHeaderValue, Message};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envoy::{remove_header, replace_body, set_header, BodyMutation, HeaderMutation};
use crate::error::Error;
use crate::openai::{
	ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
	ChunkChoice, ChunkDelta, ChunkToolCall, ChunkToolFunction, MessageContent, ToolCall,
	ToolCallFunction, Usage,
};
use crate::translate::{BodyTransform, ChatTranslator, TokenUsage};

#[derive(Debug, Default)]
pub struct BedrockChatTranslator {
	model: String,
	stream: bool,
	usage_reported: bool,
	buffered: BytesMut,
	frames: BytesMut,
	message_id: Option<String>,
	// contentBlockIndex -> OpenAI tool_calls index
	tool_indices: HashMap<u32, u32>,
	next_tool_index: u32,
}

impl ChatTranslator for BedrockChatTranslator {
	fn request_body(
		&mut self,
		req: &ChatCompletionRequest,
	) -> Result<(HeaderMutation, Option<BodyMutation>), Error> {
		self.model = req.model.clone();
		self.stream = req.stream;

		let path = if req.stream {
			format!("/model/{}/converse-stream", req.model)
		} else {
			format!("/model/{}/converse", req.model)
		};
		let converse = to_converse_request(req)?;
		let body = serde_json::to_vec(&converse)
			.map_err(|e| Error::Translate(format!("failed to encode converse request: {e}")))?;

		let mut headers = HeaderMutation::default();
		set_header(&mut headers, ":path", path.as_bytes());
		set_header(&mut headers, "content-type", b"application/json");
		set_header(
			&mut headers,
			"content-length",
			body.len().to_string().as_bytes(),
		);
		Ok((headers, Some(replace_body(body))))
	}

	fn response_headers(
		&mut self,
		headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error> {
		let mut mutation = HeaderMutation::default();
		if status(headers) != "200" {
			return Ok(mutation);
		}
		if self.stream {
			// Re-framed from AWS event-stream to SSE; length is unknowable.
			set_header(&mut mutation, "content-type", b"text/event-stream");
			remove_header(&mut mutation, "content-length");
		} else {
			set_header(&mut mutation, "content-type", b"application/json");
		}
		Ok(mutation)
	}

	fn response_body(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
		end_of_stream: bool,
	) -> Result<BodyTransform, Error> {
		if self.message_id.is_none() {
			let id = headers
				.get("x-amzn-requestid")
				.map(|id| format!("chatcmpl-{id}"))
				.unwrap_or_else(|| "chatcmpl-bedrock".to_string());
			self.message_id = Some(id);
		}
		if status(headers) != "200" {
			return self.error_body(headers, body, end_of_stream);
		}
		if self.stream {
			self.stream_body(body, end_of_stream)
		} else {
			self.converse_body(body, end_of_stream)
		}
	}
}

impl BedrockChatTranslator {
	fn converse_body(&mut self, body: &[u8], end_of_stream: bool) -> Result<BodyTransform, Error> {
		self.buffered.extend_from_slice(body);
		if !end_of_stream || self.buffered.is_empty() {
			return Ok(BodyTransform::default());
		}
		let converse: ConverseResponse = serde_json::from_slice(&self.buffered)
			.map_err(|e| Error::Translate(format!("invalid converse response: {e}")))?;

		let message = from_bedrock_message(&converse.output.message)?;
		let usage = converse.usage.unwrap_or_default();
		let response = ChatCompletionResponse {
			id: self.message_id(),
			object: "chat.completion".to_string(),
			created: now_secs(),
			model: self.model.clone(),
			choices: vec![ChatChoice {
				index: 0,
				message,
				finish_reason: Some(map_stop_reason(converse.stop_reason.as_deref())),
			}],
			usage: Some(Usage {
				prompt_tokens: usage.input_tokens,
				completion_tokens: usage.output_tokens,
				total_tokens: usage.total_tokens,
			}),
		};
		let body = serde_json::to_vec(&response)
			.map_err(|e| Error::Translate(format!("failed to encode response: {e}")))?;

		let mut headers = HeaderMutation::default();
		set_header(
			&mut headers,
			"content-length",
			body.len().to_string().as_bytes(),
		);
		Ok(BodyTransform {
			headers,
			body: Some(replace_body(body)),
			usage: self.take_usage(&usage),
		})
	}

	fn stream_body(&mut self, body: &[u8], end_of_stream: bool) -> Result<BodyTransform, Error> {
		self.frames.extend_from_slice(body);
		let mut out = String::new();
		let mut usage = TokenUsage::default();

		// The event-stream prelude leads with the total frame length, so we
		// can carve complete frames off the residue ourselves and keep exact
		// track of leftover bytes for the end-of-stream check.
		while self.frames.len() >= 4 {
			let total = u32::from_be_bytes([
				self.frames[0],
				self.frames[1],
				self.frames[2],
				self.frames[3],
			]) as usize;
			if total < 16 {
				return Err(Error::Translate(format!(
					"invalid event stream frame length {total}"
				)));
			}
			if self.frames.len() < total {
				break;
			}
			let mut frame = self.frames.split_to(total);
			let message = match MessageFrameDecoder::new().decode_frame(&mut frame) {
				Ok(DecodedFrame::Complete(message)) => message,
				Ok(DecodedFrame::Incomplete) => {
					return Err(Error::Translate("truncated event stream frame".into()));
				},
				Err(e) => {
					return Err(Error::Translate(format!("invalid event stream frame: {e}")));
				},
			};
			for chunk in self.translate_frame(&message, &mut usage)? {
				out.push_str("data: ");
				out.push_str(&chunk);
				out.push_str("\n\n");
			}
		}

		if end_of_stream {
			if !self.frames.is_empty() {
				return Err(Error::Translate(
					"stream ended with an incomplete event stream frame".into(),
				));
			}
			out.push_str("data: [DONE]\n\n");
		}
		Ok(BodyTransform {
			headers: HeaderMutation::default(),
			body: Some(replace_body(out.into_bytes())),
			usage,
		})
	}

	fn translate_frame(
		&mut self,
		message: &Message,
		usage: &mut TokenUsage,
	) -> Result<Vec<String>, Error> {
		let message_type = frame_header(message, ":message-type");
		if message_type.as_deref() == Some("exception") {
			return Err(Error::Translate(format!(
				"backend exception {}: {}",
				frame_header(message, ":exception-type").unwrap_or_default(),
				String::from_utf8_lossy(&message.payload()[..])
			)));
		}
		let Some(event_type) = frame_header(message, ":event-type") else {
			return Ok(Vec::new());
		};
		let payload = message.payload();

		let chunk = match event_type.as_str() {
			"messageStart" => self.chunk(
				Some(ChunkDelta {
					role: Some("assistant".to_string()),
					..Default::default()
				}),
				None,
				None,
			),
			"contentBlockStart" => {
				let ev: ContentBlockStartEvent = parse_event(payload)?;
				let Some(tool) = ev.start.and_then(|s| s.tool_use) else {
					return Ok(Vec::new());
				};
				let index = self.next_tool_index;
				self.next_tool_index += 1;
				self.tool_indices
					.insert(ev.content_block_index.unwrap_or_default(), index);
				self.chunk(
					Some(ChunkDelta {
						tool_calls: Some(vec![ChunkToolCall {
							index,
							id: Some(tool.tool_use_id),
							kind: Some("function".to_string()),
							function: ChunkToolFunction {
								name: Some(tool.name),
								arguments: String::new(),
							},
						}]),
						..Default::default()
					}),
					None,
					None,
				)
			},
			"contentBlockDelta" => {
				let ev: ContentBlockDeltaEvent = parse_event(payload)?;
				let Some(delta) = ev.delta else {
					return Ok(Vec::new());
				};
				if let Some(text) = delta.text {
					self.chunk(
						Some(ChunkDelta {
							content: Some(text),
							..Default::default()
						}),
						None,
						None,
					)
				} else if let Some(tool) = delta.tool_use {
					let index = self
						.tool_indices
						.get(&ev.content_block_index.unwrap_or_default())
						.copied()
						.unwrap_or(0);
					self.chunk(
						Some(ChunkDelta {
							tool_calls: Some(vec![ChunkToolCall {
								index,
								id: None,
								kind: None,
								function: ChunkToolFunction {
									name: None,
									arguments: tool.input.unwrap_or_default(),
								},
							}]),
							..Default::default()
						}),
						None,
						None,
					)
				} else {
					return Ok(Vec::new());
				}
			},
			"messageStop" => {
				let ev: MessageStopEvent = parse_event(payload)?;
				self.chunk(
					Some(ChunkDelta::default()),
					Some(map_stop_reason(ev.stop_reason.as_deref())),
					None,
				)
			},
			"metadata" => {
				let ev: MetadataEvent = parse_event(payload)?;
				let Some(bedrock_usage) = ev.usage else {
					return Ok(Vec::new());
				};
				*usage += self.take_usage(&bedrock_usage);
				self.chunk(
					None,
					None,
					Some(Usage {
						prompt_tokens: bedrock_usage.input_tokens,
						completion_tokens: bedrock_usage.output_tokens,
						total_tokens: bedrock_usage.total_tokens,
					}),
				)
			},
			// contentBlockStop, ping, and anything newer carry nothing the
			// OpenAI stream shape needs.
			_ => return Ok(Vec::new()),
		};
		let encoded = serde_json::to_string(&chunk)
			.map_err(|e| Error::Translate(format!("failed to encode chunk: {e}")))?;
		Ok(vec![encoded])
	}

	fn chunk(
		&self,
		delta: Option<ChunkDelta>,
		finish_reason: Option<String>,
		usage: Option<Usage>,
	) -> ChatCompletionChunk {
		ChatCompletionChunk {
			id: self.message_id(),
			object: "chat.completion.chunk".to_string(),
			created: now_secs(),
			model: self.model.clone(),
			choices: delta
				.map(|delta| {
					vec![ChunkChoice {
						index: 0,
						delta,
						finish_reason,
					}]
				})
				.unwrap_or_default(),
			usage,
		}
	}

	fn error_body(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
		end_of_stream: bool,
	) -> Result<BodyTransform, Error> {
		self.buffered.extend_from_slice(body);
		if !end_of_stream || self.buffered.is_empty() {
			return Ok(BodyTransform::default());
		}
		let message = serde_json::from_slice::<BedrockError>(&self.buffered)
			.map(|e| e.message)
			.unwrap_or_else(|_| String::from_utf8_lossy(&self.buffered).into_owned());
		let kind = headers
			.get("x-amzn-errortype")
			.cloned()
			.unwrap_or_else(|| "BedrockException".to_string());
		let body = serde_json::json!({
			"error": {"message": message, "type": kind, "code": status(headers)},
		})
		.to_string()
		.into_bytes();

		let mut mutation = HeaderMutation::default();
		set_header(&mut mutation, "content-type", b"application/json");
		set_header(
			&mut mutation,
			"content-length",
			body.len().to_string().as_bytes(),
		);
		Ok(BodyTransform {
			headers: mutation,
			body: Some(replace_body(body)),
			usage: TokenUsage::default(),
		})
	}

	fn take_usage(&mut self, usage: &BedrockUsage) -> TokenUsage {
		if self.usage_reported {
			return TokenUsage::default();
		}
		self.usage_reported = true;
		TokenUsage {
			input_tokens: usage.input_tokens,
			output_tokens: usage.output_tokens,
			total_tokens: usage.total_tokens,
		}
	}

	fn message_id(&self) -> String {
		self.message_id
			.clone()
			.unwrap_or_else(|| "chatcmpl-bedrock".to_string())
	}
}

fn status(headers: &HashMap<String, String>) -> &str {
	headers.get(":status").map(String::as_str).unwrap_or("200")
}

fn frame_header(message: &Message, name: &str) -> Option<String> {
	message.headers().iter().find_map(|h| {
		if h.name().as_str() != name {
			return None;
		}
		match h.value() {
			FrameHeaderValue::String(s) => Some(s.as_str().to_string()),
			_ => None,
		}
	})
}

fn parse_event<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, Error> {
	serde_json::from_slice(payload)
		.map_err(|e| Error::Translate(format!("invalid event stream payload: {e}")))
}

fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}

fn map_stop_reason(reason: Option<&str>) -> String {
	match reason {
		Some("max_tokens") => "length".to_string(),
		Some("tool_use") => "tool_calls".to_string(),
		Some("guardrail_intervened") | Some("content_filtered") => "content_filter".to_string(),
		// end_turn, stop_sequence, and anything unrecognized
		_ => "stop".to_string(),
	}
}

// ---- Converse wire schema ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseRequest {
	messages: Vec<BedrockMessage>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	system: Vec<SystemBlock>,
	#[serde(skip_serializing_if = "Option::is_none")]
	inference_config: Option<InferenceConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tool_config: Option<ToolConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SystemBlock {
	text: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockMessage {
	role: String,
	content: Vec<BedrockContent>,
}

/// Converse content block: a union with exactly one member set.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockContent {
	#[serde(skip_serializing_if = "Option::is_none")]
	text: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tool_use: Option<BedrockToolUse>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tool_result: Option<BedrockToolResult>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockToolUse {
	tool_use_id: String,
	name: String,
	input: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockToolResult {
	tool_use_id: String,
	content: Vec<ToolResultContent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ToolResultContent {
	#[serde(skip_serializing_if = "Option::is_none")]
	text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	top_p: Option<f64>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	stop_sequences: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
	tools: Vec<BedrockTool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BedrockTool {
	tool_spec: BedrockToolSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BedrockToolSpec {
	name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	description: Option<String>,
	input_schema: BedrockToolSchema,
}

#[derive(Debug, Serialize)]
struct BedrockToolSchema {
	json: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
	output: ConverseOutput,
	#[serde(default)]
	stop_reason: Option<String>,
	#[serde(default)]
	usage: Option<BedrockUsage>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
	message: BedrockMessage,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockUsage {
	#[serde(default)]
	input_tokens: u32,
	#[serde(default)]
	output_tokens: u32,
	#[serde(default)]
	total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct BedrockError {
	message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlockStartEvent {
	#[serde(default)]
	content_block_index: Option<u32>,
	#[serde(default)]
	start: Option<BlockStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStart {
	#[serde(default)]
	tool_use: Option<ToolUseStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseStart {
	tool_use_id: String,
	name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlockDeltaEvent {
	#[serde(default)]
	content_block_index: Option<u32>,
	#[serde(default)]
	delta: Option<BlockDelta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDelta {
	#[serde(default)]
	text: Option<String>,
	#[serde(default)]
	tool_use: Option<ToolUseDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolUseDelta {
	#[serde(default)]
	input: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStopEvent {
	#[serde(default)]
	stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataEvent {
	#[serde(default)]
	usage: Option<BedrockUsage>,
}

// ---- OpenAI <-> Converse mapping ----

fn to_converse_request(req: &ChatCompletionRequest) -> Result<ConverseRequest, Error> {
	let mut system = Vec::new();
	let mut messages: Vec<BedrockMessage> = Vec::new();

	for msg in &req.messages {
		match msg.role.as_str() {
			"system" | "developer" => {
				if let Some(content) = &msg.content {
					system.push(SystemBlock {
						text: content.as_text(),
					});
				}
			},
			"tool" => {
				let id = msg.tool_call_id.clone().ok_or_else(|| {
					Error::Translate("tool message without tool_call_id".into())
				})?;
				// Tool results travel as user-role content blocks in Converse.
				messages.push(BedrockMessage {
					role: "user".to_string(),
					content: vec![BedrockContent {
						tool_result: Some(BedrockToolResult {
							tool_use_id: id,
							content: vec![ToolResultContent {
								text: Some(
									msg.content.as_ref().map(|c| c.as_text()).unwrap_or_default(),
								),
							}],
						}),
						..Default::default()
					}],
				});
			},
			role => {
				let mut content = Vec::new();
				if let Some(c) = &msg.content {
					let text = c.as_text();
					if !text.is_empty() {
						content.push(BedrockContent {
							text: Some(text),
							..Default::default()
						});
					}
				}
				if let Some(tool_calls) = &msg.tool_calls {
					for call in tool_calls {
						content.push(BedrockContent {
							tool_use: Some(to_tool_use(call)?),
							..Default::default()
						});
					}
				}
				if content.is_empty() {
					continue;
				}
				messages.push(BedrockMessage {
					role: if role == "assistant" { "assistant" } else { "user" }.to_string(),
					content,
				});
			},
		}
	}

	let inference_config = {
		let max_tokens = req.max_completion_tokens.or(req.max_tokens);
		let stop_sequences = req.stop.as_ref().map(|s| s.to_vec()).unwrap_or_default();
		if max_tokens.is_none()
			&& req.temperature.is_none()
			&& req.top_p.is_none()
			&& stop_sequences.is_empty()
		{
			None
		} else {
			Some(InferenceConfig {
				max_tokens,
				temperature: req.temperature,
				top_p: req.top_p,
				stop_sequences,
			})
		}
	};

	Ok(ConverseRequest {
		messages,
		system,
		inference_config,
		tool_config: to_tool_config(req),
	})
}

fn to_tool_use(call: &ToolCall) -> Result<BedrockToolUse, Error> {
	// OpenAI carries arguments as a JSON-encoded string; Converse wants the
	// object itself.
	let input = serde_json::from_str(&call.function.arguments)
		.unwrap_or(Value::String(call.function.arguments.clone()));
	Ok(BedrockToolUse {
		tool_use_id: call.id.clone(),
		name: call.function.name.clone(),
		input,
	})
}

fn to_tool_config(req: &ChatCompletionRequest) -> Option<ToolConfig> {
	let tools = req.tools.as_ref()?;
	if tools.is_empty() {
		return None;
	}
	if req.tool_choice.as_ref().and_then(Value::as_str) == Some("none") {
		return None;
	}
	let specs = tools
		.iter()
		.map(|t| BedrockTool {
			tool_spec: BedrockToolSpec {
				name: t.function.name.clone(),
				description: t.function.description.clone(),
				input_schema: BedrockToolSchema {
					json: t.function.parameters.clone().unwrap_or(Value::Null),
				},
			},
		})
		.collect();
	let tool_choice = match &req.tool_choice {
		Some(Value::String(s)) if s == "required" || s == "any" => {
			Some(serde_json::json!({"any": {}}))
		},
		Some(Value::String(s)) if s == "auto" => Some(serde_json::json!({"auto": {}})),
		Some(Value::Object(o)) => o
			.get("function")
			.and_then(|f| f.get("name"))
			.and_then(Value::as_str)
			.map(|name| serde_json::json!({"tool": {"name": name}})),
		_ => None,
	};
	Some(ToolConfig {
		tools: specs,
		tool_choice,
	})
}

fn from_bedrock_message(message: &BedrockMessage) -> Result<ChatMessage, Error> {
	let mut text = String::new();
	let mut tool_calls = Vec::new();
	for block in &message.content {
		if let Some(t) = &block.text {
			text.push_str(t);
		}
		if let Some(tool) = &block.tool_use {
			tool_calls.push(ToolCall {
				id: tool.tool_use_id.clone(),
				kind: "function".to_string(),
				function: ToolCallFunction {
					name: tool.name.clone(),
					arguments: serde_json::to_string(&tool.input)
						.map_err(|e| Error::Translate(format!("invalid tool input: {e}")))?,
				},
			});
		}
	}
	Ok(ChatMessage {
		role: "assistant".to_string(),
		content: if text.is_empty() && !tool_calls.is_empty() {
			None
		} else {
			Some(MessageContent::Text(text))
		},
		name: None,
		tool_calls: if tool_calls.is_empty() {
			None
		} else {
			Some(tool_calls)
		},
		tool_call_id: None,
	})
}

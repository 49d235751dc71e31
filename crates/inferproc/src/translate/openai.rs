//! OpenAI → OpenAI translation: the identity on bodies, with token-usage
//! extraction from the `usage` field (JSON responses) or the final usage
//! chunk (streamed responses).

use std::collections::HashMap;

use bytes::BytesMut;

use crate::envoy::{BodyMutation, HeaderMutation};
use crate::error::Error;
use crate::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
	EmbeddingsRequest, EmbeddingsResponse};
use crate::translate::sse::{data_payload, SseBuffer};
use crate::translate::{BodyTransform, ChatTranslator, EmbeddingsTranslator, TokenUsage};

#[derive(Debug, Default)]
pub struct OpenAiChatTranslator {
	stream: bool,
	usage_reported: bool,
	buffered: BytesMut,
	sse: SseBuffer,
}

impl ChatTranslator for OpenAiChatTranslator {
	fn request_body(
		&mut self,
		req: &ChatCompletionRequest,
	) -> Result<(HeaderMutation, Option<BodyMutation>), Error> {
		self.stream = req.stream;
		// Same schema on both sides; the proxy forwards the original bytes.
		Ok((HeaderMutation::default(), None))
	}

	fn response_headers(
		&mut self,
		_headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error> {
		Ok(HeaderMutation::default())
	}

	fn response_body(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
		end_of_stream: bool,
	) -> Result<BodyTransform, Error> {
		if !is_success(headers) {
			// Upstream error payloads are already OpenAI-shaped; forward them.
			return Ok(BodyTransform::default());
		}
		if self.stream {
			self.stream_body(body, end_of_stream)
		} else {
			self.json_body(body, end_of_stream)
		}
	}
}

impl OpenAiChatTranslator {
	fn json_body(&mut self, body: &[u8], end_of_stream: bool) -> Result<BodyTransform, Error> {
		self.buffered.extend_from_slice(body);
		if !end_of_stream || self.buffered.is_empty() {
			return Ok(BodyTransform::default());
		}
		let resp: ChatCompletionResponse = serde_json::from_slice(&self.buffered)
			.map_err(|e| Error::Translate(format!("invalid chat completion response: {e}")))?;
		Ok(BodyTransform {
			usage: self.take_usage(resp.usage.map(Into::into)),
			..Default::default()
		})
	}

	fn stream_body(&mut self, body: &[u8], end_of_stream: bool) -> Result<BodyTransform, Error> {
		self.sse.push(body);
		let mut usage = TokenUsage::default();
		while let Some(record) = self.sse.next_record() {
			let Some(data) = data_payload(&record) else {
				continue;
			};
			if data.trim() == "[DONE]" {
				continue;
			}
			let chunk: ChatCompletionChunk = serde_json::from_str(&data)
				.map_err(|e| Error::Translate(format!("invalid chat completion chunk: {e}")))?;
			usage += self.take_usage(chunk.usage.map(Into::into));
		}
		if end_of_stream && !self.sse.is_drained() {
			return Err(Error::Translate(
				"stream ended with an incomplete event record".into(),
			));
		}
		Ok(BodyTransform {
			usage,
			..Default::default()
		})
	}

	fn take_usage(&mut self, usage: Option<TokenUsage>) -> TokenUsage {
		match usage {
			Some(u) if !self.usage_reported => {
				self.usage_reported = true;
				u
			},
			_ => TokenUsage::default(),
		}
	}
}

impl From<crate::openai::Usage> for TokenUsage {
	fn from(u: crate::openai::Usage) -> Self {
		TokenUsage {
			input_tokens: u.prompt_tokens,
			output_tokens: u.completion_tokens,
			total_tokens: u.total_tokens,
		}
	}
}

fn is_success(headers: &HashMap<String, String>) -> bool {
	headers.get(":status").map(String::as_str).unwrap_or("200") == "200"
}

#[derive(Debug, Default)]
pub struct OpenAiEmbeddingsTranslator {
	usage_reported: bool,
	buffered: BytesMut,
}

impl EmbeddingsTranslator for OpenAiEmbeddingsTranslator {
	fn request_body(
		&mut self,
		_req: &EmbeddingsRequest,
	) -> Result<(HeaderMutation, Option<BodyMutation>), Error> {
		Ok((HeaderMutation::default(), None))
	}

	fn response_headers(
		&mut self,
		_headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error> {
		Ok(HeaderMutation::default())
	}

	fn response_body(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
		end_of_stream: bool,
	) -> Result<BodyTransform, Error> {
		self.buffered.extend_from_slice(body);
		if !end_of_stream || self.buffered.is_empty() || !is_success(headers) {
			return Ok(BodyTransform::default());
		}
		let resp: EmbeddingsResponse = serde_json::from_slice(&self.buffered)
			.map_err(|e| Error::Translate(format!("invalid embeddings response: {e}")))?;
		let usage = match resp.usage {
			Some(u) if !self.usage_reported => {
				self.usage_reported = true;
				TokenUsage {
					input_tokens: u.prompt_tokens,
					output_tokens: 0,
					total_tokens: u.total_tokens,
				}
			},
			_ => TokenUsage::default(),
		};
		Ok(BodyTransform {
			usage,
			..Default::default()
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(stream: bool) -> ChatCompletionRequest {
		serde_json::from_value(serde_json::json!({
			"model": "gpt-4o-mini",
			"messages": [{"role": "user", "content": "hi"}],
			"stream": stream,
		}))
		.unwrap()
	}

	fn ok_headers() -> HashMap<String, String> {
		[(":status".to_string(), "200".to_string())].into()
	}

	#[test]
	fn request_is_identity() {
		let mut t = OpenAiChatTranslator::default();
		let (headers, body) = t.request_body(&request(false)).unwrap();
		assert!(headers.set_headers.is_empty());
		assert!(headers.remove_headers.is_empty());
		assert!(body.is_none());
	}

	#[test]
	fn json_response_usage() {
		let mut t = OpenAiChatTranslator::default();
		t.request_body(&request(false)).unwrap();
		let body = serde_json::json!({
			"id": "chatcmpl-1", "object": "chat.completion", "created": 1,
			"model": "gpt-4o-mini",
			"choices": [{"index": 0, "message": {"role": "assistant", "content": "hey"},
				"finish_reason": "stop"}],
			"usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13},
		});
		let out = t
			.response_body(&ok_headers(), body.to_string().as_bytes(), true)
			.unwrap();
		assert!(out.body.is_none());
		assert_eq!(out.usage.input_tokens, 10);
		assert_eq!(out.usage.output_tokens, 3);
		assert_eq!(out.usage.total_tokens, 13);
	}

	#[test]
	fn json_response_buffers_across_events() {
		let mut t = OpenAiChatTranslator::default();
		t.request_body(&request(false)).unwrap();
		let body = serde_json::json!({
			"id": "x", "object": "chat.completion", "created": 1, "model": "m",
			"choices": [],
			"usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3},
		})
		.to_string();
		let (a, b) = body.as_bytes().split_at(body.len() / 2);
		let first = t.response_body(&ok_headers(), a, false).unwrap();
		assert_eq!(first.usage, TokenUsage::default());
		let second = t.response_body(&ok_headers(), b, true).unwrap();
		assert_eq!(second.usage.total_tokens, 3);
	}

	#[test]
	fn stream_usage_reported_once() {
		let mut t = OpenAiChatTranslator::default();
		t.request_body(&request(true)).unwrap();
		let chunk = |usage: bool| {
			let mut v = serde_json::json!({
				"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
				"choices": [{"index": 0, "delta": {"content": "x"}, "finish_reason": null}],
			});
			if usage {
				v["usage"] =
					serde_json::json!({"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12});
			}
			format!("data: {v}\n\n")
		};
		let first = t
			.response_body(&ok_headers(), chunk(false).as_bytes(), false)
			.unwrap();
		assert_eq!(first.usage, TokenUsage::default());
		let payload = format!("{}data: [DONE]\n\n", chunk(true));
		let last = t
			.response_body(&ok_headers(), payload.as_bytes(), true)
			.unwrap();
		assert_eq!(last.usage.input_tokens, 5);
		assert_eq!(last.usage.total_tokens, 12);
	}

	#[test]
	fn stream_incomplete_framing_is_fatal() {
		let mut t = OpenAiChatTranslator::default();
		t.request_body(&request(true)).unwrap();
		let out = t.response_body(&ok_headers(), b"data: {\"id\"", true);
		assert!(matches!(out, Err(Error::Translate(_))));
	}

	#[test]
	fn empty_final_body_is_clean() {
		let mut t = OpenAiChatTranslator::default();
		t.request_body(&request(false)).unwrap();
		let out = t.response_body(&ok_headers(), b"", true).unwrap();
		assert!(out.body.is_none());
		assert_eq!(out.usage, TokenUsage::default());
	}

	#[test]
	fn error_response_passes_through_unparsed() {
		let mut t = OpenAiChatTranslator::default();
		t.request_body(&request(true)).unwrap();
		let headers: HashMap<String, String> =
			[(":status".to_string(), "429".to_string())].into();
		// A 429 JSON error on a streaming request must not go through the SSE
		// parser.
		let out = t
			.response_body(&headers, br#"{"error":{"message":"rate limited"}}"#, true)
			.unwrap();
		assert!(out.body.is_none());
	}

	#[test]
	fn embeddings_usage() {
		let mut t = OpenAiEmbeddingsTranslator::default();
		let body = serde_json::json!({
			"object": "list", "data": [], "model": "text-embedding-3-small",
			"usage": {"prompt_tokens": 8, "total_tokens": 8},
		});
		let out = t
			.response_body(&ok_headers(), body.to_string().as_bytes(), true)
			.unwrap();
		assert_eq!(out.usage.input_tokens, 8);
		assert_eq!(out.usage.output_tokens, 0);
		assert_eq!(out.usage.total_tokens, 8);
	}

	#[test]
	fn parse_failure_is_translate_error() {
		let mut t = OpenAiChatTranslator::default();
		t.request_body(&request(false)).unwrap();
		assert!(matches!(
			t.response_body(&ok_headers(), b"not json", true),
			Err(Error::Translate(_))
		));
	}
}

//! The chat-completion per-stream processor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{FilterConfig, ORIGINAL_DESTINATION_CLUSTER};
use crate::compression::decode_body;
use crate::envoy::{
	headers_to_map, immediate_response, processing_mode, request_body_response,
	request_headers_response, response_body_response, response_headers_response, set_header,
	CommonResponse, EnvoyHeaderMap, HttpBody, ProcessingMode, ProcessingResponse, StatusCode,
};
use crate::error::Error;
use crate::metrics::StreamMetrics;
use crate::openai::ChatCompletionRequest;
use crate::picker::EndpointPicker;
use crate::proc::{build_cost_metadata, with_deadline, Phase, Processor};
use crate::router;
use crate::translate::{chat_translator_for, ChatTranslator, TokenUsage};

pub struct ChatCompletionProcessor {
	config: Arc<FilterConfig>,
	request_headers: HashMap<String, String>,
	response_headers: HashMap<String, String>,
	response_encoding: String,
	translator: Option<Box<dyn ChatTranslator>>,
	stream: bool,
	costs: TokenUsage,
	metrics: StreamMetrics,
	// Retained so a future failover design can re-route on 5xx response
	// headers through the same picker.
	// TODO: drive a re-route from 5xx response headers via this handle once
	// the proxy-side retry budget story is settled.
	#[allow(dead_code)]
	dynamic: Option<Arc<dyn EndpointPicker>>,
	phase: Phase,
}

impl ChatCompletionProcessor {
	pub fn new(
		config: Arc<FilterConfig>,
		request_headers: HashMap<String, String>,
		metrics: StreamMetrics,
	) -> Self {
		Self {
			config,
			request_headers,
			response_headers: HashMap::new(),
			response_encoding: String::new(),
			translator: None,
			stream: false,
			costs: TokenUsage::default(),
			metrics,
			dynamic: None,
			phase: Phase::Start,
		}
	}

	fn expect_phase(&mut self, allowed: &[Phase], event: &'static str) -> Result<(), Error> {
		if allowed.contains(&self.phase) {
			return Ok(());
		}
		Err(Error::OutOfOrder {
			phase: self.phase.as_str(),
			event,
		})
	}

	fn fail(&mut self, err: Error) -> Error {
		self.metrics.record_completion(false);
		self.phase = Phase::Closed;
		err
	}

	async fn handle_request_body(&mut self, body: HttpBody) -> Result<ProcessingResponse, Error> {
		let config = self.config.clone();
		let req: ChatCompletionRequest =
			serde_json::from_slice(&body.body).map_err(Error::ParseRequest)?;
		info!(
			path = %self.request_headers.get(":path").map(String::as_str).unwrap_or(""),
			model = %req.model,
			"processing request body"
		);

		self.metrics.set_model(&req.model);
		self.request_headers
			.insert(config.model_name_header_key.clone(), req.model.clone());

		let backend = match router::calculate(&config, &self.request_headers) {
			Ok(backend) => backend.clone(),
			Err(err @ Error::NoMatchingRule(_)) => {
				self.metrics.record_completion(false);
				self.phase = Phase::Closed;
				return Ok(immediate_response(StatusCode::NotFound, err.to_string()));
			},
			Err(err) => return Err(err),
		};

		let mut extra_headers = Vec::new();
		let selected_backend_value = match &backend.dynamic {
			Some(picker) => {
				let picked = with_deadline(
					"endpoint picker",
					Error::SelectorUnavailable,
					picker.pick(&req.model),
				)
				.await?;
				extra_headers = picked.headers;
				self.dynamic = Some(picker.clone() as Arc<dyn EndpointPicker>);
				ORIGINAL_DESTINATION_CLUSTER.to_string()
			},
			None => backend.name.clone(),
		};
		info!(backend = %backend.name, schema = %backend.schema.name, "selected backend");
		self.metrics.set_backend(&backend.name);
		self.request_headers.insert(
			config.selected_backend_header_key.clone(),
			selected_backend_value.clone(),
		);

		let mut translator = chat_translator_for(&backend.schema)?;
		let (mut header_mutation, body_mutation) = translator.request_body(&req)?;
		self.stream = req.stream;
		self.translator = Some(translator);

		set_header(
			&mut header_mutation,
			&config.model_name_header_key,
			req.model.as_bytes(),
		);
		set_header(
			&mut header_mutation,
			&config.selected_backend_header_key,
			selected_backend_value.as_bytes(),
		);
		for (name, value) in extra_headers {
			set_header(&mut header_mutation, &name, value.as_bytes());
		}

		// Cluster-routed backends attach credentials here; dynamic endpoints
		// carry their own.
		if backend.dynamic.is_none() {
			if let Some(handler) = config.auth_handlers.get(&backend.name) {
				with_deadline(
					"auth handler",
					Error::AuthHandler,
					handler.inject(&self.request_headers, &mut header_mutation, &body_mutation),
				)
				.await?;
			}
		}

		self.phase = Phase::Routed;
		// The mutated headers changed the route; the proxy must re-match.
		Ok(request_body_response(CommonResponse {
			header_mutation: Some(header_mutation),
			body_mutation,
			clear_route_cache: true,
			..Default::default()
		}))
	}

	fn handle_response_headers(
		&mut self,
		headers: Option<&EnvoyHeaderMap>,
	) -> Result<ProcessingResponse, Error> {
		self.response_headers = headers_to_map(headers);
		if let Some(encoding) = self.response_headers.get("content-encoding") {
			self.response_encoding = encoding.clone();
		}
		self.phase = Phase::RespHeadersSeen;

		// A previous filter may have answered without our request-body event
		// ever firing; in that case there is nothing to translate.
		let Some(translator) = self.translator.as_mut() else {
			return Ok(response_headers_response(None, None));
		};
		let mutation = translator.response_headers(&self.response_headers)?;

		let mode_override = if self.stream && status(&self.response_headers) == "200" {
			Some(ProcessingMode {
				response_body_mode: processing_mode::BodySendMode::Streamed.into(),
				..Default::default()
			})
		} else {
			None
		};
		Ok(response_headers_response(
			Some(CommonResponse {
				header_mutation: Some(mutation),
				..Default::default()
			}),
			mode_override,
		))
	}

	fn handle_response_body(&mut self, body: HttpBody) -> Result<ProcessingResponse, Error> {
		let decoded = decode_body(&self.response_encoding, &body.body)?;

		let Some(translator) = self.translator.as_mut() else {
			if body.end_of_stream {
				self.metrics.record_completion(true);
				self.phase = Phase::Closed;
			}
			return Ok(response_body_response(None));
		};
		let transform =
			translator.response_body(&self.response_headers, &decoded, body.end_of_stream)?;

		// TODO: decide whether interim usage chunks should be configurable
		// per backend; today deltas are summed and translators report usage
		// at most once, which is correct for both final-only and
		// interim-usage backends.
		self.costs += transform.usage;
		self.metrics.record_token_usage(
			transform.usage.input_tokens,
			transform.usage.output_tokens,
			transform.usage.total_tokens,
		);
		if self.stream {
			self.metrics
				.record_token_latency(transform.usage.output_tokens);
		}

		let mut response = response_body_response(Some(CommonResponse {
			header_mutation: Some(transform.headers),
			body_mutation: transform.body,
			..Default::default()
		}));
		if body.end_of_stream {
			response.dynamic_metadata = build_cost_metadata(&self.config, &self.request_headers, &self.costs)
				.map(to_envoy_struct);
			self.metrics.record_completion(true);
			self.phase = Phase::Closed;
		}
		Ok(response)
	}
}

#[async_trait]
impl Processor for ChatCompletionProcessor {
	async fn request_headers(&mut self) -> Result<ProcessingResponse, Error> {
		self.expect_phase(&[Phase::Start], "request-headers")
			.map_err(|e| self.fail(e))?;
		self.metrics.start_request();
		self.phase = Phase::HeadersSeen;
		Ok(request_headers_response())
	}

	async fn request_body(&mut self, body: HttpBody) -> Result<ProcessingResponse, Error> {
		self.expect_phase(&[Phase::HeadersSeen], "request-body")
			.map_err(|e| self.fail(e))?;
		match self.handle_request_body(body).await {
			Ok(response) => Ok(response),
			Err(err) => Err(self.fail(err)),
		}
	}

	async fn response_headers(
		&mut self,
		headers: Option<&EnvoyHeaderMap>,
	) -> Result<ProcessingResponse, Error> {
		self.expect_phase(&[Phase::HeadersSeen, Phase::Routed], "response-headers")
			.map_err(|e| self.fail(e))?;
		match self.handle_response_headers(headers) {
			Ok(response) => Ok(response),
			Err(err) => Err(self.fail(err)),
		}
	}

	async fn response_body(&mut self, body: HttpBody) -> Result<ProcessingResponse, Error> {
		self.expect_phase(&[Phase::RespHeadersSeen], "response-body")
			.map_err(|e| self.fail(e))?;
		match self.handle_response_body(body) {
			Ok(response) => Ok(response),
			Err(err) => Err(self.fail(err)),
		}
	}
}

fn status(headers: &HashMap<String, String>) -> &str {
	headers.get(":status").map(String::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
	use envoy_types::pb::google::protobuf::value::Kind;
	use prometheus_client::registry::Registry;

	use super::*;
	use crate::envoy::{header_map, processing_response, HeaderMutation};
	use crate::metrics::Metrics;

	const CONFIG: &str = r#"
schema:
  name: OpenAI
rules:
  - headers:
      - name: x-ai-eg-model
        type: Exact
        value: gpt-4o-mini
    backends:
      - name: openai
        schema:
          name: OpenAI
        auth:
          apiKey:
            inline: sk-test
  - headers:
      - name: x-ai-eg-model
        type: Exact
        value: llama3-70b
    backends:
      - name: aws-bedrock
        schema:
          name: AWSBedrock
llmRequestCosts:
  - metadataKey: input
    type: InputToken
  - metadataKey: c
    type: CEL
    cel: "input_tokens * 2 + output_tokens"
"#;

	fn processor() -> ChatCompletionProcessor {
		processor_with(CONFIG)
	}

	fn processor_with(yaml: &str) -> ChatCompletionProcessor {
		let config = Arc::new(FilterConfig::from_yaml(yaml).unwrap());
		let mut registry = Registry::default();
		let metrics = Arc::new(Metrics::new(&mut registry));
		let request_headers: HashMap<String, String> = [
			(":method".to_string(), "POST".to_string()),
			(":path".to_string(), "/v1/chat/completions".to_string()),
			("x-request-id".to_string(), "req-1".to_string()),
		]
		.into();
		ChatCompletionProcessor::new(config, request_headers, StreamMetrics::new(metrics))
	}

	fn body(bytes: &[u8], end_of_stream: bool) -> HttpBody {
		HttpBody {
			body: bytes.to_vec(),
			end_of_stream,
			..Default::default()
		}
	}

	fn request_json(model: &str, stream: bool) -> Vec<u8> {
		serde_json::json!({
			"model": model,
			"messages": [{"role": "user", "content": "hi"}],
			"stream": stream,
		})
		.to_string()
		.into_bytes()
	}

	fn header_mutation_of(response: &ProcessingResponse) -> &HeaderMutation {
		let common = match response.response.as_ref().unwrap() {
			processing_response::Response::RequestBody(b) => b.response.as_ref().unwrap(),
			processing_response::Response::ResponseHeaders(h) => h.response.as_ref().unwrap(),
			other => panic!("unexpected response {other:?}"),
		};
		common.header_mutation.as_ref().unwrap()
	}

	fn mutated(response: &ProcessingResponse, key: &str) -> Option<String> {
		header_mutation_of(response).set_headers.iter().find_map(|h| {
			let header = h.header.as_ref()?;
			(header.key == key).then(|| String::from_utf8_lossy(&header.raw_value).into_owned())
		})
	}

	#[tokio::test]
	async fn openai_passthrough_binds_backend_and_headers() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		let response = p
			.request_body(body(&request_json("gpt-4o-mini", false), true))
			.await
			.unwrap();

		assert_eq!(mutated(&response, "x-ai-eg-model").unwrap(), "gpt-4o-mini");
		assert_eq!(mutated(&response, "x-ai-eg-selected-backend").unwrap(), "openai");
		assert_eq!(mutated(&response, "authorization").unwrap(), "Bearer sk-test");

		let common = match response.response.as_ref().unwrap() {
			processing_response::Response::RequestBody(b) => b.response.as_ref().unwrap(),
			_ => panic!("expected request body response"),
		};
		assert!(common.clear_route_cache);
		// OpenAI to OpenAI is pass-through: no body mutation.
		assert!(common.body_mutation.is_none());
	}

	#[tokio::test]
	async fn full_stream_attaches_cost_metadata() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		p.request_body(body(&request_json("gpt-4o-mini", false), true))
			.await
			.unwrap();
		p.response_headers(Some(&header_map([
			(":status", "200"),
			("content-type", "application/json"),
		])))
		.await
		.unwrap();

		let upstream = serde_json::json!({
			"id": "chatcmpl-1", "object": "chat.completion", "created": 1,
			"model": "gpt-4o-mini",
			"choices": [{"index": 0, "message": {"role": "assistant", "content": "hey"},
				"finish_reason": "stop"}],
			"usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13},
		});
		let response = p
			.response_body(body(upstream.to_string().as_bytes(), true))
			.await
			.unwrap();

		let metadata = response.dynamic_metadata.unwrap();
		let ns = &metadata.fields["io.inferrouter.llm"];
		let Some(Kind::StructValue(inner)) = &ns.kind else {
			panic!("expected nested struct");
		};
		let value = |key: &str| match inner.fields[key].kind.as_ref().unwrap() {
			Kind::NumberValue(v) => *v,
			_ => panic!("expected number"),
		};
		assert_eq!(value("input"), 10.0);
		assert_eq!(value("c"), 23.0);
	}

	#[tokio::test]
	async fn no_match_is_an_immediate_404() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		let response = p
			.request_body(body(&request_json("unknown-model", false), true))
			.await
			.unwrap();
		match response.response.unwrap() {
			processing_response::Response::ImmediateResponse(ir) => {
				assert_eq!(ir.status.unwrap().code, StatusCode::NotFound as i32);
			},
			other => panic!("expected immediate response, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn bedrock_route_rewrites_path() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		let response = p
			.request_body(body(&request_json("llama3-70b", true), true))
			.await
			.unwrap();
		assert_eq!(
			mutated(&response, ":path").unwrap(),
			"/model/llama3-70b/converse-stream"
		);
		assert_eq!(
			mutated(&response, "x-ai-eg-selected-backend").unwrap(),
			"aws-bedrock"
		);
	}

	#[tokio::test]
	async fn streaming_200_overrides_body_mode() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		p.request_body(body(&request_json("gpt-4o-mini", true), true))
			.await
			.unwrap();
		let response = p
			.response_headers(Some(&header_map([(":status", "200")])))
			.await
			.unwrap();
		let mode = response.mode_override.unwrap();
		assert_eq!(
			mode.response_body_mode,
			i32::from(processing_mode::BodySendMode::Streamed)
		);
	}

	#[tokio::test]
	async fn non_streaming_does_not_override_mode() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		p.request_body(body(&request_json("gpt-4o-mini", false), true))
			.await
			.unwrap();
		let response = p
			.response_headers(Some(&header_map([(":status", "200")])))
			.await
			.unwrap();
		assert!(response.mode_override.is_none());
	}

	#[tokio::test]
	async fn error_status_keeps_buffered_mode() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		p.request_body(body(&request_json("gpt-4o-mini", true), true))
			.await
			.unwrap();
		let response = p
			.response_headers(Some(&header_map([(":status", "429")])))
			.await
			.unwrap();
		assert!(response.mode_override.is_none());
	}

	#[tokio::test]
	async fn parse_error_is_fatal() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		let err = p.request_body(body(b"{not json", true)).await.unwrap_err();
		assert!(matches!(err, Error::ParseRequest(_)));
	}

	#[tokio::test]
	async fn out_of_order_events_are_fatal() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		let err = p.response_body(body(b"", true)).await.unwrap_err();
		assert!(matches!(err, Error::OutOfOrder { .. }));
	}

	#[tokio::test]
	async fn double_request_headers_is_fatal() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		assert!(matches!(
			p.request_headers().await,
			Err(Error::OutOfOrder { .. })
		));
	}

	#[tokio::test]
	async fn response_without_request_body_passes_through() {
		// An earlier filter answered before our request-body event fired.
		let mut p = processor();
		p.request_headers().await.unwrap();
		let headers = p
			.response_headers(Some(&header_map([(":status", "403")])))
			.await
			.unwrap();
		match headers.response.unwrap() {
			processing_response::Response::ResponseHeaders(h) => assert!(h.response.is_none()),
			other => panic!("unexpected {other:?}"),
		}
		let response = p.response_body(body(b"denied", true)).await.unwrap();
		match response.response.unwrap() {
			processing_response::Response::ResponseBody(b) => assert!(b.response.is_none()),
			other => panic!("unexpected {other:?}"),
		}
	}

	#[tokio::test]
	async fn empty_final_body_still_attaches_metadata() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		p.request_body(body(&request_json("gpt-4o-mini", true), true))
			.await
			.unwrap();
		p.response_headers(Some(&header_map([(":status", "200")])))
			.await
			.unwrap();
		// One usage-bearing chunk, then an empty final frame.
		let chunk = concat!(
			"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,",
			"\"model\":\"m\",\"choices\":[],",
			"\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
			"data: [DONE]\n\n"
		);
		p.response_body(body(chunk.as_bytes(), false)).await.unwrap();
		let last = p.response_body(body(b"", true)).await.unwrap();
		assert!(last.dynamic_metadata.is_some());
		match last.response.unwrap() {
			processing_response::Response::ResponseBody(b) => {
				let common = b.response.unwrap();
				assert!(common.body_mutation.is_none());
			},
			other => panic!("unexpected {other:?}"),
		}
	}

	#[tokio::test]
	async fn truncated_gzip_is_fatal() {
		let mut p = processor();
		p.request_headers().await.unwrap();
		p.request_body(body(&request_json("gpt-4o-mini", false), true))
			.await
			.unwrap();
		p.response_headers(Some(&header_map([
			(":status", "200"),
			("content-encoding", "gzip"),
		])))
		.await
		.unwrap();
		// Half a gzip stream.
		let err = p
			.response_body(body(&[0x1f, 0x8b, 0x08, 0x00, 0x01], true))
			.await
			.unwrap_err();
		assert!(matches!(err, Error::Decompress(_)));
	}

	#[tokio::test]
	async fn dynamic_backend_sets_original_destination() {
		let yaml = r#"
schema:
  name: OpenAI
rules:
  - headers:
      - name: x-ai-eg-model
        type: Exact
        value: self-hosted-llm
    backends:
      - name: self-hosted
        schema:
          name: OpenAI
        dynamicLoadBalancing:
          endpoints:
            - host: 10.0.0.1
              port: 8000
"#;
		let mut p = processor_with(yaml);
		p.request_headers().await.unwrap();
		let response = p
			.request_body(body(&request_json("self-hosted-llm", false), true))
			.await
			.unwrap();
		assert_eq!(
			mutated(&response, "x-ai-eg-selected-backend").unwrap(),
			"original_destination_cluster"
		);
		assert_eq!(
			mutated(&response, "x-envoy-original-dst-host").unwrap(),
			"10.0.0.1:8000"
		);
	}

	#[tokio::test]
	async fn gzip_json_response_is_decoded_for_translation() {
		use std::io::Write;

		let mut p = processor();
		p.request_headers().await.unwrap();
		p.request_body(body(&request_json("gpt-4o-mini", false), true))
			.await
			.unwrap();
		p.response_headers(Some(&header_map([
			(":status", "200"),
			("content-encoding", "gzip"),
		])))
		.await
		.unwrap();

		let upstream = serde_json::json!({
			"id": "x", "object": "chat.completion", "created": 1, "model": "m",
			"choices": [],
			"usage": {"prompt_tokens": 7, "completion_tokens": 1, "total_tokens": 8},
		})
		.to_string();
		let mut enc =
			flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
		enc.write_all(upstream.as_bytes()).unwrap();
		let compressed = enc.finish().unwrap();

		let response = p.response_body(body(&compressed, true)).await.unwrap();
		// input cost field proves the usage was read through the gzip layer.
		let metadata = response.dynamic_metadata.unwrap();
		let ns = &metadata.fields["io.inferrouter.llm"];
		let Some(Kind::StructValue(inner)) = &ns.kind else {
			panic!("expected nested struct");
		};
		match inner.fields["input"].kind.as_ref().unwrap() {
			Kind::NumberValue(v) => assert_eq!(*v, 7.0),
			_ => panic!("expected number"),
		}
	}
}

//! Per-stream processors.
//!
//! One processor instance is created per ext-proc stream from the registry
//! keyed on the request path, consumes the proxy's events strictly in order,
//! and produces exactly one response per event. The phase is explicit and
//! out-of-order events are fatal to the stream.

mod chat;
mod embeddings;
mod models;

pub use chat::ChatCompletionProcessor;
pub use embeddings::EmbeddingsProcessor;
pub use models::ModelsProcessor;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use prost_types::Struct;
use tracing::{error, warn};

use crate::config::{CostKind, FilterConfig, SchemaName};
use crate::envoy::{
	namespaced_metadata, request_body_response, request_headers_response,
	response_body_response, response_headers_response, CommonResponse, EnvoyHeaderMap, HttpBody,
	ProcessingResponse,
};
use crate::error::Error;
use crate::metrics::{Metrics, StreamMetrics};
use crate::translate::TokenUsage;

/// Deadline for auth-handler and endpoint-picker calls, which may perform
/// network I/O (STS, token exchange, cache fills).
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const EMBEDDINGS_PATH: &str = "/v1/embeddings";
pub const MODELS_PATH: &str = "/v1/models";

/// Stream phase. Transitions only move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Start,
	HeadersSeen,
	Routed,
	RespHeadersSeen,
	Closed,
}

impl Phase {
	pub fn as_str(&self) -> &'static str {
		match self {
			Phase::Start => "Start",
			Phase::HeadersSeen => "HeadersSeen",
			Phase::Routed => "Routed",
			Phase::RespHeadersSeen => "RespHeadersSeen",
			Phase::Closed => "Closed",
		}
	}
}

/// One per-stream processor. The server loop guarantees strictly serial
/// invocation in proxy event order.
#[async_trait]
pub trait Processor: Send {
	/// The request headers were captured at construction; this event only
	/// marks the start of the request.
	async fn request_headers(&mut self) -> Result<ProcessingResponse, Error>;

	async fn request_body(&mut self, body: HttpBody) -> Result<ProcessingResponse, Error>;

	async fn response_headers(
		&mut self,
		headers: Option<&EnvoyHeaderMap>,
	) -> Result<ProcessingResponse, Error>;

	async fn response_body(&mut self, body: HttpBody) -> Result<ProcessingResponse, Error>;
}

/// Build the processor for a request path. Unregistered paths get the
/// passthrough processor.
pub fn new_processor(
	config: Arc<FilterConfig>,
	path: &str,
	request_headers: HashMap<String, String>,
	metrics: Arc<Metrics>,
) -> Result<Box<dyn Processor>, Error> {
	let path = path.split('?').next().unwrap_or(path);
	match path {
		CHAT_COMPLETIONS_PATH => {
			require_openai_input(&config)?;
			Ok(Box::new(ChatCompletionProcessor::new(
				config,
				request_headers,
				StreamMetrics::new(metrics),
			)))
		},
		EMBEDDINGS_PATH => {
			require_openai_input(&config)?;
			Ok(Box::new(EmbeddingsProcessor::new(
				config,
				request_headers,
				StreamMetrics::new(metrics),
			)))
		},
		MODELS_PATH => Ok(Box::new(ModelsProcessor::new(
			config,
			StreamMetrics::new(metrics),
		))),
		_ => Ok(Box::new(PassthroughProcessor::new(StreamMetrics::new(
			metrics,
		)))),
	}
}

fn require_openai_input(config: &FilterConfig) -> Result<(), Error> {
	if config.schema.name != SchemaName::OpenAI {
		return Err(Error::UnsupportedSchema(config.schema.name.to_string()));
	}
	Ok(())
}

/// Bound a handler call by [`HANDLER_TIMEOUT`], mapping expiry to the given
/// error constructor.
pub async fn with_deadline<T>(
	what: &'static str,
	map_err: impl FnOnce(String) -> Error,
	fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
	match tokio::time::timeout(HANDLER_TIMEOUT, fut).await {
		Ok(result) => result,
		Err(_) => Err(map_err(format!("{what} deadline exceeded"))),
	}
}

/// Project accumulated token usage into the configured cost fields.
///
/// Expression failures are logged and the field omitted; the stream
/// continues. Values beyond u32 are clamped and logged.
pub fn build_cost_metadata(
	config: &FilterConfig,
	request_headers: &HashMap<String, String>,
	costs: &TokenUsage,
) -> Option<Struct> {
	if config.request_costs.is_empty() {
		return None;
	}
	let model = request_headers
		.get(&config.model_name_header_key)
		.map(String::as_str)
		.unwrap_or_default();
	let backend = request_headers
		.get(&config.selected_backend_header_key)
		.map(String::as_str)
		.unwrap_or_default();

	let mut fields = HashMap::with_capacity(config.request_costs.len());
	for cost in &config.request_costs {
		let value: u64 = match &cost.kind {
			CostKind::InputToken => u64::from(costs.input_tokens),
			CostKind::OutputToken => u64::from(costs.output_tokens),
			CostKind::TotalToken => u64::from(costs.total_tokens),
			CostKind::Cel(program) => {
				match program.evaluate(
					model,
					backend,
					u64::from(costs.input_tokens),
					u64::from(costs.output_tokens),
					u64::from(costs.total_tokens),
				) {
					Ok(value) => value,
					Err(e) => {
						error!(
							metadata_key = %cost.metadata_key,
							error = %e,
							"cost expression failed; omitting field"
						);
						continue;
					},
				}
			},
		};
		let clamped = if value > u64::from(u32::MAX) {
			warn!(
				metadata_key = %cost.metadata_key,
				value,
				"cost exceeds u32 range; clamping"
			);
			u32::MAX
		} else {
			value as u32
		};
		fields.insert(cost.metadata_key.clone(), clamped);
	}
	if fields.is_empty() {
		return None;
	}
	Some(namespaced_metadata(&config.metadata_namespace, fields))
}

/// Re-encode a `prost-types` `Struct` as the wire-identical `envoy-types`
/// `Struct` that [`ProcessingResponse::dynamic_metadata`] expects; the two
/// crates generate distinct Rust types from the same `google.protobuf.Struct`
/// schema, so the bytes round-trip losslessly.
pub fn to_envoy_struct(value: Struct) -> envoy_types::pb::google::protobuf::Struct {
	envoy_types::pb::google::protobuf::Struct::decode(prost::Message::encode_to_vec(&value).as_slice())
		.expect("prost_types::Struct and envoy_types::Struct share the same wire schema")
}

/// Default processor for paths without a registered factory: no mutation,
/// no translation, request-count metrics only.
pub struct PassthroughProcessor {
	metrics: StreamMetrics,
}

impl PassthroughProcessor {
	pub fn new(metrics: StreamMetrics) -> Self {
		Self { metrics }
	}
}

#[async_trait]
impl Processor for PassthroughProcessor {
	async fn request_headers(&mut self) -> Result<ProcessingResponse, Error> {
		self.metrics.start_request();
		Ok(request_headers_response())
	}

	async fn request_body(&mut self, _body: HttpBody) -> Result<ProcessingResponse, Error> {
		Ok(request_body_response(CommonResponse::default()))
	}

	async fn response_headers(
		&mut self,
		_headers: Option<&EnvoyHeaderMap>,
	) -> Result<ProcessingResponse, Error> {
		Ok(response_headers_response(None, None))
	}

	async fn response_body(&mut self, body: HttpBody) -> Result<ProcessingResponse, Error> {
		if body.end_of_stream {
			self.metrics.record_completion(true);
		}
		Ok(response_body_response(None))
	}
}

#[cfg(test)]
mod tests {
	use prometheus_client::registry::Registry;
	use prost_types::value::Kind;

	use super::*;
	use crate::config::FilterConfig;

	fn metrics() -> Arc<Metrics> {
		let mut registry = Registry::default();
		Arc::new(Metrics::new(&mut registry))
	}

	#[test]
	fn factory_dispatches_on_path() {
		let config = Arc::new(FilterConfig::from_yaml("schema:\n  name: OpenAI\n").unwrap());
		for path in [
			"/v1/chat/completions",
			"/v1/embeddings",
			"/v1/models",
			"/healthz",
			"/v1/chat/completions?beta=true",
		] {
			assert!(new_processor(config.clone(), path, HashMap::new(), metrics()).is_ok());
		}
	}

	#[test]
	fn non_openai_input_schema_is_rejected_at_construction() {
		let config = Arc::new(FilterConfig::from_yaml("schema:\n  name: Anthropic\n").unwrap());
		let err =
			new_processor(config, "/v1/chat/completions", HashMap::new(), metrics()).unwrap_err();
		assert!(matches!(err, Error::UnsupportedSchema(_)));
	}

	#[test]
	fn cost_metadata_scenario() {
		let config = FilterConfig::from_yaml(
			r#"
schema:
  name: OpenAI
llmRequestCosts:
  - metadataKey: input
    type: InputToken
  - metadataKey: c
    type: CEL
    cel: "input_tokens * 2 + output_tokens"
"#,
		)
		.unwrap();
		let headers: HashMap<String, String> = [
			("x-ai-eg-model".to_string(), "gpt-4o-mini".to_string()),
			("x-ai-eg-selected-backend".to_string(), "openai".to_string()),
		]
		.into();
		let costs = TokenUsage {
			input_tokens: 10,
			output_tokens: 3,
			total_tokens: 13,
		};
		let metadata = build_cost_metadata(&config, &headers, &costs).unwrap();
		let ns = &metadata.fields[&config.metadata_namespace];
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

	#[test]
	fn no_cost_rules_means_no_metadata() {
		let config = FilterConfig::from_yaml("schema:\n  name: OpenAI\n").unwrap();
		assert!(build_cost_metadata(&config, &HashMap::new(), &TokenUsage::default()).is_none());
	}

	#[test]
	fn failing_expression_omits_only_its_field() {
		let config = FilterConfig::from_yaml(
			r#"
schema:
  name: OpenAI
llmRequestCosts:
  - metadataKey: total
    type: TotalToken
  - metadataKey: broken
    type: CEL
    cel: "input_tokens - 1000000"
"#,
		)
		.unwrap();
		let costs = TokenUsage {
			input_tokens: 1,
			output_tokens: 1,
			total_tokens: 2,
		};
		let metadata = build_cost_metadata(&config, &HashMap::new(), &costs).unwrap();
		let ns = &metadata.fields[&config.metadata_namespace];
		let Some(Kind::StructValue(inner)) = &ns.kind else {
			panic!("expected nested struct");
		};
		assert!(inner.fields.contains_key("total"));
		assert!(!inner.fields.contains_key("broken"));
	}
}

//! The embeddings per-stream processor: the chat flow with an embeddings
//! body schema and no streaming.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::compression::decode_body;
use crate::config::{FilterConfig, ORIGINAL_DESTINATION_CLUSTER};
use crate::envoy::{
	headers_to_map, immediate_response, request_body_response, request_headers_response,
	response_body_response, response_headers_response, set_header, CommonResponse,
	EnvoyHeaderMap, HttpBody, ProcessingResponse, StatusCode,
};
use crate::error::Error;
use crate::metrics::StreamMetrics;
use crate::openai::EmbeddingsRequest;
use crate::picker::EndpointPicker;
use crate::proc::{build_cost_metadata, with_deadline, Phase, Processor};
use crate::router;
use crate::translate::{embeddings_translator_for, EmbeddingsTranslator, TokenUsage};

pub struct EmbeddingsProcessor {
	config: Arc<FilterConfig>,
	request_headers: HashMap<String, String>,
	response_headers: HashMap<String, String>,
	response_encoding: String,
	translator: Option<Box<dyn EmbeddingsTranslator>>,
	costs: TokenUsage,
	metrics: StreamMetrics,
	phase: Phase,
}

impl EmbeddingsProcessor {
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
			costs: TokenUsage::default(),
			metrics,
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
		let req: EmbeddingsRequest =
			serde_json::from_slice(&body.body).map_err(Error::ParseRequest)?;
		info!(model = %req.model, "processing embeddings request");

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

		let mut translator = embeddings_translator_for(&backend.schema)?;
		let (mut header_mutation, body_mutation) = translator.request_body(&req)?;
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

		let Some(translator) = self.translator.as_mut() else {
			return Ok(response_headers_response(None, None));
		};
		let mutation = translator.response_headers(&self.response_headers)?;
		Ok(response_headers_response(
			Some(CommonResponse {
				header_mutation: Some(mutation),
				..Default::default()
			}),
			None,
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
		self.costs += transform.usage;
		self.metrics.record_token_usage(
			transform.usage.input_tokens,
			transform.usage.output_tokens,
			transform.usage.total_tokens,
		);

		let mut response = response_body_response(Some(CommonResponse {
			header_mutation: Some(transform.headers),
			body_mutation: transform.body,
			..Default::default()
		}));
		if body.end_of_stream {
			response.dynamic_metadata =
				build_cost_metadata(&self.config, &self.request_headers, &self.costs);
			self.metrics.record_completion(true);
			self.phase = Phase::Closed;
		}
		Ok(response)
	}
}

#[async_trait]
impl Processor for EmbeddingsProcessor {
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

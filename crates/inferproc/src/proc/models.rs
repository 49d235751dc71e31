//! `/v1/models`: answered directly from the declared models, without ever
//! contacting a backend.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::config::FilterConfig;
use crate::envoy::{
	processing_response, set_header, EnvoyHeaderMap, HeaderMutation, HttpBody, HttpStatus,
	ImmediateResponse, ProcessingResponse, StatusCode,
};
use crate::error::Error;
use crate::metrics::StreamMetrics;
use crate::openai::{Model, ModelList};
use crate::proc::Processor;

pub struct ModelsProcessor {
	config: Arc<FilterConfig>,
	metrics: StreamMetrics,
	answered: bool,
}

impl ModelsProcessor {
	pub fn new(config: Arc<FilterConfig>, metrics: StreamMetrics) -> Self {
		Self {
			config,
			metrics,
			answered: false,
		}
	}
}

#[async_trait]
impl Processor for ModelsProcessor {
	async fn request_headers(&mut self) -> Result<ProcessingResponse, Error> {
		if self.answered {
			return Err(Error::OutOfOrder {
				phase: "Closed",
				event: "request-headers",
			});
		}
		self.answered = true;
		self.metrics.start_request();

		let created = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or_default();
		let list = ModelList {
			object: "list".to_string(),
			data: self
				.config
				.declared_models()
				.into_iter()
				.map(|id| Model {
					id,
					object: "model".to_string(),
					created,
					owned_by: "inferproc".to_string(),
				})
				.collect(),
		};
		let body = serde_json::to_string(&list)
			.map_err(|e| Error::Translate(format!("failed to encode model list: {e}")))?;

		let mut headers = HeaderMutation::default();
		set_header(&mut headers, "content-type", b"application/json");
		self.metrics.record_completion(true);
		Ok(ProcessingResponse {
			response: Some(processing_response::Response::ImmediateResponse(
				ImmediateResponse {
					status: Some(HttpStatus {
						code: StatusCode::Ok as i32,
					}),
					headers: Some(headers),
					body: body.into(),
					..Default::default()
				},
			)),
			..Default::default()
		})
	}

	async fn request_body(&mut self, _body: HttpBody) -> Result<ProcessingResponse, Error> {
		Err(Error::OutOfOrder {
			phase: "Closed",
			event: "request-body",
		})
	}

	async fn response_headers(
		&mut self,
		_headers: Option<&EnvoyHeaderMap>,
	) -> Result<ProcessingResponse, Error> {
		Err(Error::OutOfOrder {
			phase: "Closed",
			event: "response-headers",
		})
	}

	async fn response_body(&mut self, _body: HttpBody) -> Result<ProcessingResponse, Error> {
		Err(Error::OutOfOrder {
			phase: "Closed",
			event: "response-body",
		})
	}
}

//! OpenAI → Azure OpenAI translation.
//!
//! Azure speaks the OpenAI schema but scopes requests to a deployment and an
//! API version in the path, so only the request path changes; response
//! handling delegates to the OpenAI pass-through translator.

use std::collections::HashMap;

use crate::envoy::{set_header, BodyMutation, HeaderMutation};
use crate::error::Error;
use crate::openai::{ChatCompletionRequest, EmbeddingsRequest};
use crate::translate::openai::{OpenAiChatTranslator, OpenAiEmbeddingsTranslator};
use crate::translate::{BodyTransform, ChatTranslator, EmbeddingsTranslator};

#[derive(Debug)]
pub struct AzureChatTranslator {
	api_version: String,
	inner: OpenAiChatTranslator,
}

impl AzureChatTranslator {
	pub fn new(api_version: String) -> Self {
		Self {
			api_version,
			inner: OpenAiChatTranslator::default(),
		}
	}
}

impl ChatTranslator for AzureChatTranslator {
	fn request_body(
		&mut self,
		req: &ChatCompletionRequest,
	) -> Result<(HeaderMutation, Option<BodyMutation>), Error> {
		let (mut headers, body) = self.inner.request_body(req)?;
		let path = format!(
			"/openai/deployments/{}/chat/completions?api-version={}",
			req.model, self.api_version
		);
		set_header(&mut headers, ":path", path.as_bytes());
		Ok((headers, body))
	}

	fn response_headers(
		&mut self,
		headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error> {
		self.inner.response_headers(headers)
	}

	fn response_body(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
		end_of_stream: bool,
	) -> Result<BodyTransform, Error> {
		self.inner.response_body(headers, body, end_of_stream)
	}
}

#[derive(Debug)]
pub struct AzureEmbeddingsTranslator {
	api_version: String,
	inner: OpenAiEmbeddingsTranslator,
}

impl AzureEmbeddingsTranslator {
	pub fn new(api_version: String) -> Self {
		Self {
			api_version,
			inner: OpenAiEmbeddingsTranslator::default(),
		}
	}
}

impl EmbeddingsTranslator for AzureEmbeddingsTranslator {
	fn request_body(
		&mut self,
		req: &EmbeddingsRequest,
	) -> Result<(HeaderMutation, Option<BodyMutation>), Error> {
		let (mut headers, body) = self.inner.request_body(req)?;
		let path = format!(
			"/openai/deployments/{}/embeddings?api-version={}",
			req.model, self.api_version
		);
		set_header(&mut headers, ":path", path.as_bytes());
		Ok((headers, body))
	}

	fn response_headers(
		&mut self,
		headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error> {
		self.inner.response_headers(headers)
	}

	fn response_body(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
		end_of_stream: bool,
	) -> Result<BodyTransform, Error> {
		self.inner.response_body(headers, body, end_of_stream)
	}
}

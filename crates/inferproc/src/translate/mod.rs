//! Schema translators.
//!
//! A translator adapts one backend's native wire schema to the OpenAI shape
//! the client speaks: request bodies outbound, response headers and bodies
//! inbound. Translators are constructed per stream and are stateful across
//! response-body events (streamed responses arrive in arbitrary slices).

mod azure;
mod bedrock;
mod openai;
pub mod sse;

pub use azure::{AzureChatTranslator, AzureEmbeddingsTranslator};
pub use bedrock::BedrockChatTranslator;
pub use openai::{OpenAiChatTranslator, OpenAiEmbeddingsTranslator};

use std::collections::HashMap;
use std::ops::AddAssign;

use crate::config::{ApiSchema, SchemaName};
use crate::envoy::{BodyMutation, HeaderMutation};
use crate::error::Error;
use crate::openai::{ChatCompletionRequest, EmbeddingsRequest};

/// Token counts extracted from one translated response slice.
///
/// Streamed backends report usage on whichever record carries it; a
/// translator reports each logical response's usage at most once, so summing
/// deltas across events yields correct totals either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
	pub input_tokens: u32,
	pub output_tokens: u32,
	pub total_tokens: u32,
}

impl AddAssign for TokenUsage {
	fn add_assign(&mut self, rhs: Self) {
		self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
		self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
		self.total_tokens = self.total_tokens.saturating_add(rhs.total_tokens);
	}
}

/// The result of translating one response-body slice.
#[derive(Debug, Default)]
pub struct BodyTransform {
	pub headers: HeaderMutation,
	pub body: Option<BodyMutation>,
	pub usage: TokenUsage,
}

pub trait ChatTranslator: Send {
	/// Transform the parsed request into backend shape, yielding the header
	/// mutation (path/content-type overrides) and an optional replacement
	/// body. Pass-through translators return no body mutation.
	fn request_body(
		&mut self,
		req: &ChatCompletionRequest,
	) -> Result<(HeaderMutation, Option<BodyMutation>), Error>;

	/// Adjust response headers (content-type, backend framing headers).
	fn response_headers(
		&mut self,
		headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error>;

	/// Translate one decompressed response-body slice. Streaming translators
	/// buffer partial framing and must flush or fail on `end_of_stream`.
	fn response_body(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
		end_of_stream: bool,
	) -> Result<BodyTransform, Error>;
}

pub trait EmbeddingsTranslator: Send {
	fn request_body(
		&mut self,
		req: &EmbeddingsRequest,
	) -> Result<(HeaderMutation, Option<BodyMutation>), Error>;

	fn response_headers(
		&mut self,
		headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error>;

	fn response_body(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
		end_of_stream: bool,
	) -> Result<BodyTransform, Error>;
}

/// Select the chat-completion translator for a backend schema.
pub fn chat_translator_for(schema: &ApiSchema) -> Result<Box<dyn ChatTranslator>, Error> {
	match &schema.name {
		SchemaName::OpenAI => Ok(Box::new(OpenAiChatTranslator::default())),
		SchemaName::AwsBedrock => Ok(Box::new(BedrockChatTranslator::default())),
		SchemaName::AzureOpenAI => {
			let version = schema
				.version
				.clone()
				.ok_or_else(|| Error::UnsupportedSchema("AzureOpenAI without version".into()))?;
			Ok(Box::new(AzureChatTranslator::new(version)))
		},
		SchemaName::Other(name) => Err(Error::UnsupportedSchema(name.clone())),
	}
}

/// Select the embeddings translator for a backend schema. Bedrock embeddings
/// bodies are model-family specific and are not supported here.
pub fn embeddings_translator_for(
	schema: &ApiSchema,
) -> Result<Box<dyn EmbeddingsTranslator>, Error> {
	match &schema.name {
		SchemaName::OpenAI => Ok(Box::new(OpenAiEmbeddingsTranslator::default())),
		SchemaName::AzureOpenAI => {
			let version = schema
				.version
				.clone()
				.ok_or_else(|| Error::UnsupportedSchema("AzureOpenAI without version".into()))?;
			Ok(Box::new(AzureEmbeddingsTranslator::new(version)))
		},
		SchemaName::AwsBedrock => Err(Error::UnsupportedSchema(
			"AWSBedrock does not support the embeddings endpoint".into(),
		)),
		SchemaName::Other(name) => Err(Error::UnsupportedSchema(name.clone())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schema(name: SchemaName, version: Option<&str>) -> ApiSchema {
		ApiSchema {
			name,
			version: version.map(str::to_string),
		}
	}

	#[test]
	fn translator_selection() {
		assert!(chat_translator_for(&schema(SchemaName::OpenAI, None)).is_ok());
		assert!(chat_translator_for(&schema(SchemaName::AwsBedrock, None)).is_ok());
		assert!(
			chat_translator_for(&schema(SchemaName::AzureOpenAI, Some("2024-02-01"))).is_ok()
		);
		assert!(matches!(
			chat_translator_for(&schema(SchemaName::AzureOpenAI, None)),
			Err(Error::UnsupportedSchema(_))
		));
		assert!(matches!(
			chat_translator_for(&schema(SchemaName::Other("Anthropic".into()), None)),
			Err(Error::UnsupportedSchema(_))
		));
	}

	#[test]
	fn embeddings_selection_excludes_bedrock() {
		assert!(embeddings_translator_for(&schema(SchemaName::OpenAI, None)).is_ok());
		assert!(matches!(
			embeddings_translator_for(&schema(SchemaName::AwsBedrock, None)),
			Err(Error::UnsupportedSchema(_))
		));
	}

	#[test]
	fn usage_accumulates_saturating() {
		let mut total = TokenUsage::default();
		total += TokenUsage {
			input_tokens: 10,
			output_tokens: 3,
			total_tokens: 13,
		};
		total += TokenUsage {
			input_tokens: 0,
			output_tokens: 2,
			total_tokens: 2,
		};
		assert_eq!(total.input_tokens, 10);
		assert_eq!(total.output_tokens, 5);
		assert_eq!(total.total_tokens, 15);
	}
}

use envoy_types::pb::envoy::r#type::v3::StatusCode;

/// Errors surfaced by the per-stream processing pipeline.
///
/// Everything except [`Error::Evaluate`] terminates the stream it occurred
/// on; nothing here ever crosses stream boundaries or aborts the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unsupported API schema: {0}")]
	UnsupportedSchema(String),
	#[error("failed to parse request body: {0}")]
	ParseRequest(#[source] serde_json::Error),
	#[error("no matching routing rule: {0}")]
	NoMatchingRule(String),
	#[error("failed to compute route: {0}")]
	RouteCompute(String),
	#[error("failed to translate: {0}")]
	Translate(String),
	#[error("failed to decompress response body: {0}")]
	Decompress(#[source] std::io::Error),
	#[error("backend auth handler failed: {0}")]
	AuthHandler(String),
	#[error("dynamic endpoint picker unavailable: {0}")]
	SelectorUnavailable(String),
	#[error("failed to evaluate cost expression: {0}")]
	Evaluate(#[from] llmcost_core::CostError),
	#[error("unexpected {event} event in phase {phase}")]
	OutOfOrder {
		phase: &'static str,
		event: &'static str,
	},
}

impl Error {
	/// The HTTP status reported to the client when this error terminates
	/// the stream.
	pub fn status(&self) -> StatusCode {
		match self {
			Error::UnsupportedSchema(_) => StatusCode::BadRequest,
			Error::ParseRequest(_) => StatusCode::BadRequest,
			Error::NoMatchingRule(_) => StatusCode::NotFound,
			Error::RouteCompute(_) => StatusCode::InternalServerError,
			Error::Translate(_) => StatusCode::InternalServerError,
			Error::Decompress(_) => StatusCode::InternalServerError,
			Error::AuthHandler(_) => StatusCode::BadGateway,
			Error::SelectorUnavailable(_) => StatusCode::ServiceUnavailable,
			Error::Evaluate(_) => StatusCode::InternalServerError,
			Error::OutOfOrder { .. } => StatusCode::InternalServerError,
		}
	}
}

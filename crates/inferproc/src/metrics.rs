//! Gen-AI request metrics.
//!
//! Families follow the OpenTelemetry gen-ai semantic conventions for bucket
//! layout. Label cardinality is bounded to {model, backend, success}; both
//! label values default to "unknown" until the stream resolves them.

use std::sync::Arc;
use std::time::Instant;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

const UNKNOWN: &str = "unknown";

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct GenAiLabels {
	pub model: String,
	pub backend: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct CompletionLabels {
	pub model: String,
	pub backend: String,
	pub success: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct TokenUsageLabels {
	pub token_type: String,
	pub model: String,
	pub backend: String,
}

#[derive(Debug)]
pub struct Metrics {
	requests: Family<CompletionLabels, Counter>,
	request_duration: Family<GenAiLabels, Histogram>,
	token_usage: Family<TokenUsageLabels, Histogram>,
	time_to_first_token: Family<GenAiLabels, Histogram>,
	time_per_output_token: Family<GenAiLabels, Histogram>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::<CompletionLabels, Counter>::default();
		registry.register(
			"gen_ai_requests",
			"Completed gen-AI requests by outcome",
			requests.clone(),
		);

		let request_duration = Family::<GenAiLabels, _>::new_with_constructor(|| {
			Histogram::new(REQUEST_DURATION_BUCKET.into_iter())
		});
		registry.register(
			"gen_ai_server_request_duration",
			"Duration of generative AI requests (seconds)",
			request_duration.clone(),
		);

		let token_usage = Family::<TokenUsageLabels, _>::new_with_constructor(|| {
			Histogram::new(TOKEN_USAGE_BUCKET.into_iter())
		});
		registry.register(
			"gen_ai_client_token_usage",
			"Number of tokens used per request",
			token_usage.clone(),
		);

		let time_to_first_token = Family::<GenAiLabels, _>::new_with_constructor(|| {
			Histogram::new(FIRST_TOKEN_BUCKET.into_iter())
		});
		registry.register(
			"gen_ai_server_time_to_first_token",
			"Time to generate the first token for a given request",
			time_to_first_token.clone(),
		);

		let time_per_output_token = Family::<GenAiLabels, _>::new_with_constructor(|| {
			Histogram::new(OUTPUT_TOKEN_BUCKET.into_iter())
		});
		registry.register(
			"gen_ai_server_time_per_output_token",
			"Time to generate each output token for a given request",
			time_per_output_token.clone(),
		);

		Metrics {
			requests,
			request_duration,
			token_usage,
			time_to_first_token,
			time_per_output_token,
		}
	}
}

/// Per-stream metric recorder: the sink contract the processors drive.
///
/// Owns the stream's label state (model, backend) and the timestamps needed
/// for latency observations; all methods are cheap and synchronous.
#[derive(Debug)]
pub struct StreamMetrics {
	metrics: Arc<Metrics>,
	start: Instant,
	model: String,
	backend: String,
	last_token: Option<Instant>,
	completed: bool,
}

impl StreamMetrics {
	pub fn new(metrics: Arc<Metrics>) -> Self {
		Self {
			metrics,
			start: Instant::now(),
			model: UNKNOWN.to_string(),
			backend: UNKNOWN.to_string(),
			last_token: None,
			completed: false,
		}
	}

	/// Reset the request-start timestamp; called on the request-headers event.
	pub fn start_request(&mut self) {
		self.start = Instant::now();
	}

	pub fn set_model(&mut self, model: &str) {
		self.model = model.to_string();
	}

	pub fn set_backend(&mut self, backend: &str) {
		self.backend = backend.to_string();
	}

	/// Record the request outcome. Idempotent: only the first call counts,
	/// so error paths can record failure without double counting.
	pub fn record_completion(&mut self, success: bool) {
		if self.completed {
			return;
		}
		self.completed = true;
		self.metrics
			.requests
			.get_or_create(&CompletionLabels {
				model: self.model.clone(),
				backend: self.backend.clone(),
				success: success.to_string(),
			})
			.inc();
		self.metrics
			.request_duration
			.get_or_create(&self.labels())
			.observe(self.start.elapsed().as_secs_f64());
	}

	pub fn record_token_usage(&self, input_tokens: u32, output_tokens: u32, total_tokens: u32) {
		for (token_type, count) in [
			("input", input_tokens),
			("output", output_tokens),
			("total", total_tokens),
		] {
			if count == 0 {
				continue;
			}
			self.metrics
				.token_usage
				.get_or_create(&TokenUsageLabels {
					token_type: token_type.to_string(),
					model: self.model.clone(),
					backend: self.backend.clone(),
				})
				.observe(f64::from(count));
		}
	}

	/// Record inter-chunk latency keyed on the output-token watermark. Only
	/// meaningful for streamed responses, where chunk arrival times are the
	/// token generation times.
	pub fn record_token_latency(&mut self, output_tokens: u32) {
		let now = Instant::now();
		match self.last_token {
			None => {
				self.metrics
					.time_to_first_token
					.get_or_create(&self.labels())
					.observe(self.start.elapsed().as_secs_f64());
			},
			Some(last) if output_tokens > 0 => {
				let per_token = (now - last).as_secs_f64() / f64::from(output_tokens);
				self.metrics
					.time_per_output_token
					.get_or_create(&self.labels())
					.observe(per_token);
			},
			Some(_) => {},
		}
		self.last_token = Some(now);
	}

	fn labels(&self) -> GenAiLabels {
		GenAiLabels {
			model: self.model.clone(),
			backend: self.backend.clone(),
		}
	}
}

// https://opentelemetry.io/docs/specs/semconv/gen-ai/gen-ai-metrics/#metric-gen_aiclienttokenusage
const TOKEN_USAGE_BUCKET: [f64; 14] = [
	1., 4., 16., 64., 256., 1024., 4096., 16384., 65536., 262144., 1048576., 4194304., 16777216.,
	67108864.,
];
// https://opentelemetry.io/docs/specs/semconv/gen-ai/gen-ai-metrics/#metric-gen_aiserverrequestduration
const REQUEST_DURATION_BUCKET: [f64; 14] = [
	0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12, 10.24, 20.48, 40.96, 81.92,
];
// https://opentelemetry.io/docs/specs/semconv/gen-ai/gen-ai-metrics/#metric-gen_aiservertime_per_output_token
// The spec's smallest bucket is too coarse for fast models; 0.001 adds
// resolution at 1000 TPS.
const OUTPUT_TOKEN_BUCKET: [f64; 14] = [
	0.001, 0.01, 0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.4, 0.5, 0.75, 1.0, 2.5,
];
// https://opentelemetry.io/docs/specs/semconv/gen-ai/gen-ai-metrics/#metric-gen_aiservertime_to_first_token
const FIRST_TOKEN_BUCKET: [f64; 16] = [
	0.001, 0.005, 0.01, 0.02, 0.04, 0.06, 0.08, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

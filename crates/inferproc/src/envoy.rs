//! Helpers over the generated Envoy ext_proc protobuf types.
//!
//! The wire vocabulary lives in `envoy.service.ext_proc.v3`; this module
//! keeps the conversion and construction boilerplate in one place so the
//! processors read like the protocol contract.

use std::collections::HashMap;

use itertools::Itertools;
use prost_types::value::Kind;
use prost_types::{Struct, Value};

pub use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
pub use envoy_types::pb::envoy::extensions::filters::http::ext_proc::v3::{
	processing_mode, ProcessingMode,
};
pub use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
pub use envoy_types::pb::envoy::service::ext_proc::v3::{
	body_mutation, external_processor_server, processing_request, processing_response,
	BodyMutation, BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, HttpBody,
	HttpHeaders, HttpTrailers, ImmediateResponse, ProcessingRequest, ProcessingResponse,
	TrailersResponse,
};

pub type EnvoyHeaderMap = envoy_types::pb::envoy::config::core::v3::HeaderMap;

/// Flatten an Envoy header map into lowercase key/value pairs. `raw_value`
/// wins over the deprecated `value` field when both are set.
pub fn headers_to_map(headers: Option<&EnvoyHeaderMap>) -> HashMap<String, String> {
	let Some(headers) = headers else {
		return HashMap::new();
	};
	headers
		.headers
		.iter()
		.map(|h| {
			let value = if h.raw_value.is_empty() {
				h.value.clone()
			} else {
				String::from_utf8_lossy(&h.raw_value).into_owned()
			};
			(h.key.to_ascii_lowercase(), value)
		})
		.collect()
}

/// Build an Envoy header map from key/value pairs (test construction helper).
pub fn header_map<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> EnvoyHeaderMap {
	let headers = headers
		.into_iter()
		.map(|(k, v)| HeaderValue {
			key: k.to_string(),
			raw_value: v.as_bytes().to_vec(),
			..Default::default()
		})
		.collect_vec();
	EnvoyHeaderMap { headers }
}

pub fn set_header(mutation: &mut HeaderMutation, key: &str, value: &[u8]) {
	mutation.set_headers.push(HeaderValueOption {
		header: Some(HeaderValue {
			key: key.to_string(),
			raw_value: value.to_vec(),
			..Default::default()
		}),
		..Default::default()
	});
}

pub fn remove_header(mutation: &mut HeaderMutation, key: &str) {
	mutation.remove_headers.push(key.to_string());
}

pub fn replace_body(body: Vec<u8>) -> BodyMutation {
	BodyMutation {
		mutation: Some(body_mutation::Mutation::Body(body)),
	}
}

pub fn request_headers_response() -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::RequestHeaders(
			HeadersResponse::default(),
		)),
		..Default::default()
	}
}

pub fn request_body_response(common: CommonResponse) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::RequestBody(BodyResponse {
			response: Some(common),
		})),
		..Default::default()
	}
}

pub fn response_headers_response(
	common: Option<CommonResponse>,
	mode_override: Option<ProcessingMode>,
) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::ResponseHeaders(
			HeadersResponse { response: common },
		)),
		mode_override,
		..Default::default()
	}
}

pub fn response_body_response(common: Option<CommonResponse>) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::ResponseBody(BodyResponse {
			response: common,
		})),
		..Default::default()
	}
}

pub fn immediate_response(status: StatusCode, body: String) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::ImmediateResponse(
			ImmediateResponse {
				status: Some(HttpStatus {
					code: status as i32,
				}),
				body: body.into(),
				..Default::default()
			},
		)),
		..Default::default()
	}
}

/// Wrap per-request cost fields in the configured metadata namespace:
/// `{namespace: {key: number, ...}}`.
pub fn namespaced_metadata(namespace: &str, fields: HashMap<String, u32>) -> Struct {
	let inner = Struct {
		fields: fields
			.into_iter()
			.map(|(k, v)| {
				(
					k,
					Value {
						kind: Some(Kind::NumberValue(f64::from(v))),
					},
				)
			})
			.collect(),
	};
	Struct {
		fields: [(
			namespace.to_string(),
			Value {
				kind: Some(Kind::StructValue(inner)),
			},
		)]
		.into_iter()
		.collect(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn headers_round_trip() {
		let map = headers_to_map(Some(&header_map([
			(":path", "/v1/chat/completions"),
			("X-Request-Id", "abc123"),
		])));
		assert_eq!(map[":path"], "/v1/chat/completions");
		// Keys are lowercased on ingest.
		assert_eq!(map["x-request-id"], "abc123");
	}

	#[test]
	fn metadata_nesting() {
		let md = namespaced_metadata("io.inferrouter.costs", [("input".to_string(), 10u32)].into());
		let ns = md.fields.get("io.inferrouter.costs").unwrap();
		let Some(Kind::StructValue(inner)) = &ns.kind else {
			panic!("expected nested struct");
		};
		let Some(Kind::NumberValue(v)) = inner.fields.get("input").and_then(|v| v.kind.as_ref())
		else {
			panic!("expected number");
		};
		assert_eq!(*v, 10.0);
	}
}

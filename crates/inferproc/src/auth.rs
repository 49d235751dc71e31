//! Backend credential injection.
//!
//! Auth handlers run after translation and mutate the pending header/body
//! mutation before the proxy dispatches upstream. They are shared across
//! streams and must be reentrant; calls are deadline-bounded by the
//! processor.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;

use crate::envoy::{body_mutation, set_header, BodyMutation, HeaderMutation};
use crate::error::Error;

/// Injects backend credentials into the pending request mutation.
#[async_trait]
pub trait BackendAuthHandler: Send + Sync + std::fmt::Debug {
	async fn inject(
		&self,
		request_headers: &HashMap<String, String>,
		headers: &mut HeaderMutation,
		body: &Option<BodyMutation>,
	) -> Result<(), Error>;
}

/// Bearer API key (OpenAI-compatible backends).
#[derive(Debug)]
pub struct ApiKeyAuth {
	key: String,
}

impl ApiKeyAuth {
	pub fn new(key: String) -> Self {
		Self {
			key: key.trim().to_string(),
		}
	}
}

#[async_trait]
impl BackendAuthHandler for ApiKeyAuth {
	async fn inject(
		&self,
		_request_headers: &HashMap<String, String>,
		headers: &mut HeaderMutation,
		_body: &Option<BodyMutation>,
	) -> Result<(), Error> {
		set_header(
			headers,
			"authorization",
			format!("Bearer {}", self.key).as_bytes(),
		);
		Ok(())
	}
}

/// Azure OpenAI API key, carried in the `api-key` header.
#[derive(Debug)]
pub struct AzureApiKeyAuth {
	key: String,
}

impl AzureApiKeyAuth {
	pub fn new(key: String) -> Self {
		Self {
			key: key.trim().to_string(),
		}
	}
}

#[async_trait]
impl BackendAuthHandler for AzureApiKeyAuth {
	async fn inject(
		&self,
		_request_headers: &HashMap<String, String>,
		headers: &mut HeaderMutation,
		_body: &Option<BodyMutation>,
	) -> Result<(), Error> {
		set_header(headers, "api-key", self.key.as_bytes());
		Ok(())
	}
}

/// SigV4 request signing for AWS Bedrock. Signs the translated body and the
/// rewritten path, then folds the signature headers into the mutation.
#[derive(Debug)]
pub struct AwsAuth {
	credentials: Credentials,
	region: String,
}

impl AwsAuth {
	pub fn new(credentials: Credentials, region: String) -> Self {
		Self {
			credentials,
			region,
		}
	}
}

#[async_trait]
impl BackendAuthHandler for AwsAuth {
	async fn inject(
		&self,
		request_headers: &HashMap<String, String>,
		headers: &mut HeaderMutation,
		body: &Option<BodyMutation>,
	) -> Result<(), Error> {
		let method = request_headers
			.get(":method")
			.cloned()
			.unwrap_or_else(|| "POST".to_string());
		// The translator rewrote the path in the mutation; fall back to the
		// original path if it did not.
		let path = mutated_header(headers, ":path")
			.or_else(|| request_headers.get(":path").cloned())
			.unwrap_or_else(|| "/".to_string());
		let payload = match body.as_ref().and_then(|b| b.mutation.as_ref()) {
			Some(body_mutation::Mutation::Body(b)) => b.clone(),
			_ => Vec::new(),
		};

		let identity = self.credentials.clone().into();
		let params = v4::SigningParams::builder()
			.identity(&identity)
			.region(&self.region)
			.name("bedrock")
			.time(SystemTime::now())
			.settings(SigningSettings::default())
			.build()
			.map_err(|e| Error::AuthHandler(format!("signing params: {e}")))?;
		let signable = SignableRequest::new(
			method.as_str(),
			path.as_str(),
			[("content-type", "application/json")].into_iter(),
			SignableBody::Bytes(&payload),
		)
		.map_err(|e| Error::AuthHandler(format!("signable request: {e}")))?;
		let (instructions, _signature) = sign(signable, &params.into())
			.map_err(|e| Error::AuthHandler(format!("sigv4 signing: {e}")))?
			.into_parts();

		let mut signed = http::Request::builder()
			.method(method.as_str())
			.uri(path.as_str())
			.body(())
			.map_err(|e| Error::AuthHandler(format!("signed request: {e}")))?;
		instructions.apply_to_request_http1x(&mut signed);
		for (name, value) in signed.headers() {
			set_header(headers, name.as_str(), value.as_bytes());
		}
		Ok(())
	}
}

fn mutated_header(mutation: &HeaderMutation, key: &str) -> Option<String> {
	mutation.set_headers.iter().rev().find_map(|h| {
		let header = h.header.as_ref()?;
		(header.key == key).then(|| String::from_utf8_lossy(&header.raw_value).into_owned())
	})
}

/// Parse an AWS shared-credentials file (the `[default]` profile).
pub fn credentials_from_file(path: &Path) -> anyhow::Result<Credentials> {
	let contents = std::fs::read_to_string(path)?;
	let mut access_key = None;
	let mut secret_key = None;
	let mut session_token = None;
	for line in contents.lines() {
		let line = line.trim();
		let Some((key, value)) = line.split_once('=') else {
			continue;
		};
		let value = value.trim().to_string();
		match key.trim() {
			"aws_access_key_id" => access_key = Some(value),
			"aws_secret_access_key" => secret_key = Some(value),
			"aws_session_token" => session_token = Some(value),
			_ => {},
		}
	}
	let access_key =
		access_key.ok_or_else(|| anyhow::anyhow!("missing aws_access_key_id in {path:?}"))?;
	let secret_key =
		secret_key.ok_or_else(|| anyhow::anyhow!("missing aws_secret_access_key in {path:?}"))?;
	Ok(Credentials::new(
		access_key,
		secret_key,
		session_token,
		None,
		"inferproc-config",
	))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::envoy::replace_body;

	fn header_value(mutation: &HeaderMutation, key: &str) -> Option<String> {
		mutated_header(mutation, key)
	}

	#[tokio::test]
	async fn api_key_sets_bearer() {
		let auth = ApiKeyAuth::new("sk-test\n".to_string());
		let mut headers = HeaderMutation::default();
		auth.inject(&HashMap::new(), &mut headers, &None)
			.await
			.unwrap();
		assert_eq!(
			header_value(&headers, "authorization").unwrap(),
			"Bearer sk-test"
		);
	}

	#[tokio::test]
	async fn azure_key_sets_api_key_header() {
		let auth = AzureApiKeyAuth::new("azkey".to_string());
		let mut headers = HeaderMutation::default();
		auth.inject(&HashMap::new(), &mut headers, &None)
			.await
			.unwrap();
		assert_eq!(header_value(&headers, "api-key").unwrap(), "azkey");
	}

	#[tokio::test]
	async fn aws_signs_translated_request() {
		let auth = AwsAuth::new(
			Credentials::new("AKID", "SECRET", None, None, "test"),
			"us-east-1".to_string(),
		);
		let mut headers = HeaderMutation::default();
		set_header(&mut headers, ":path", b"/model/llama3-70b/converse");
		let body = Some(replace_body(br#"{"messages":[]}"#.to_vec()));
		let request_headers: HashMap<String, String> =
			[(":method".to_string(), "POST".to_string())].into();
		auth.inject(&request_headers, &mut headers, &body)
			.await
			.unwrap();

		let authz = header_value(&headers, "authorization").unwrap();
		assert!(authz.starts_with("AWS4-HMAC-SHA256"));
		assert!(authz.contains("us-east-1/bedrock/aws4_request"));
		assert!(header_value(&headers, "x-amz-date").is_some());
	}

	#[test]
	fn credentials_file_parsing() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("credentials");
		std::fs::write(
			&path,
			"[default]\naws_access_key_id = AKID\naws_secret_access_key = SECRET\n",
		)
		.unwrap();
		let creds = credentials_from_file(&path).unwrap();
		assert_eq!(creds.access_key_id(), "AKID");
		assert_eq!(creds.secret_access_key(), "SECRET");
	}
}

//! Filter configuration: the on-disk camelCase document and the immutable
//! compiled snapshot the data path runs against.
//!
//! A snapshot is compiled whole at load time (regexes, CEL programs, auth
//! handlers, endpoint pickers); a document that fails any validation is
//! rejected as a unit so the previous snapshot stays active.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use llmcost_core::CostProgram;
use serde::{Deserialize, Serialize};

use crate::auth::{credentials_from_file, ApiKeyAuth, AwsAuth, AzureApiKeyAuth, BackendAuthHandler};
use crate::picker::{Endpoint, WeightedEndpointPicker};

pub const DEFAULT_MODEL_NAME_HEADER: &str = "x-ai-eg-model";
pub const DEFAULT_SELECTED_BACKEND_HEADER: &str = "x-ai-eg-selected-backend";
pub const DEFAULT_METADATA_NAMESPACE: &str = "io.inferrouter.llm";

/// Written as the selected-backend header value when the chosen backend is
/// dynamic: the proxy routes on the original-destination cluster instead.
pub const ORIGINAL_DESTINATION_CLUSTER: &str = "original_destination_cluster";

/// The header whose value seeds deterministic weighted backend selection.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaName {
	OpenAI,
	#[serde(rename = "AWSBedrock")]
	AwsBedrock,
	AzureOpenAI,
	/// Schemas this build does not implement still parse, so that the
	/// rejection surfaces per stream as `UnsupportedSchema` rather than
	/// tearing down the whole configuration.
	#[serde(untagged)]
	Other(String),
}

impl fmt::Display for SchemaName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SchemaName::OpenAI => write!(f, "OpenAI"),
			SchemaName::AwsBedrock => write!(f, "AWSBedrock"),
			SchemaName::AzureOpenAI => write!(f, "AzureOpenAI"),
			SchemaName::Other(name) => write!(f, "{name}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiSchema {
	pub name: SchemaName,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
}

// ---- On-disk document ----

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
	schema: ApiSchema,
	#[serde(default)]
	model_name_header_key: Option<String>,
	#[serde(default)]
	selected_backend_header_key: Option<String>,
	#[serde(default)]
	metadata_namespace: Option<String>,
	#[serde(default)]
	rules: Vec<LocalRule>,
	#[serde(default)]
	llm_request_costs: Vec<LocalRequestCost>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalRule {
	#[serde(default)]
	headers: Vec<LocalHeaderMatch>,
	backends: Vec<LocalBackend>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalHeaderMatch {
	name: String,
	#[serde(rename = "type")]
	kind: HeaderMatchKind,
	value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum HeaderMatchKind {
	Exact,
	Prefix,
	RegularExpression,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalBackend {
	name: String,
	#[serde(default = "default_weight")]
	weight: u32,
	schema: ApiSchema,
	#[serde(default)]
	auth: Option<LocalAuth>,
	#[serde(default)]
	dynamic_load_balancing: Option<LocalDynamicLoadBalancing>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalAuth {
	#[serde(default)]
	api_key: Option<LocalApiKey>,
	#[serde(default)]
	aws: Option<LocalAwsAuth>,
	#[serde(default)]
	azure_api_key: Option<LocalApiKey>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalApiKey {
	#[serde(default)]
	inline: Option<String>,
	#[serde(default)]
	file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalAwsAuth {
	#[serde(default)]
	access_key_id: Option<String>,
	#[serde(default)]
	secret_access_key: Option<String>,
	#[serde(default)]
	session_token: Option<String>,
	#[serde(default)]
	credentials_file: Option<PathBuf>,
	region: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalDynamicLoadBalancing {
	endpoints: Vec<LocalEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalEndpoint {
	host: String,
	port: u16,
	#[serde(default = "default_weight")]
	weight: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalRequestCost {
	metadata_key: String,
	#[serde(rename = "type")]
	kind: CostType,
	#[serde(default)]
	cel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum CostType {
	InputToken,
	OutputToken,
	TotalToken,
	#[serde(rename = "CEL")]
	Cel,
}

fn default_weight() -> u32 {
	1
}

// ---- Compiled snapshot ----

#[derive(Debug, Clone)]
pub enum HeaderValueMatch {
	Exact(String),
	Prefix(String),
	Regex(regex::Regex),
}

#[derive(Debug, Clone)]
pub struct HeaderMatcher {
	pub name: String,
	pub value: HeaderValueMatch,
}

impl HeaderMatcher {
	pub fn matches(&self, value: &str) -> bool {
		match &self.value {
			HeaderValueMatch::Exact(expect) => value == expect,
			HeaderValueMatch::Prefix(prefix) => value.starts_with(prefix),
			// Compiled anchored, so is_match is a full-value match.
			HeaderValueMatch::Regex(re) => re.is_match(value),
		}
	}
}

#[derive(Debug, Clone)]
pub struct Rule {
	pub matchers: Vec<HeaderMatcher>,
	pub backends: Vec<RuleBackend>,
}

#[derive(Debug, Clone)]
pub struct RuleBackend {
	pub name: String,
	pub schema: ApiSchema,
	pub weight: u32,
	pub dynamic: Option<Arc<WeightedEndpointPicker>>,
}

#[derive(Debug, Clone)]
pub struct RequestCost {
	pub metadata_key: String,
	pub kind: CostKind,
}

#[derive(Debug, Clone)]
pub enum CostKind {
	InputToken,
	OutputToken,
	TotalToken,
	Cel(CostProgram),
}

#[derive(Debug)]
pub struct FilterConfig {
	pub schema: ApiSchema,
	pub model_name_header_key: String,
	pub selected_backend_header_key: String,
	pub metadata_namespace: String,
	pub rules: Vec<Rule>,
	pub auth_handlers: HashMap<String, Arc<dyn BackendAuthHandler>>,
	pub request_costs: Vec<RequestCost>,
}

impl FilterConfig {
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read config from {}", path.display()))?;
		Self::from_yaml(&contents)
	}

	pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
		let local: LocalConfig = serde_yaml::from_str(contents).context("invalid config")?;
		compile(local)
	}

	/// Models declared through exact matches on the model-name header, in
	/// rule order. This is what `/v1/models` serves.
	pub fn declared_models(&self) -> Vec<String> {
		let mut models = Vec::new();
		for rule in &self.rules {
			for matcher in &rule.matchers {
				if matcher.name != self.model_name_header_key {
					continue;
				}
				if let HeaderValueMatch::Exact(model) = &matcher.value {
					if !models.contains(model) {
						models.push(model.clone());
					}
				}
			}
		}
		models
	}
}

fn compile(local: LocalConfig) -> anyhow::Result<FilterConfig> {
	let mut rules = Vec::with_capacity(local.rules.len());
	let mut auth_handlers: HashMap<String, Arc<dyn BackendAuthHandler>> = HashMap::new();
	let mut backend_schemas: HashMap<String, ApiSchema> = HashMap::new();

	for (rule_index, rule) in local.rules.into_iter().enumerate() {
		let mut matchers = Vec::with_capacity(rule.headers.len());
		for m in rule.headers {
			let value = match m.kind {
				HeaderMatchKind::Exact => HeaderValueMatch::Exact(m.value),
				HeaderMatchKind::Prefix => HeaderValueMatch::Prefix(m.value),
				HeaderMatchKind::RegularExpression => {
					let re = regex::Regex::new(&format!("^(?:{})$", m.value)).with_context(
						|| format!("rule {rule_index}: invalid regex {:?}", m.value),
					)?;
					HeaderValueMatch::Regex(re)
				},
			};
			matchers.push(HeaderMatcher {
				name: m.name.to_ascii_lowercase(),
				value,
			});
		}

		if rule.backends.is_empty() {
			bail!("rule {rule_index}: no backends");
		}
		let mut backends = Vec::with_capacity(rule.backends.len());
		for backend in rule.backends {
			match &backend.schema.name {
				SchemaName::Other(name) => {
					bail!(
						"backend {:?}: unknown schema {name:?}",
						backend.name
					);
				},
				SchemaName::AzureOpenAI if backend.schema.version.is_none() => {
					bail!("backend {:?}: AzureOpenAI requires a schema version", backend.name);
				},
				_ => {},
			}
			if let Some(previous) = backend_schemas.get(&backend.name) {
				if previous != &backend.schema {
					bail!(
						"backend {:?} declared twice with different schemas",
						backend.name
					);
				}
			} else {
				backend_schemas.insert(backend.name.clone(), backend.schema.clone());
			}

			if let Some(auth) = &backend.auth {
				let handler = build_auth_handler(&backend.name, auth)?;
				auth_handlers.entry(backend.name.clone()).or_insert(handler);
			}
			let dynamic = backend.dynamic_load_balancing.map(|lb| {
				Arc::new(WeightedEndpointPicker::new(
					lb.endpoints
						.into_iter()
						.map(|e| Endpoint {
							host: e.host,
							port: e.port,
							weight: e.weight,
						})
						.collect(),
				))
			});
			backends.push(RuleBackend {
				name: backend.name,
				schema: backend.schema,
				weight: backend.weight,
				dynamic,
			});
		}
		rules.push(Rule { matchers, backends });
	}

	let mut request_costs = Vec::with_capacity(local.llm_request_costs.len());
	for cost in local.llm_request_costs {
		let kind = match cost.kind {
			CostType::InputToken => CostKind::InputToken,
			CostType::OutputToken => CostKind::OutputToken,
			CostType::TotalToken => CostKind::TotalToken,
			CostType::Cel => {
				let source = cost.cel.as_deref().with_context(|| {
					format!("cost rule {:?}: CEL type without a cel expression", cost.metadata_key)
				})?;
				let program = CostProgram::compile(source).with_context(|| {
					format!("cost rule {:?}: invalid expression", cost.metadata_key)
				})?;
				CostKind::Cel(program)
			},
		};
		request_costs.push(RequestCost {
			metadata_key: cost.metadata_key,
			kind,
		});
	}

	Ok(FilterConfig {
		schema: local.schema,
		model_name_header_key: local
			.model_name_header_key
			.unwrap_or_else(|| DEFAULT_MODEL_NAME_HEADER.to_string()),
		selected_backend_header_key: local
			.selected_backend_header_key
			.unwrap_or_else(|| DEFAULT_SELECTED_BACKEND_HEADER.to_string()),
		metadata_namespace: local
			.metadata_namespace
			.unwrap_or_else(|| DEFAULT_METADATA_NAMESPACE.to_string()),
		rules,
		auth_handlers,
		request_costs,
	})
}

fn build_auth_handler(
	backend: &str,
	auth: &LocalAuth,
) -> anyhow::Result<Arc<dyn BackendAuthHandler>> {
	let configured = [
		auth.api_key.is_some(),
		auth.aws.is_some(),
		auth.azure_api_key.is_some(),
	]
	.iter()
	.filter(|set| **set)
	.count();
	if configured != 1 {
		bail!("backend {backend:?}: exactly one auth mechanism must be set");
	}

	if let Some(key) = &auth.api_key {
		return Ok(Arc::new(ApiKeyAuth::new(read_secret(backend, key)?)));
	}
	if let Some(key) = &auth.azure_api_key {
		return Ok(Arc::new(AzureApiKeyAuth::new(read_secret(backend, key)?)));
	}
	let aws = auth.aws.as_ref().expect("checked above");
	let credentials = if let Some(file) = &aws.credentials_file {
		credentials_from_file(file)
			.with_context(|| format!("backend {backend:?}: aws credentials"))?
	} else {
		let access_key = aws.access_key_id.clone().with_context(|| {
			format!("backend {backend:?}: aws auth needs accessKeyId or credentialsFile")
		})?;
		let secret_key = aws.secret_access_key.clone().with_context(|| {
			format!("backend {backend:?}: aws auth needs secretAccessKey")
		})?;
		aws_credential_types::Credentials::new(
			access_key,
			secret_key,
			aws.session_token.clone(),
			None,
			"inferproc-config",
		)
	};
	Ok(Arc::new(AwsAuth::new(credentials, aws.region.clone())))
}

fn read_secret(backend: &str, key: &LocalApiKey) -> anyhow::Result<String> {
	match (&key.inline, &key.file) {
		(Some(inline), None) => Ok(inline.clone()),
		(None, Some(file)) => std::fs::read_to_string(file)
			.with_context(|| format!("backend {backend:?}: failed to read {}", file.display())),
		_ => bail!("backend {backend:?}: api key needs exactly one of inline or file"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const BASIC: &str = r#"
schema:
  name: OpenAI
rules:
  - headers:
      - name: x-ai-eg-model
        type: Exact
        value: gpt-4o-mini
    backends:
      - name: openai
        weight: 1
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
        weight: 1
        schema:
          name: AWSBedrock
llmRequestCosts:
  - metadataKey: input
    type: InputToken
  - metadataKey: c
    type: CEL
    cel: "input_tokens * 2 + output_tokens"
"#;

	#[test]
	fn compiles_basic_config() {
		let config = FilterConfig::from_yaml(BASIC).unwrap();
		assert_eq!(config.schema.name, SchemaName::OpenAI);
		assert_eq!(config.model_name_header_key, DEFAULT_MODEL_NAME_HEADER);
		assert_eq!(config.rules.len(), 2);
		assert!(config.auth_handlers.contains_key("openai"));
		assert!(!config.auth_handlers.contains_key("aws-bedrock"));
		assert_eq!(config.request_costs.len(), 2);
		assert!(matches!(config.request_costs[1].kind, CostKind::Cel(_)));
		assert_eq!(config.declared_models(), vec!["gpt-4o-mini", "llama3-70b"]);
	}

	#[test]
	fn unknown_input_schema_still_loads() {
		// Rejected per stream (UnsupportedSchema), not at load time.
		let config = FilterConfig::from_yaml("schema:\n  name: Anthropic\n").unwrap();
		assert_eq!(config.schema.name, SchemaName::Other("Anthropic".into()));
	}

	#[test]
	fn unknown_backend_schema_is_rejected() {
		let yaml = r#"
schema:
  name: OpenAI
rules:
  - backends:
      - name: b
        schema:
          name: Anthropic
"#;
		assert!(FilterConfig::from_yaml(yaml).is_err());
	}

	#[test]
	fn azure_backend_requires_version() {
		let yaml = r#"
schema:
  name: OpenAI
rules:
  - backends:
      - name: azure
        schema:
          name: AzureOpenAI
"#;
		assert!(FilterConfig::from_yaml(yaml).is_err());
		let versioned = yaml.replace(
			"name: AzureOpenAI",
			"name: AzureOpenAI\n          version: 2024-02-01",
		);
		assert!(FilterConfig::from_yaml(&versioned).is_ok());
	}

	#[test]
	fn conflicting_backend_schemas_are_rejected() {
		let yaml = r#"
schema:
  name: OpenAI
rules:
  - backends:
      - name: b
        schema:
          name: OpenAI
  - backends:
      - name: b
        schema:
          name: AWSBedrock
"#;
		let err = FilterConfig::from_yaml(yaml).unwrap_err();
		assert!(err.to_string().contains("declared twice"));
	}

	#[test]
	fn invalid_regex_is_rejected() {
		let yaml = r#"
schema:
  name: OpenAI
rules:
  - headers:
      - name: x-ai-eg-model
        type: RegularExpression
        value: "gpt-(4"
    backends:
      - name: b
        schema:
          name: OpenAI
"#;
		assert!(FilterConfig::from_yaml(yaml).is_err());
	}

	#[test]
	fn cel_cost_requires_expression() {
		let yaml = r#"
schema:
  name: OpenAI
llmRequestCosts:
  - metadataKey: c
    type: CEL
"#;
		assert!(FilterConfig::from_yaml(yaml).is_err());
	}

	#[test]
	fn invalid_cel_is_rejected() {
		let yaml = r#"
schema:
  name: OpenAI
llmRequestCosts:
  - metadataKey: c
    type: CEL
    cel: "input_tokens +"
"#;
		assert!(FilterConfig::from_yaml(yaml).is_err());
	}

	#[test]
	fn regex_matcher_is_anchored() {
		let yaml = r#"
schema:
  name: OpenAI
rules:
  - headers:
      - name: x-ai-eg-model
        type: RegularExpression
        value: "gpt-4.*"
    backends:
      - name: b
        schema:
          name: OpenAI
"#;
		let config = FilterConfig::from_yaml(yaml).unwrap();
		let matcher = &config.rules[0].matchers[0];
		assert!(matcher.matches("gpt-4o"));
		// A full match is required; a mid-string hit is not enough.
		assert!(!matcher.matches("not-gpt-4o"));
	}

	#[test]
	fn dynamic_load_balancing_compiles() {
		let yaml = r#"
schema:
  name: OpenAI
rules:
  - backends:
      - name: self-hosted
        schema:
          name: OpenAI
        dynamicLoadBalancing:
          endpoints:
            - host: 10.0.0.1
              port: 8000
            - host: 10.0.0.2
              port: 8000
              weight: 3
"#;
		let config = FilterConfig::from_yaml(yaml).unwrap();
		assert!(config.rules[0].backends[0].dynamic.is_some());
	}
}

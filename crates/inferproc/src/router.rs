//! Header-based routing.
//!
//! Rules are evaluated in declared order and the first match wins: matchers
//! on distinct header names must all hold, while matchers sharing a name are
//! alternatives. Within the matched rule one backend is chosen by stable
//! weighted selection seeded from the request id, so a given request always
//! lands on the same backend for a given configuration snapshot.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{FilterConfig, Rule, RuleBackend, REQUEST_ID_HEADER};
use crate::error::Error;

/// Choose a backend for the request headers, or `NoMatchingRule`.
pub fn calculate<'a>(
	config: &'a FilterConfig,
	headers: &HashMap<String, String>,
) -> Result<&'a RuleBackend, Error> {
	for rule in &config.rules {
		if rule_matches(rule, headers) {
			return Ok(select_backend(rule, headers.get(REQUEST_ID_HEADER)));
		}
	}
	Err(Error::NoMatchingRule(format!(
		"no rule matched {}={:?}",
		config.model_name_header_key,
		headers
			.get(&config.model_name_header_key)
			.map(String::as_str)
			.unwrap_or("<unset>")
	)))
}

fn rule_matches(rule: &Rule, headers: &HashMap<String, String>) -> bool {
	// AND across header names, OR across matchers sharing a name.
	let mut by_name: HashMap<&str, bool> = HashMap::new();
	for matcher in &rule.matchers {
		let hit = headers
			.get(&matcher.name)
			.is_some_and(|value| matcher.matches(value));
		let entry = by_name.entry(matcher.name.as_str()).or_insert(false);
		*entry = *entry || hit;
	}
	by_name.values().all(|hit| *hit)
}

fn select_backend<'a>(rule: &'a Rule, request_id: Option<&String>) -> &'a RuleBackend {
	let total: u64 = rule.backends.iter().map(|b| u64::from(b.weight)).sum();
	if total == 0 {
		return &rule.backends[0];
	}

	// Name-sorted cumulative intervals keep the mapping stable when the
	// declaration order shuffles but the weights do not.
	let mut sorted: Vec<&RuleBackend> = rule.backends.iter().collect();
	sorted.sort_by(|a, b| a.name.cmp(&b.name));

	let mut hasher = DefaultHasher::new();
	request_id.map(String::as_str).unwrap_or("").hash(&mut hasher);
	let mut rng = StdRng::seed_from_u64(hasher.finish());
	let mut draw = rng.random_range(0..total);

	for backend in &sorted {
		let weight = u64::from(backend.weight);
		if draw < weight {
			return backend;
		}
		draw -= weight;
	}
	sorted[sorted.len() - 1]
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::FilterConfig;

	fn config() -> FilterConfig {
		FilterConfig::from_yaml(
			r#"
schema:
  name: OpenAI
rules:
  - headers:
      - name: x-ai-eg-model
        type: Exact
        value: gpt-4o-mini
      - name: x-ai-eg-model
        type: Exact
        value: gpt-4o
      - name: x-tenant
        type: Prefix
        value: "team-"
    backends:
      - name: openai
        schema:
          name: OpenAI
  - headers:
      - name: x-ai-eg-model
        type: RegularExpression
        value: "llama3-.*"
    backends:
      - name: bedrock-a
        weight: 20
        schema:
          name: AWSBedrock
      - name: bedrock-b
        weight: 80
        schema:
          name: AWSBedrock
  - headers:
      - name: x-ai-eg-model
        type: Exact
        value: zero-weight
    backends:
      - name: first
        weight: 0
        schema:
          name: OpenAI
      - name: second
        weight: 0
        schema:
          name: OpenAI
"#,
		)
		.unwrap()
	}

	fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn first_matching_rule_wins() {
		let config = config();
		let backend = calculate(
			&config,
			&headers(&[("x-ai-eg-model", "gpt-4o-mini"), ("x-tenant", "team-red")]),
		)
		.unwrap();
		assert_eq!(backend.name, "openai");
	}

	#[test]
	fn same_name_matchers_are_alternatives() {
		let config = config();
		// gpt-4o hits the second alternative of the model matcher pair.
		let backend = calculate(
			&config,
			&headers(&[("x-ai-eg-model", "gpt-4o"), ("x-tenant", "team-blue")]),
		)
		.unwrap();
		assert_eq!(backend.name, "openai");
	}

	#[test]
	fn distinct_names_are_all_required() {
		let config = config();
		let err = calculate(&config, &headers(&[("x-ai-eg-model", "gpt-4o-mini")]));
		assert!(matches!(err, Err(Error::NoMatchingRule(_))));
	}

	#[test]
	fn no_match_is_explained() {
		let config = config();
		let err = calculate(&config, &headers(&[("x-ai-eg-model", "unknown-model")]))
			.unwrap_err();
		assert!(err.to_string().contains("unknown-model"));
	}

	#[test]
	fn selection_is_deterministic_per_request_id() {
		let config = config();
		for i in 0..50 {
			let hdrs = headers(&[
				("x-ai-eg-model", "llama3-70b"),
				("x-request-id", &format!("req-{i}")),
			]);
			let first = calculate(&config, &hdrs).unwrap().name.clone();
			for _ in 0..5 {
				assert_eq!(calculate(&config, &hdrs).unwrap().name, first);
			}
		}
	}

	#[test]
	fn weighted_split_roughly_matches_weights() {
		let config = config();
		let mut counts: HashMap<String, u32> = HashMap::new();
		for i in 0..1000 {
			let hdrs = headers(&[
				("x-ai-eg-model", "llama3-70b"),
				("x-request-id", &format!("uuid-{i}")),
			]);
			let backend = calculate(&config, &hdrs).unwrap();
			*counts.entry(backend.name.clone()).or_default() += 1;
		}
		let a = counts.get("bedrock-a").copied().unwrap_or_default();
		let b = counts.get("bedrock-b").copied().unwrap_or_default();
		assert_eq!(a + b, 1000);
		// 20/80 split with a generous tolerance.
		assert!((100..300).contains(&a), "bedrock-a got {a}");
		assert!((700..900).contains(&b), "bedrock-b got {b}");
	}

	#[test]
	fn zero_weights_select_first_declared() {
		let config = config();
		let backend = calculate(
			&config,
			&headers(&[("x-ai-eg-model", "zero-weight"), ("x-request-id", "r")]),
		)
		.unwrap();
		assert_eq!(backend.name, "first");
	}

	#[test]
	fn anchored_regex_does_not_match_substrings() {
		let config = config();
		let err = calculate(&config, &headers(&[("x-ai-eg-model", "xllama3-70b")]));
		assert!(matches!(err, Err(Error::NoMatchingRule(_))));
	}
}

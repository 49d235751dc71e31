//! Dynamic endpoint pickers.
//!
//! Rules flagged for dynamic load balancing defer the choice of a concrete
//! upstream to a picker at request time. The picker contributes routing
//! headers (original-destination host) and the proxy routes on
//! `original_destination_cluster` instead of a named cluster.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Error;

/// Header consumed by the proxy's original-destination cluster.
pub const ORIGINAL_DST_HEADER: &str = "x-envoy-original-dst-host";

/// A concrete upstream chosen for one request.
#[derive(Debug, Clone)]
pub struct PickedEndpoint {
	/// host:port of the upstream the proxy should dial.
	pub authority: String,
	/// Additional routing headers contributed by the picker.
	pub headers: Vec<(String, String)>,
}

/// Chooses a concrete upstream endpoint for rules marked dynamic. Shared
/// across streams; implementations must be reentrant.
#[async_trait]
pub trait EndpointPicker: Send + Sync + std::fmt::Debug {
	async fn pick(&self, model: &str) -> Result<PickedEndpoint, Error>;
}

#[derive(Debug, Clone)]
pub struct Endpoint {
	pub host: String,
	pub port: u16,
	pub weight: u32,
}

/// Weighted random selection over a static endpoint set.
#[derive(Debug)]
pub struct WeightedEndpointPicker {
	endpoints: Vec<Endpoint>,
}

impl WeightedEndpointPicker {
	pub fn new(endpoints: Vec<Endpoint>) -> Self {
		Self { endpoints }
	}
}

#[async_trait]
impl EndpointPicker for WeightedEndpointPicker {
	async fn pick(&self, _model: &str) -> Result<PickedEndpoint, Error> {
		if self.endpoints.is_empty() {
			return Err(Error::SelectorUnavailable(
				"no endpoints configured".into(),
			));
		}
		let total: u64 = self.endpoints.iter().map(|e| u64::from(e.weight)).sum();
		let chosen = if total == 0 {
			&self.endpoints[0]
		} else {
			let mut rng = StdRng::from_os_rng();
			let mut draw = rng.random_range(0..total);
			let mut chosen = &self.endpoints[0];
			for endpoint in &self.endpoints {
				let weight = u64::from(endpoint.weight);
				if draw < weight {
					chosen = endpoint;
					break;
				}
				draw -= weight;
			}
			chosen
		};
		let authority = format!("{}:{}", chosen.host, chosen.port);
		Ok(PickedEndpoint {
			headers: vec![(ORIGINAL_DST_HEADER.to_string(), authority.clone())],
			authority,
		})
	}
}

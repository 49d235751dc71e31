//! Minimal Prometheus exposition endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{info, warn};

const OPENMETRICS_CONTENT_TYPE: &str =
	"application/openmetrics-text; version=1.0.0; charset=utf-8";

pub async fn serve(address: SocketAddr, registry: Arc<Registry>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(address).await?;
	info!(%address, "metrics endpoint listening");
	loop {
		let (stream, _) = listener.accept().await?;
		let registry = registry.clone();
		tokio::spawn(async move {
			let service = service_fn(move |_req| {
				let registry = registry.clone();
				async move {
					let mut body = String::new();
					let response = match encode(&mut body, &registry) {
						Ok(()) => hyper::Response::builder()
							.header(hyper::header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)
							.body(Full::new(Bytes::from(body))),
						Err(e) => hyper::Response::builder()
							.status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
							.body(Full::new(Bytes::from(format!("encode error: {e}")))),
					};
					response
				}
			});
			if let Err(e) = http1::Builder::new()
				.serve_connection(TokioIo::new(stream), service)
				.await
			{
				warn!("metrics connection error: {e}");
			}
		});
	}
}

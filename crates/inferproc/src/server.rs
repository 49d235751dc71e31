//! The ext-proc gRPC server loop.
//!
//! One bidirectional stream per client HTTP request. The first event must be
//! request-headers; it selects the processor from the path. Events are then
//! consumed strictly serially and every processor error is converted into an
//! immediate response with the mapped status before the stream is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, trace};

use crate::envoy::external_processor_server::{ExternalProcessor, ExternalProcessorServer};
use crate::envoy::{
	headers_to_map, immediate_response, processing_request, processing_response,
	ProcessingRequest, ProcessingResponse, TrailersResponse,
};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::proc::{new_processor, Processor};
use crate::store::ConfigStore;

pub struct ExtProcService {
	store: ConfigStore,
	metrics: Arc<Metrics>,
}

impl ExtProcService {
	pub fn new(store: ConfigStore, metrics: Arc<Metrics>) -> Self {
		Self { store, metrics }
	}

	pub fn into_server(self) -> ExternalProcessorServer<Self> {
		ExternalProcessorServer::new(self)
	}
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
	type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

	async fn process(
		&self,
		request: Request<Streaming<ProcessingRequest>>,
	) -> Result<Response<Self::ProcessStream>, Status> {
		let mut events = request.into_inner();
		let (tx, rx) = mpsc::channel(16);
		// Streams run against the snapshot captured at stream start; a
		// concurrent reload never mixes rule sets mid-request.
		let config = self.store.snapshot();
		let metrics = self.metrics.clone();

		tokio::spawn(async move {
			if let Err(status) = pump(config, metrics, &mut events, &tx).await {
				let _ = tx.send(Err(status)).await;
			}
		});
		Ok(Response::new(ReceiverStream::new(rx)))
	}
}

async fn pump(
	config: Arc<crate::config::FilterConfig>,
	metrics: Arc<Metrics>,
	events: &mut Streaming<ProcessingRequest>,
	tx: &mpsc::Sender<Result<ProcessingResponse, Status>>,
) -> Result<(), Status> {
	let Some(first) = next_event(events).await? else {
		return Ok(());
	};
	let Some(processing_request::Request::RequestHeaders(headers)) = first.request else {
		return Err(Status::invalid_argument(
			"first event must be request headers",
		));
	};
	let request_headers = headers_to_map(headers.headers.as_ref());
	let path = request_headers
		.get(":path")
		.cloned()
		.unwrap_or_default();
	trace!(%path, "stream opened");

	let mut processor = match new_processor(config, &path, request_headers, metrics) {
		Ok(processor) => processor,
		Err(err) => {
			error!(%path, error = %err, "failed to construct processor");
			return finish_with_error(tx, err).await;
		},
	};

	match processor.request_headers().await {
		Ok(response) => {
			let done = matches!(
				response.response,
				Some(processing_response::Response::ImmediateResponse(_))
			);
			if tx.send(Ok(response)).await.is_err() || done {
				return Ok(());
			}
		},
		Err(err) => return finish_with_error(tx, err).await,
	}

	while let Some(event) = next_event(events).await? {
		let result = dispatch(processor.as_mut(), event).await;
		match result {
			Ok(response) => {
				let done = matches!(
					response.response,
					Some(processing_response::Response::ImmediateResponse(_))
				);
				if tx.send(Ok(response)).await.is_err() {
					return Ok(());
				}
				if done {
					return Ok(());
				}
			},
			Err(err) => return finish_with_error(tx, err).await,
		}
	}
	trace!("stream closed by proxy");
	Ok(())
}

async fn dispatch(
	processor: &mut dyn Processor,
	event: ProcessingRequest,
) -> Result<ProcessingResponse, Error> {
	match event.request {
		Some(processing_request::Request::RequestBody(body)) => processor.request_body(body).await,
		Some(processing_request::Request::ResponseHeaders(headers)) => {
			processor.response_headers(headers.headers.as_ref()).await
		},
		Some(processing_request::Request::ResponseBody(body)) => {
			processor.response_body(body).await
		},
		Some(processing_request::Request::RequestTrailers(_)) => Ok(ProcessingResponse {
			response: Some(processing_response::Response::RequestTrailers(
				TrailersResponse::default(),
			)),
			..Default::default()
		}),
		Some(processing_request::Request::ResponseTrailers(_)) => Ok(ProcessingResponse {
			response: Some(processing_response::Response::ResponseTrailers(
				TrailersResponse::default(),
			)),
			..Default::default()
		}),
		Some(processing_request::Request::RequestHeaders(_)) => Err(Error::OutOfOrder {
			phase: "running",
			event: "request-headers",
		}),
		None => Err(Error::OutOfOrder {
			phase: "running",
			event: "empty",
		}),
	}
}

async fn next_event(
	events: &mut Streaming<ProcessingRequest>,
) -> Result<Option<ProcessingRequest>, Status> {
	match events.message().await {
		Ok(event) => Ok(event),
		Err(status) => {
			// Cancellation by the proxy is routine teardown, not a failure.
			debug!(code = ?status.code(), "stream terminated: {}", status.message());
			Ok(None)
		},
	}
}

async fn finish_with_error(
	tx: &mpsc::Sender<Result<ProcessingResponse, Status>>,
	err: Error,
) -> Result<(), Status> {
	error!(error = %err, "stream failed");
	let _ = tx
		.send(Ok(immediate_response(err.status(), err.to_string())))
		.await;
	Ok(())
}

/// Serve the external processor until the shutdown future resolves.
pub async fn serve(
	address: SocketAddr,
	store: ConfigStore,
	metrics: Arc<Metrics>,
	shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
	info!(%address, "external processor listening");
	tonic::transport::Server::builder()
		.add_service(ExtProcService::new(store, metrics).into_server())
		.serve_with_shutdown(address, shutdown)
		.await?;
	Ok(())
}

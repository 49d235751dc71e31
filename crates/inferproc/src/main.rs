use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use prometheus_client::registry::Registry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use inferproc::config::FilterConfig;
use inferproc::metrics::Metrics;
use inferproc::store::{watch_config_file, ConfigStore};
use inferproc::{server, stats};

#[derive(Parser, Debug)]
#[command(name = "inferproc", about = "InferRouter external processor")]
struct Args {
	/// Path to the filter configuration file (reloaded on change).
	#[arg(long)]
	config: PathBuf,

	/// Address the ext-proc gRPC server binds.
	#[arg(long, default_value = "0.0.0.0:1063")]
	address: SocketAddr,

	/// Log level (error, warn, info, debug, trace).
	#[arg(long, default_value = "info")]
	log_level: String,

	/// Address for the Prometheus exposition endpoint.
	#[arg(long, default_value = "127.0.0.1:19001")]
	stats_address: SocketAddr,
}

#[tokio::main]
async fn main() -> ExitCode {
	let args = Args::parse();

	let filter = EnvFilter::try_new(&args.log_level)
		.unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).init();

	// Exit 2 on a config error at initial load; later reload failures only
	// log and keep the previous snapshot.
	let config = match FilterConfig::load(&args.config) {
		Ok(config) => config,
		Err(e) => {
			error!("invalid configuration: {e:#}");
			return ExitCode::from(2);
		},
	};
	let store = ConfigStore::new(config);
	if let Err(e) = watch_config_file(store.clone(), args.config.clone()) {
		error!("failed to watch config: {e:#}");
		return ExitCode::from(1);
	}

	let mut registry = Registry::with_prefix("inferproc");
	let metrics = Arc::new(Metrics::new(&mut registry));
	let registry = Arc::new(registry);
	let stats_address = args.stats_address;
	tokio::spawn(async move {
		if let Err(e) = stats::serve(stats_address, registry).await {
			error!("metrics endpoint failed: {e:#}");
		}
	});

	match server::serve(args.address, store, metrics, shutdown_signal()).await {
		Ok(()) => {
			info!("shutdown complete");
			ExitCode::SUCCESS
		},
		Err(e) => {
			error!("server error: {e:#}");
			ExitCode::from(1)
		},
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(_) => std::future::pending().await,
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => info!("received interrupt, draining"),
		_ = terminate => info!("received terminate, draining"),
	}
}

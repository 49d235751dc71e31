//! Configuration snapshot store and hot reload.
//!
//! The active snapshot is swapped by pointer replacement; in-flight streams
//! keep the snapshot they captured at stream start. A rejected reload keeps
//! the previous snapshot active.

use std::path::{absolute, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use notify::{EventKind, RecursiveMode};
use tracing::{error, info};

use crate::config::FilterConfig;

#[derive(Clone, Debug)]
pub struct ConfigStore {
	inner: Arc<RwLock<Arc<FilterConfig>>>,
}

impl ConfigStore {
	pub fn new(config: FilterConfig) -> Self {
		Self {
			inner: Arc::new(RwLock::new(Arc::new(config))),
		}
	}

	/// The current snapshot. Streams call this once at stream start.
	pub fn snapshot(&self) -> Arc<FilterConfig> {
		self.inner.read().expect("config store poisoned").clone()
	}

	pub fn replace(&self, config: FilterConfig) {
		*self.inner.write().expect("config store poisoned") = Arc::new(config);
	}
}

/// Watch the config file and reload the store on change, with a debounce to
/// ride out editors and configmap symlink flips writing in several steps.
pub fn watch_config_file(store: ConfigStore, path: PathBuf) -> anyhow::Result<()> {
	let (tx, mut rx) = tokio::sync::mpsc::channel(1);

	let mut watcher =
		notify_debouncer_full::new_debouncer(Duration::from_millis(250), None, move |res| {
			let _ = tx.blocking_send(res);
		})
		.map_err(|e| anyhow::anyhow!("failed to create file watcher: {e}"))?;

	let abspath = absolute(&path)?;
	let parent = abspath
		.parent()
		.ok_or_else(|| anyhow::anyhow!("config file has no parent directory"))?;
	watcher
		.watch(parent, RecursiveMode::NonRecursive)
		.map_err(|e| anyhow::anyhow!("failed to watch config file: {e}"))?;
	info!("watching config file: {}", path.display());

	tokio::spawn(async move {
		// The watcher lives as long as the reload task.
		let _watcher = watcher;
		while let Some(Ok(events)) = rx.recv().await {
			let relevant = events.iter().any(|e| {
				matches!(e.kind, EventKind::Modify(_) | EventKind::Create(_))
					&& e.paths.iter().any(|p| points_at(p, &abspath))
			});
			if !relevant {
				continue;
			}
			info!("config file changed, reloading");
			match FilterConfig::load(&abspath) {
				Ok(config) => {
					store.replace(config);
					info!("config reloaded");
				},
				Err(e) => {
					// Previous snapshot stays active.
					error!("failed to reload config: {e:#}");
				},
			}
		}
	});
	Ok(())
}

fn points_at(event_path: &Path, config_path: &Path) -> bool {
	if event_path == config_path {
		return true;
	}
	// Kubernetes configmaps update through symlinked directories; fall back
	// to comparing file names within the watched directory.
	match (event_path.file_name(), config_path.file_name()) {
		(Some(a), Some(b)) => a == b,
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	const BASE: &str = "schema:\n  name: OpenAI\n";

	#[test]
	fn snapshot_is_stable_across_replace() {
		let store = ConfigStore::new(FilterConfig::from_yaml(BASE).unwrap());
		let captured = store.snapshot();
		store.replace(
			FilterConfig::from_yaml("schema:\n  name: OpenAI\nmetadataNamespace: next\n")
				.unwrap(),
		);
		// The captured snapshot still sees the old namespace; new captures
		// see the new one.
		assert_eq!(
			captured.metadata_namespace,
			crate::config::DEFAULT_METADATA_NAMESPACE
		);
		assert_eq!(store.snapshot().metadata_namespace, "next");
	}

	#[tokio::test]
	async fn reload_picks_up_changes_and_keeps_old_on_failure() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.yaml");
		std::fs::write(&path, BASE).unwrap();

		let store = ConfigStore::new(FilterConfig::load(&path).unwrap());
		watch_config_file(store.clone(), path.clone()).unwrap();

		// Valid rewrite lands.
		std::fs::write(&path, "schema:\n  name: OpenAI\nmetadataNamespace: updated\n").unwrap();
		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		while store.snapshot().metadata_namespace != "updated" {
			if tokio::time::Instant::now() > deadline {
				panic!("reload did not land");
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}

		// Broken rewrite is rejected; the updated snapshot stays.
		let mut f = std::fs::OpenOptions::new()
			.write(true)
			.truncate(true)
			.open(&path)
			.unwrap();
		f.write_all(b"schema: [not, a, mapping\n").unwrap();
		drop(f);
		tokio::time::sleep(Duration::from_millis(600)).await;
		assert_eq!(store.snapshot().metadata_namespace, "updated");
	}
}

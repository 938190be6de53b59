//! Filesystem notifications for the entries and rules directories.
//!
//! Raw notifications are classified on the notifier thread and queued as
//! [`WatchEvent`]s. A single task drains the queue, so callbacks run one at a
//! time and in delivery order.
//!
//! An entry is read when its event is dispatched. An entry that is removed
//! before that is skipped, and only its removal is reported.

use crate::codec;
use crate::dataset::Dataset;
use crate::script::is_script;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Called with the path and dataset of an entry that was written completely.
pub type CreateCallback = Arc<dyn Fn(PathBuf, Dataset) + Send + Sync>;
/// Called with the path of an entry that was removed or renamed away.
pub type RemoveCallback = Arc<dyn Fn(PathBuf) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
	Idle,
	Watching,
	Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
	Created(PathBuf),
	Removed(PathBuf),
	RuleChanged(PathBuf),
	Other,
}

#[derive(Debug, Error)]
pub enum WatchError {
	#[error("Failed to access watched directory {}: {source}", path.display())]
	Io {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to watch {}: {source}", path.display())]
	Notify {
		path: PathBuf,
		source: notify::Error,
	},
	#[error("Watcher cannot be started from state {0:?}")]
	InvalidState(WatcherState),
	#[error("Watcher must be started from within a tokio runtime")]
	NoRuntime,
}

/// The directories a watcher observes, in canonical form.
#[derive(Debug, Clone)]
struct WatchedDirs {
	entries: PathBuf,
	rules: PathBuf,
	extension: String,
}

struct Running {
	// Dropping the notifier closes the event queue
	notifier: RecommendedWatcher,
	shutdown: oneshot::Sender<()>,
	task: JoinHandle<()>,
}

pub struct DirectoryWatcher {
	entries_dir: PathBuf,
	rules_dir: PathBuf,
	extension: String,
	state: Arc<Mutex<WatcherState>>,
	running: Option<Running>,
}

impl DirectoryWatcher {
	pub fn new(
		entries_dir: impl Into<PathBuf>,
		rules_dir: impl Into<PathBuf>,
		extension: impl Into<String>,
	) -> Self {
		Self {
			entries_dir: entries_dir.into(),
			rules_dir: rules_dir.into(),
			extension: extension.into(),
			state: Arc::new(Mutex::new(WatcherState::Idle)),
			running: None,
		}
	}

	pub fn state(&self) -> WatcherState {
		*self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// The watched entries directory. Canonical once the watcher has been started,
	/// so it matches the paths handed to the callbacks.
	pub fn entries_dir(&self) -> &Path {
		&self.entries_dir
	}

	/// Subscribes to both directories and starts dispatching events to the callbacks.
	///
	/// Must be called from within a tokio runtime. A watcher can only be started once.
	pub fn start(
		&mut self,
		on_create: CreateCallback,
		on_remove: RemoveCallback,
	) -> Result<(), WatchError> {
		let state = self.state();
		if state != WatcherState::Idle {
			return Err(WatchError::InvalidState(state));
		}
		let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::NoRuntime)?;

		let dirs = WatchedDirs {
			entries: canonicalize(&self.entries_dir)?,
			rules: canonicalize(&self.rules_dir)?,
			extension: self.extension.clone(),
		};
		self.entries_dir.clone_from(&dirs.entries);
		self.rules_dir.clone_from(&dirs.rules);

		let (sender, receiver) = mpsc::unbounded_channel();
		let notifier_dirs = dirs.clone();
		let mut notifier = RecommendedWatcher::new(
			move |result: notify::Result<Event>| match result {
				Ok(event) => {
					for watch_event in classify_event(&event, &notifier_dirs) {
						if watch_event == WatchEvent::Other {
							continue;
						}
						trace!(?watch_event, "Queued watch event");
						if sender.send(watch_event).is_err() {
							debug!("Dropped watch event after shutdown");
						}
					}
				}
				Err(err) => error!("Watch error: {err}"),
			},
			Config::default(),
		)
		.map_err(|source| WatchError::Notify {
			path: dirs.entries.clone(),
			source,
		})?;

		for path in [&dirs.entries, &dirs.rules] {
			notifier
				.watch(path, RecursiveMode::NonRecursive)
				.map_err(|source| WatchError::Notify {
					path: path.clone(),
					source,
				})?;
			info!(path = %path.display(), "Watching directory");
		}

		let (shutdown, shutdown_receiver) = oneshot::channel();
		let task = runtime.spawn(dispatch_loop(
			receiver,
			shutdown_receiver,
			on_create,
			on_remove,
			Arc::clone(&self.state),
		));

		self.set_state(WatcherState::Watching);
		self.running = Some(Running {
			notifier,
			shutdown,
			task,
		});
		Ok(())
	}

	/// Stops watching and waits for the event that is currently dispatched.
	/// Stopping is terminal.
	pub async fn stop(&mut self) {
		if let Some(running) = self.running.take() {
			let _ = running.shutdown.send(());
			drop(running.notifier);
			if let Err(err) = running.task.await {
				error!("Watch task failed: {err}");
			}
			info!("Stopped directory watcher");
		}
		self.set_state(WatcherState::Stopped);
	}

	fn set_state(&self, state: WatcherState) {
		*self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
	}
}

impl std::fmt::Debug for DirectoryWatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DirectoryWatcher")
			.field("entries_dir", &self.entries_dir)
			.field("rules_dir", &self.rules_dir)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

fn canonicalize(path: &Path) -> Result<PathBuf, WatchError> {
	path.canonicalize().map_err(|source| WatchError::Io {
		path: path.to_path_buf(),
		source,
	})
}

async fn dispatch_loop(
	mut events: mpsc::UnboundedReceiver<WatchEvent>,
	mut shutdown: oneshot::Receiver<()>,
	on_create: CreateCallback,
	on_remove: RemoveCallback,
	state: Arc<Mutex<WatcherState>>,
) {
	loop {
		let event = tokio::select! {
			_ = &mut shutdown => break,
			event = events.recv() => match event {
				Some(event) => event,
				None => break,
			},
		};
		dispatch(event, &on_create, &on_remove).await;
	}

	*state.lock().unwrap_or_else(PoisonError::into_inner) = WatcherState::Stopped;
	debug!("Watch task finished");
}

async fn dispatch(event: WatchEvent, on_create: &CreateCallback, on_remove: &RemoveCallback) {
	match event {
		WatchEvent::Created(path) => {
			let bytes = match tokio::fs::read(&path).await {
				Ok(bytes) => bytes,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
					// The removal is queued behind this event and still gets reported
					info!(path = %path.display(), "Worklist entry vanished before dispatch");
					return;
				}
				Err(err) => {
					warn!(path = %path.display(), "Failed to read new worklist entry: {err}");
					return;
				}
			};
			match codec::decode(&bytes) {
				Ok(dataset) => {
					debug!(path = %path.display(), "Worklist entry created");
					on_create(path, dataset);
				}
				Err(err) => {
					warn!(path = %path.display(), "Dropped malformed worklist entry: {err}");
				}
			}
		}
		WatchEvent::Removed(path) => {
			debug!(path = %path.display(), "Worklist entry removed");
			on_remove(path);
		}
		WatchEvent::RuleChanged(path) => {
			info!(
				path = %path.display(),
				"Rule script changed, restart to apply the change"
			);
		}
		WatchEvent::Other => {}
	}
}

/// Classifies a raw notification. Renames reported with both paths are ignored,
/// because the backend reports each side of the rename separately as well.
fn classify_event(event: &Event, dirs: &WatchedDirs) -> Vec<WatchEvent> {
	if matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both))) {
		return Vec::new();
	}
	event
		.paths
		.iter()
		.map(|path| classify(&event.kind, path, dirs))
		.collect()
}

fn classify(kind: &EventKind, path: &Path, dirs: &WatchedDirs) -> WatchEvent {
	let Some(parent) = path.parent() else {
		return WatchEvent::Other;
	};

	if parent == dirs.rules {
		return match kind {
			EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
				if is_script(path) =>
			{
				WatchEvent::RuleChanged(path.to_path_buf())
			}
			_ => WatchEvent::Other,
		};
	}

	let is_entry = path
		.extension()
		.is_some_and(|extension| extension == dirs.extension.as_str());
	if parent != dirs.entries || !is_entry {
		return WatchEvent::Other;
	}

	match kind {
		EventKind::Access(AccessKind::Close(AccessMode::Write))
		| EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
			WatchEvent::Created(path.to_path_buf())
		}
		EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
			WatchEvent::Removed(path.to_path_buf())
		}
		// Backends that cannot tell the two sides of a rename apart
		EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
			if path.exists() {
				WatchEvent::Created(path.to_path_buf())
			} else {
				WatchEvent::Removed(path.to_path_buf())
			}
		}
		// Backends without close notifications report the creation only
		#[cfg(not(target_os = "linux"))]
		EventKind::Create(_) => WatchEvent::Created(path.to_path_buf()),
		_ => WatchEvent::Other,
	}
}

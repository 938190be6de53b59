//! The worklist service: rule engine, entry store and directory watcher wired together.

use crate::config::WorklistConfig;
use crate::dataset::Dataset;
use crate::dictionary::{DictionaryError, TagResolver};
use crate::engine::GenerationEngine;
use crate::error::Partial;
use crate::rules::RuleError;
use crate::script::{ScriptError, ScriptRuntime};
use crate::store::{EntryError, EntryStore, WorklistEntry, DEFAULT_EXTENSION};
use crate::types::{Customer, Patient};
use crate::watcher::{DirectoryWatcher, WatchError, WatcherState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const DEFAULT_RULE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorklistOptions {
	pub entries_dir: PathBuf,
	pub rules_dir: PathBuf,
	pub extension: String,
	pub rule_timeout: Option<Duration>,
	/// Keyword file that extends the built-in tag dictionary
	pub dictionary: Option<PathBuf>,
}

impl WorklistOptions {
	pub fn new(entries_dir: impl Into<PathBuf>, rules_dir: impl Into<PathBuf>) -> Self {
		Self {
			entries_dir: entries_dir.into(),
			rules_dir: rules_dir.into(),
			extension: String::from(DEFAULT_EXTENSION),
			rule_timeout: Some(DEFAULT_RULE_TIMEOUT),
			dictionary: None,
		}
	}
}

impl From<&WorklistConfig> for WorklistOptions {
	fn from(config: &WorklistConfig) -> Self {
		Self {
			entries_dir: config.entries_dir.clone(),
			rules_dir: config.rules_dir.clone(),
			extension: config.extension.clone(),
			rule_timeout: config.rule_timeout(),
			dictionary: config.dictionary.clone(),
		}
	}
}

#[derive(Debug, Error)]
pub enum WorklistError {
	#[error(transparent)]
	Dictionary(#[from] DictionaryError),
	#[error(transparent)]
	Script(#[from] ScriptError),
	#[error(transparent)]
	Watch(#[from] WatchError),
}

#[derive(Debug)]
pub struct Worklist {
	engine: GenerationEngine,
	store: EntryStore,
	watcher: DirectoryWatcher,
}

impl Worklist {
	/// Loads the rules and starts watching the entries and rules directories.
	///
	/// `on_create` is called for every entry that is written completely into the
	/// entries directory, `on_remove` for every entry that leaves it. Must be
	/// called from within a tokio runtime. Any failure is fatal.
	pub fn new<C, R>(options: WorklistOptions, on_create: C, on_remove: R) -> Result<Self, WorklistError>
	where
		C: Fn(PathBuf, Dataset) + Send + Sync + 'static,
		R: Fn(PathBuf) + Send + Sync + 'static,
	{
		let resolver = match &options.dictionary {
			Some(path) => TagResolver::with_keyword_file(path)?,
			None => TagResolver::new(),
		};
		let runtime = ScriptRuntime::new(Arc::new(resolver), options.rule_timeout)?;
		let engine = GenerationEngine::from_scripts(runtime, &options.rules_dir)?;

		let mut watcher =
			DirectoryWatcher::new(&options.entries_dir, &options.rules_dir, &options.extension);
		watcher.start(Arc::new(on_create), Arc::new(on_remove))?;
		// Listed and written entries carry the same paths as the callbacks
		let store = EntryStore::new(watcher.entries_dir(), &options.extension);

		info!(
			entries = %store.dir().display(),
			rules = engine.rule_names().len(),
			"Started worklist"
		);
		Ok(Self {
			engine,
			store,
			watcher,
		})
	}

	/// Generates a worklist dataset, see [`GenerationEngine::generate`].
	pub fn generate(
		&self,
		customer: &Customer,
		patient: &Patient,
		template: &Dataset,
	) -> Partial<Dataset, RuleError> {
		self.engine.generate(customer, patient, template)
	}

	/// Reads the current entries, see [`EntryStore::list_entries`].
	pub fn list_entries(&self) -> Partial<Vec<WorklistEntry>, EntryError> {
		self.store.list_entries()
	}

	pub const fn store(&self) -> &EntryStore {
		&self.store
	}

	pub const fn engine(&self) -> &GenerationEngine {
		&self.engine
	}

	pub fn watcher_state(&self) -> WatcherState {
		self.watcher.state()
	}

	/// Stops the directory watcher. Generation and listing keep working.
	pub async fn shutdown(&mut self) {
		self.watcher.stop().await;
		info!("Stopped worklist");
	}
}

use dicom_json::DicomJson;
use dicom_mwl::config::{AppConfig, TelemetryConfig};
use dicom_mwl::worklist::{Worklist, WorklistOptions};
use dicom_mwl::Dataset;
use std::path::PathBuf;
use tokio::signal;
use tracing::{debug, error, info, level_filters::LevelFilter, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Starts the Sentry client and installs the log subscriber, which also forwards
/// events to Sentry. Without a DSN the client stays disabled.
fn init_telemetry(telemetry: &TelemetryConfig) -> sentry::ClientInitGuard {
	let dsn = telemetry.sentry.as_deref().unwrap_or_default();
	let options = sentry::ClientOptions {
		release: sentry::release_name!(),
		traces_sample_rate: 1.0,
		..Default::default()
	};
	let guard = sentry::init((dsn, options));

	let filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::from_level(telemetry.level).into())
		.from_env_lossy();
	let format = tracing_subscriber::fmt::layer()
		.compact()
		.with_target(false)
		.with_file(false)
		.with_line_number(false);
	tracing_subscriber::registry()
		.with(format)
		.with(filter)
		.with(sentry::integrations::tracing::layer())
		.init();

	if guard.is_enabled() {
		info!(dsn, "Reporting errors and traces to Sentry");
	}
	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	// Sentry has to be up before any runtime thread is spawned
	let _telemetry = init_telemetry(&config.telemetry);

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?;
	runtime.block_on(async move {
		if let Err(err) = run(config).await {
			error!("Worklist service failed: {err:#}");
		}
	});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let options = WorklistOptions::from(&config.worklist);
	let mut worklist = Worklist::new(options, on_entry_created, on_entry_removed)?;
	info!(rules = ?worklist.engine().rule_names(), "Loaded rules");

	let entries = worklist.list_entries();
	info!(
		entries = entries.value.len(),
		dir = %worklist.store().dir().display(),
		"Found worklist entries"
	);
	if let Some(err) = &entries.error {
		warn!("{err}");
	}

	shutdown_signal().await;
	worklist.shutdown().await;
	Ok(())
}

fn on_entry_created(path: PathBuf, dataset: Dataset) {
	info!(
		path = %path.display(),
		elements = dataset.len(),
		"Worklist entry available"
	);
	if tracing::enabled!(Level::DEBUG) {
		match serde_json::to_string(&DicomJson::from(dataset.to_object())) {
			Ok(json) => debug!(path = %path.display(), "{json}"),
			Err(err) => warn!("Failed to serialize worklist entry: {err}"),
		}
	}
}

fn on_entry_removed(path: PathBuf) {
	info!(path = %path.display(), "Worklist entry withdrawn");
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl-C: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
	info!("Received shutdown signal");
}

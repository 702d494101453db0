pub(crate) mod config;
pub(crate) mod orthanc;
pub(crate) mod reconcile;
pub(crate) mod types;

use crate::config::AppConfig;
use crate::orthanc::OrthancClient;
use crate::reconcile::{EventTemplate, ReconcileOptions, Reconciler};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false)
				// stdout is reserved for the report
				.with_writer(std::io::stderr),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let sentry = init_sentry(&config);

	let result = tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()?
		.block_on(run(config));

	if let Err(error) = result {
		error!("Reconciliation failed: {error:#}");
		// process::exit skips destructors, so flush pending Sentry events first
		drop(sentry);
		std::process::exit(1);
	}
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let date = config.reconcile.date_filter()?;
	let local = OrthancClient::new("self", &config.local)?
		.with_event_queue_path(config.dispatch.path.clone());
	let remote = OrthancClient::new("remote", &config.remote)?;

	info!(
		date = %date,
		local = %config.local.url,
		remote = %config.remote.url,
		app = config.dispatch.app,
		dry_run = config.dispatch.dry_run,
		"Reconciling studies"
	);

	let options = ReconcileOptions {
		date,
		on_fetch_failure: config.reconcile.on_fetch_failure,
		deduplicate: config.reconcile.deduplicate,
		template: EventTemplate::from(&config.dispatch),
		dry_run: config.dispatch.dry_run,
		continue_on_error: config.dispatch.continue_on_error,
	};
	let report = Reconciler::new(&local, &remote, &local, options).run().await?;

	info!(
		studies = report.studies,
		missing = report.missing.len(),
		dispatched = report.dispatched.len(),
		failed = report.failed_dispatches.len(),
		"Reconciliation finished"
	);
	println!("{}", serde_json::to_string_pretty(&report)?);

	Ok(())
}

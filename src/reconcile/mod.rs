//! Reconciliation of the studies of the self server against the remote server.
//! 1. The studies of the day are fetched from the self server ([`StudyFetcher`]).
//! 2. Every study is compared against its counterpart on the remote server ([`Comparator`]).
//! 3. A transfer event is queued for every missing series ([`EventDispatcher`]).
//!

mod comparator;
mod dispatcher;
mod fetcher;

pub use comparator::{Comparator, DiffOutcome, FetchFailurePolicy, SeriesDiff, StudyLookup};
pub use dispatcher::{DispatchedEvent, EventDispatcher, EventQueue, EventTemplate};
pub use fetcher::{StudyFetcher, StudySource};

use crate::orthanc::ClientError;
use crate::types::{DateFilter, ResourceId};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
	pub date: DateFilter,
	pub on_fetch_failure: FetchFailurePolicy,
	pub deduplicate: bool,
	pub template: EventTemplate,
	pub dry_run: bool,
	pub continue_on_error: bool,
}

/// Summary of a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
	pub date: DateFilter,
	pub studies: usize,
	pub compared: usize,
	pub full_resync: usize,
	pub skipped: usize,
	pub missing: SeriesDiff,
	pub dispatched: Vec<DispatchedEvent>,
	pub failed_dispatches: Vec<ResourceId>,
	pub dry_run: bool,
}

pub struct Reconciler<'a> {
	source: &'a dyn StudySource,
	lookup: &'a dyn StudyLookup,
	queue: &'a dyn EventQueue,
	options: ReconcileOptions,
}

impl<'a> Reconciler<'a> {
	pub const fn new(
		source: &'a dyn StudySource,
		lookup: &'a dyn StudyLookup,
		queue: &'a dyn EventQueue,
		options: ReconcileOptions,
	) -> Self {
		Self {
			source,
			lookup,
			queue,
			options,
		}
	}

	pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
		let options = &self.options;

		let index = StudyFetcher::new(self.source)
			.fetch(&options.date)
			.await
			.map_err(ReconcileError::Fetch)?;

		let diffs = Comparator::new(self.lookup, options.on_fetch_failure)
			.compare(&index)
			.await?;
		let mut missing = SeriesDiff::concat(&diffs);
		if options.deduplicate {
			missing = missing.deduplicate();
		}
		info!(
			studies = index.len(),
			missing = missing.len(),
			"Compared local studies against remote"
		);
		if missing.is_empty() {
			info!("Remote server holds every local series");
		}

		let summary = EventDispatcher::new(self.queue, options.template.clone())
			.dry_run(options.dry_run)
			.continue_on_error(options.continue_on_error)
			.dispatch(&missing)
			.await?;

		let count = |outcome: DiffOutcome| diffs.iter().filter(|d| d.outcome == outcome).count();
		Ok(ReconcileReport {
			date: options.date.clone(),
			studies: index.len(),
			compared: count(DiffOutcome::Compared),
			full_resync: count(DiffOutcome::FullResync),
			skipped: count(DiffOutcome::Skipped),
			missing,
			dispatched: summary.dispatched,
			failed_dispatches: summary.failed,
			dry_run: options.dry_run,
		})
	}
}

#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("failed to fetch local studies")]
	Fetch(#[source] ClientError),
	#[error("failed to compare study {study_id}")]
	Compare {
		study_id: ResourceId,
		#[source]
		source: ClientError,
	},
	#[error("failed to queue transfer event for series {series_id}")]
	Dispatch {
		series_id: ResourceId,
		#[source]
		source: ClientError,
	},
}

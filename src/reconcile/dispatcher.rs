use crate::config::DispatchConfig;
use crate::orthanc::models::{EventQueueResponse, TransferEvent};
use crate::orthanc::ClientError;
use crate::reconcile::comparator::SeriesDiff;
use crate::reconcile::ReconcileError;
use crate::types::{ResourceId, ResourceLevel, UI};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

/// Queues events for execution by the transfer plugin.
#[async_trait]
pub trait EventQueue: Send + Sync {
	async fn execute_event(&self, event: &TransferEvent)
		-> Result<EventQueueResponse, ClientError>;
}

/// The fields shared by all transfer events of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
	pub iuid: UI,
	pub app: String,
	pub delay: Option<u32>,
}

impl EventTemplate {
	pub fn event_for(&self, series: &ResourceId) -> TransferEvent {
		TransferEvent {
			iuid: self.iuid.clone(),
			resource_id: series.clone(),
			resource_type: ResourceLevel::Series,
			app: self.app.clone(),
			delay: self.delay,
		}
	}
}

impl From<&DispatchConfig> for EventTemplate {
	fn from(config: &DispatchConfig) -> Self {
		Self {
			iuid: config.iuid.clone(),
			app: config.app.clone(),
			delay: config.delay,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedEvent {
	pub series: ResourceId,
	pub response: EventQueueResponse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
	pub dispatched: Vec<DispatchedEvent>,
	pub failed: Vec<ResourceId>,
}

/// Queues one transfer event per missing series, one request at a time.
pub struct EventDispatcher<'a> {
	queue: &'a dyn EventQueue,
	template: EventTemplate,
	dry_run: bool,
	continue_on_error: bool,
}

impl<'a> EventDispatcher<'a> {
	pub const fn new(queue: &'a dyn EventQueue, template: EventTemplate) -> Self {
		Self {
			queue,
			template,
			dry_run: false,
			continue_on_error: false,
		}
	}

	/// Only logs the events instead of sending them.
	#[must_use]
	pub fn dry_run(mut self, dry_run: bool) -> Self {
		self.dry_run = dry_run;
		self
	}

	/// Records failed events instead of aborting.
	#[must_use]
	pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
		self.continue_on_error = continue_on_error;
		self
	}

	pub async fn dispatch(&self, diff: &SeriesDiff) -> Result<DispatchSummary, ReconcileError> {
		let mut summary = DispatchSummary::default();

		for series in diff.iter() {
			let event = self.template.event_for(series);
			if self.dry_run {
				info!(series = %series, app = %event.app, "Dry run, not queueing transfer event");
				continue;
			}

			match self.queue.execute_event(&event).await {
				Ok(response) => {
					info!(series = %series, app = %event.app, ?response, "Queued transfer event");
					summary.dispatched.push(DispatchedEvent {
						series: series.clone(),
						response,
					});
				}
				Err(err) if self.continue_on_error => {
					warn!(series = %series, "Failed to queue transfer event: {err}");
					summary.failed.push(series.clone());
				}
				Err(source) => {
					return Err(ReconcileError::Dispatch {
						series_id: series.clone(),
						source,
					})
				}
			}
		}

		Ok(summary)
	}
}

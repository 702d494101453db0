use crate::orthanc::models::StudyResource;
use crate::orthanc::ClientError;
use crate::reconcile::fetcher::{Study, StudyIndex};
use crate::reconcile::ReconcileError;
use crate::types::ResourceId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Looks up single studies on a server by their Orthanc ID.
#[async_trait]
pub trait StudyLookup: Send + Sync {
	async fn get_study(&self, study_id: &str) -> Result<StudyResource, ClientError>;
}

/// What to do with a local study if the remote server cannot deliver its counterpart
/// (error status, unreachable, timed out).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchFailurePolicy {
	/// Treat every local series of the study as missing and transfer it again.
	#[default]
	FullResync,
	/// Leave the study alone until the next run.
	Skip,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffOutcome {
	/// The remote study was fetched and compared.
	Compared,
	/// The remote study was unavailable and all local series are considered missing.
	FullResync,
	/// The remote study was unavailable and the study was ignored.
	Skipped,
}

/// The series of a single local study that are missing on the remote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyDiff {
	pub study_id: ResourceId,
	pub outcome: DiffOutcome,
	pub missing: Vec<ResourceId>,
}

/// The series that need to be transferred, in study order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SeriesDiff(Vec<ResourceId>);

impl SeriesDiff {
	/// Concatenates the per-study diffs. Series are not deduplicated across studies.
	pub fn concat(diffs: &[StudyDiff]) -> Self {
		Self(
			diffs
				.iter()
				.flat_map(|diff| diff.missing.iter().cloned())
				.collect(),
		)
	}

	/// Removes repeated series IDs, keeping the first occurrence.
	#[must_use]
	pub fn deduplicate(self) -> Self {
		let mut seen = HashSet::with_capacity(self.0.len());
		Self(
			self.0
				.into_iter()
				.filter(|series| seen.insert(series.clone()))
				.collect(),
		)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &ResourceId> {
		self.0.iter()
	}

	#[cfg(test)]
	pub fn as_slice(&self) -> &[ResourceId] {
		&self.0
	}
}

impl From<Vec<ResourceId>> for SeriesDiff {
	fn from(series: Vec<ResourceId>) -> Self {
		Self(series)
	}
}

/// Set difference `local - remote`. The order of the local series is kept.
pub fn series_difference(local: &[ResourceId], remote: &[ResourceId]) -> Vec<ResourceId> {
	let remote: HashSet<&str> = remote.iter().map(String::as_str).collect();
	let mut seen = HashSet::with_capacity(local.len());
	local
		.iter()
		.filter(|series| !remote.contains(series.as_str()) && seen.insert(series.as_str()))
		.cloned()
		.collect()
}

/// Compares the local studies against the remote server.
pub struct Comparator<'a> {
	lookup: &'a dyn StudyLookup,
	policy: FetchFailurePolicy,
}

impl<'a> Comparator<'a> {
	pub const fn new(lookup: &'a dyn StudyLookup, policy: FetchFailurePolicy) -> Self {
		Self { lookup, policy }
	}

	/// Compares every study of the index, one request at a time.
	pub async fn compare(&self, index: &StudyIndex) -> Result<Vec<StudyDiff>, ReconcileError> {
		let mut diffs = Vec::with_capacity(index.len());
		for (study_id, study) in index.iter() {
			diffs.push(self.compare_study(study_id, study).await?);
		}
		Ok(diffs)
	}

	async fn compare_study(
		&self,
		study_id: &ResourceId,
		study: &Study,
	) -> Result<StudyDiff, ReconcileError> {
		match self.lookup.get_study(study_id).await {
			Ok(remote) => {
				let missing = series_difference(&study.series, &remote.series);
				debug!(
					study = %study_id,
					local = study.series.len(),
					remote = remote.series.len(),
					missing = missing.len(),
					"Compared study"
				);
				Ok(StudyDiff {
					study_id: study_id.clone(),
					outcome: DiffOutcome::Compared,
					missing,
				})
			}
			Err(err) if err.is_unavailable() => {
				let (outcome, missing) = match self.policy {
					FetchFailurePolicy::FullResync => {
						(DiffOutcome::FullResync, study.series.clone())
					}
					FetchFailurePolicy::Skip => (DiffOutcome::Skipped, Vec::new()),
				};
				warn!(
					study = %study_id,
					study_instance_uid = %study.study_instance_uid,
					policy = ?self.policy,
					missing = missing.len(),
					"Remote study unavailable: {err}"
				);
				Ok(StudyDiff {
					study_id: study_id.clone(),
					outcome,
					missing,
				})
			}
			Err(source) => Err(ReconcileError::Compare {
				study_id: study_id.clone(),
				source,
			}),
		}
	}
}

use crate::orthanc::models::{ExpandedStudy, FindRequest};
use crate::orthanc::ClientError;
use crate::types::{DateFilter, ResourceId, UI};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Searches a server for studies.
#[async_trait]
pub trait StudySource: Send + Sync {
	async fn find_studies(&self, request: &FindRequest) -> Result<Vec<ExpandedStudy>, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Study {
	#[serde(rename = "StudyInstanceUID")]
	pub study_instance_uid: UI,
	pub accession_number: String,
	pub series: Vec<ResourceId>,
}

impl From<ExpandedStudy> for Study {
	fn from(study: ExpandedStudy) -> Self {
		Self {
			study_instance_uid: study.main_dicom_tags.study_instance_uid,
			accession_number: study.main_dicom_tags.accession_number,
			series: study.series,
		}
	}
}

/// The studies of the self server, keyed by their Orthanc ID.
/// Iteration follows the ID order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StudyIndex(BTreeMap<ResourceId, Study>);

impl StudyIndex {
	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[cfg(test)]
	pub fn get(&self, id: &str) -> Option<&Study> {
		self.0.get(id)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &Study)> {
		self.0.iter()
	}
}

impl FromIterator<ExpandedStudy> for StudyIndex {
	fn from_iter<T: IntoIterator<Item = ExpandedStudy>>(iter: T) -> Self {
		Self(
			iter.into_iter()
				.map(|study| (study.id.clone(), Study::from(study)))
				.collect(),
		)
	}
}

/// Collects the studies of a single day (or date range) from the self server.
pub struct StudyFetcher<'a> {
	source: &'a dyn StudySource,
}

impl<'a> StudyFetcher<'a> {
	pub const fn new(source: &'a dyn StudySource) -> Self {
		Self { source }
	}

	pub async fn fetch(&self, date: &DateFilter) -> Result<StudyIndex, ClientError> {
		let request = FindRequest::studies_on(date.clone());
		let studies = self.source.find_studies(&request).await?;
		let index: StudyIndex = studies.into_iter().collect();

		if index.is_empty() {
			warn!(date = %date, "No local studies found");
		} else {
			info!(date = %date, studies = index.len(), "Found local studies");
		}
		Ok(index)
	}
}

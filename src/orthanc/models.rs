//! Request and response bodies of the Orthanc REST API endpoints used for reconciliation.

use crate::types::{DateFilter, ResourceId, ResourceLevel, UI};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /tools/find`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FindRequest {
	pub level: ResourceLevel,
	pub expand: bool,
	pub query: FindQuery,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FindQuery {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub study_date: Option<DateFilter>,
}

impl FindRequest {
	/// Finds all studies with a matching StudyDate, expanded to include their series.
	pub fn studies_on(date: DateFilter) -> Self {
		Self {
			level: ResourceLevel::Study,
			expand: true,
			query: FindQuery {
				study_date: Some(date),
			},
		}
	}
}

/// An expanded study as returned by `POST /tools/find`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExpandedStudy {
	#[serde(rename = "ID")]
	pub id: ResourceId,
	pub main_dicom_tags: StudyTags,
	pub series: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StudyTags {
	#[serde(rename = "StudyInstanceUID")]
	pub study_instance_uid: UI,
	/// Orthanc omits empty tags, so a missing AccessionNumber is not an error.
	#[serde(default)]
	pub accession_number: String,
}

/// A study as returned by `GET /studies/{id}`. Only the series are of interest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StudyResource {
	pub series: Vec<ResourceId>,
}

/// Body of `POST /itech/execute-event-queues`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferEvent {
	pub iuid: UI,
	pub resource_id: ResourceId,
	#[serde(serialize_with = "ResourceLevel::serialize_lowercase")]
	pub resource_type: ResourceLevel,
	pub app: String,
	/// Overrides the configured delay of the target application (in seconds).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub delay: Option<u32>,
}

/// The answer of the event queue.
///
/// A queued event is answered with its `id` and a `status` flag. Some plugin versions send both
/// as two consecutive JSON documents, so all documents of the body are merged.
/// A body that is not a sequence of JSON objects is kept as `raw`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventQueueResponse {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub raw: Option<String>,
}

impl EventQueueResponse {
	pub fn parse(body: &str) -> Self {
		let mut response = Self::default();
		for document in serde_json::Deserializer::from_str(body).into_iter::<Value>() {
			match document {
				Ok(Value::Object(object)) => {
					if let Some(id) = object.get("id").and_then(Value::as_i64) {
						response.id = Some(id);
					}
					if let Some(status) = object.get("status").and_then(Value::as_bool) {
						response.status = Some(status);
					}
				}
				_ => {
					response.raw = Some(body.to_owned());
					break;
				}
			}
		}
		response
	}
}

//! A minimal client for the Orthanc REST API.
//! - Study search is implemented with `POST /tools/find`.
//! - Study lookup is implemented with `GET /studies/{id}`.
//! - Transfer events are queued with the event queue endpoint of the transfer plugin.
//!

pub mod models;

use crate::config::{ConfigError, Credentials, RetryConfig, ServerConfig};
use crate::reconcile::{EventQueue, StudyLookup, StudySource};
use async_trait::async_trait;
use models::{EventQueueResponse, ExpandedStudy, FindRequest, StudyResource, TransferEvent};
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

pub const USER_AGENT: &str = concat!("pacs-reconcile/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_EVENT_QUEUE_PATH: &str = "/itech/execute-event-queues";

/// HTTP client for a single Orthanc server.
pub struct OrthancClient {
	/// Short name used in logs, e.g. "self" or "remote".
	name: &'static str,
	base_url: Url,
	http: reqwest::Client,
	credentials: Option<Credentials>,
	retry: RetryConfig,
	event_queue_path: String,
}

impl OrthancClient {
	pub fn new(name: &'static str, config: &ServerConfig) -> Result<Self, ClientError> {
		let http = reqwest::Client::builder()
			.timeout(config.timeout())
			.user_agent(USER_AGENT)
			.build()
			.map_err(ClientError::Builder)?;

		Ok(Self {
			name,
			base_url: config.url.clone(),
			http,
			credentials: config.credentials()?,
			retry: config.retry,
			event_queue_path: String::from(DEFAULT_EVENT_QUEUE_PATH),
		})
	}

	#[must_use]
	pub fn with_event_queue_path(mut self, path: impl Into<String>) -> Self {
		self.event_queue_path = path.into();
		self
	}

	/// Appends the path segments to the base URL. Segments are percent-encoded and
	/// a path prefix of the base URL is preserved.
	pub fn endpoint<'a>(
		&self,
		segments: impl IntoIterator<Item = &'a str>,
	) -> Result<Url, ClientError> {
		let mut url = self.base_url.clone();
		url.path_segments_mut()
			.map_err(|()| ClientError::InvalidUrl(self.base_url.clone()))?
			.pop_if_empty()
			.extend(segments);
		Ok(url)
	}

	fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
		match &self.credentials {
			Some(Credentials::Basic { username, password }) => {
				request.basic_auth(username, Some(password))
			}
			Some(Credentials::Header(value)) => request.header(AUTHORIZATION, value),
			None => request,
		}
	}

	/// Sends the request built by `build`, retrying the failures allowed by `retry_on`.
	/// The final response is returned regardless of its status code.
	async fn send<F>(
		&self,
		url: &Url,
		retry_on: RetryOn,
		build: F,
	) -> Result<Response, ClientError>
	where
		F: Fn(&reqwest::Client, Url) -> RequestBuilder + Send + Sync,
	{
		let mut attempt = 0;
		loop {
			let result = self.authorize(build(&self.http, url.clone())).send().await;
			let transient = retry_on.allows(&result);

			if !transient || attempt >= self.retry.attempts {
				return result.map_err(|source| ClientError::Transport {
					url: url.clone(),
					source,
				});
			}

			let delay = self.retry.delay(attempt);
			attempt += 1;
			match &result {
				Ok(response) => warn!(
					server = self.name,
					%url,
					status = %response.status(),
					attempt,
					"Transient failure, retrying in {delay:?}"
				),
				Err(err) => warn!(
					server = self.name,
					%url,
					attempt,
					"Request failed ({err}), retrying in {delay:?}"
				),
			}
			tokio::time::sleep(delay).await;
		}
	}

	async fn read_body(url: &Url, response: Response) -> Result<bytes::Bytes, ClientError> {
		let status = response.status();
		if !status.is_success() {
			return Err(ClientError::Status {
				url: url.clone(),
				status,
			});
		}

		response.bytes().await.map_err(|source| ClientError::Transport {
			url: url.clone(),
			source,
		})
	}

	async fn read_json<T: DeserializeOwned>(url: Url, response: Response) -> Result<T, ClientError> {
		let body = Self::read_body(&url, response).await?;
		serde_json::from_slice(&body).map_err(|source| ClientError::Decode { url, source })
	}
}

/// Failures that may be retried for a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RetryOn {
	/// Connection errors, timeouts and transient status codes. Only for idempotent requests.
	Transient,
	/// Connection errors only. The server never saw the request, so it cannot have acted on it.
	ConnectFailure,
}

impl RetryOn {
	fn allows(self, result: &Result<Response, reqwest::Error>) -> bool {
		match (self, result) {
			(Self::Transient, Ok(response)) => is_transient(response.status()),
			(Self::Transient, Err(err)) => err.is_connect() || err.is_timeout(),
			(Self::ConnectFailure, Ok(_)) => false,
			(Self::ConnectFailure, Err(err)) => err.is_connect(),
		}
	}
}

/// Status codes that are worth another attempt.
fn is_transient(status: StatusCode) -> bool {
	// 429 Too Many Requests, 502 Bad Gateway, 503 Service Unavailable, 504 Gateway Timeout
	matches!(status.as_u16(), 429 | 502..=504)
}

#[async_trait]
impl StudySource for OrthancClient {
	async fn find_studies(&self, request: &FindRequest) -> Result<Vec<ExpandedStudy>, ClientError> {
		let url = self.endpoint(["tools", "find"])?;
		debug!(server = self.name, %url, "Searching studies");

		let response = self
			.send(&url, RetryOn::Transient, |http, url| {
				http.post(url).json(request)
			})
			.await?;
		Self::read_json(url, response).await
	}
}

#[async_trait]
impl StudyLookup for OrthancClient {
	async fn get_study(&self, study_id: &str) -> Result<StudyResource, ClientError> {
		let url = self.endpoint(["studies", study_id])?;
		trace!(server = self.name, %url, "Fetching study");

		let response = self
			.send(&url, RetryOn::Transient, |http, url| http.get(url))
			.await?;
		Self::read_json(url, response).await
	}
}

#[async_trait]
impl EventQueue for OrthancClient {
	async fn execute_event(
		&self,
		event: &TransferEvent,
	) -> Result<EventQueueResponse, ClientError> {
		let url = self.endpoint(self.event_queue_path.split('/').filter(|s| !s.is_empty()))?;
		trace!(server = self.name, %url, series = %event.resource_id, "Queueing event");

		let response = self
			// A timeout or 5xx may come after the event was queued
			.send(&url, RetryOn::ConnectFailure, |http, url| {
				http.post(url).json(event)
			})
			.await?;
		let body = Self::read_body(&url, response).await?;
		Ok(EventQueueResponse::parse(&String::from_utf8_lossy(&body)))
	}
}

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("failed to create HTTP client")]
	Builder(#[source] reqwest::Error),
	#[error(transparent)]
	Credentials(#[from] ConfigError),
	#[error("{0} cannot be used as a base URL")]
	InvalidUrl(Url),
	#[error("request to {url} failed")]
	Transport {
		url: Url,
		#[source]
		source: reqwest::Error,
	},
	#[error("{url} returned {status}")]
	Status { url: Url, status: StatusCode },
	#[error("failed to decode response from {url}")]
	Decode {
		url: Url,
		#[source]
		source: serde_json::Error,
	},
}

impl ClientError {
	/// Whether the server failed to deliver a response, as opposed to delivering one that
	/// cannot be understood.
	pub const fn is_unavailable(&self) -> bool {
		matches!(self, Self::Transport { .. } | Self::Status { .. })
	}

	#[cfg(test)]
	pub const fn status(&self) -> Option<StatusCode> {
		match self {
			Self::Status { status, .. } => Some(*status),
			_ => None,
		}
	}
}

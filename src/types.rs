use chrono::{Local, NaiveDate};
use serde::{Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// Orthanc resource identifier, e.g. `760ece80-fe24ca8d-affd89b1-171bf304-1df75054`.
/// Only meaningful on the server that issued it.
pub type ResourceId = String;

/// Resource levels of the Orthanc REST API.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceLevel {
	Study,
	Series,
}

impl Display for ResourceLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Study => write!(f, "study"),
			Self::Series => write!(f, "series"),
		}
	}
}

impl ResourceLevel {
	/// Serializes the level in lowercase, as expected by the event queue.
	pub fn serialize_lowercase<S>(level: &Self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.collect_str(level)
	}
}

/// DA (Date) format as used by the StudyDate attribute.
const DA_FORMAT: &str = "%Y%m%d";

/// A StudyDate matching key: either a single date (`YYYYMMDD`) or a range
/// (`YYYYMMDD-YYYYMMDD`) where one of the bounds may be omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DateFilter(String);

impl DateFilter {
	/// The current date in the local time zone.
	pub fn today() -> Self {
		Self::from(Local::now().date_naive())
	}

	#[cfg(test)]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<NaiveDate> for DateFilter {
	fn from(date: NaiveDate) -> Self {
		Self(date.format(DA_FORMAT).to_string())
	}
}

impl Display for DateFilter {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for DateFilter {
	type Err = InvalidDateFilter;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		let valid = match s.split_once('-') {
			None => parse_da(s).is_some(),
			Some(("", "")) => false,
			Some((from, "")) => parse_da(from).is_some(),
			Some(("", to)) => parse_da(to).is_some(),
			Some((from, to)) => matches!((parse_da(from), parse_da(to)), (Some(from), Some(to)) if from <= to),
		};

		if valid {
			Ok(Self(s.to_owned()))
		} else {
			Err(InvalidDateFilter(s.to_owned()))
		}
	}
}

fn parse_da(value: &str) -> Option<NaiveDate> {
	if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	NaiveDate::parse_from_str(value, DA_FORMAT).ok()
}

#[derive(Debug, Error)]
#[error("invalid date filter {0:?}, expected YYYYMMDD or YYYYMMDD-YYYYMMDD")]
pub struct InvalidDateFilter(pub String);

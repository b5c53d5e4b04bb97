//! Core domain model and error taxonomy for jobrank.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobrank-core";

/// Required text fields of a job candidate, by canonical name.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "identifier",
    "title",
    "description",
    "job_type",
    "experience_level",
    "duration",
    "posted_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Fixed,
    Hourly,
}

impl JobType {
    /// Lower-cases and trims, then substring-matches "hourly" before "fixed".
    pub fn normalize(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_lowercase();
        if lower.contains("hourly") {
            Some(Self::Hourly)
        } else if lower.contains("fixed") {
            Some(Self::Fixed)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "Fixed",
            Self::Hourly => "Hourly",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| RecordError::InvalidJobType(s.to_string()))
    }
}

/// Weight tier shared by criteria, oracle verdicts and priority buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];

    pub const fn weight(self) -> u32 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid tier `{0}`: expected High, Medium or Low")]
pub struct InvalidTier(pub String);

impl FromStr for Tier {
    type Err = InvalidTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(InvalidTier(s.to_string())),
        }
    }
}

/// Review state a user attaches to a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JobStatus {
    #[default]
    New,
    Interested,
    #[serde(rename = "Not Interested")]
    NotInterested,
    Applied,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::New,
        JobStatus::Interested,
        JobStatus::NotInterested,
        JobStatus::Applied,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Interested => "Interested",
            Self::NotInterested => "Not Interested",
            Self::Applied => "Applied",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job status `{0}`")]
pub struct InvalidStatus(pub String);

impl FromStr for JobStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s
            .trim()
            .to_ascii_lowercase()
            .replace(|c: char| c == '_' || c == '-' || c.is_whitespace(), "");
        match key.as_str() {
            "new" => Ok(Self::New),
            "interested" => Ok(Self::Interested),
            "notinterested" => Ok(Self::NotInterested),
            "applied" => Ok(Self::Applied),
            _ => Err(InvalidStatus(s.to_string())),
        }
    }
}

/// Validated, immutable job posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCandidate {
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub job_type: JobType,
    pub experience_level: String,
    pub duration: String,
    pub rate: Option<String>,
    pub client_info: Option<String>,
    pub posted_at: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub category: Option<String>,
    pub country: Option<String>,
    pub payment_verified: Option<bool>,
    pub proposal_count: Option<u32>,
    pub client_rating: Option<f64>,
    pub client_spend: Option<f64>,
}

impl JobCandidate {
    /// Lower-cased title, description and category, the haystack for criteria matching.
    pub fn search_text(&self) -> String {
        let mut text = format!("{} {}", self.title, self.description);
        if let Some(category) = &self.category {
            text.push(' ');
            text.push_str(category);
        }
        text.to_lowercase()
    }

    /// Lower bound of the posted rate: `"$15.00 - $30.00"` gives 15, `"$1,200"` gives 1200.
    pub fn budget(&self) -> Option<f64> {
        let rate = self.rate.as_deref()?;
        let start = rate.find(|c: char| c.is_ascii_digit())?;
        let amount: String = rate[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
            .filter(|c| *c != ',')
            .collect();
        amount.trim_end_matches('.').parse().ok()
    }
}

/// Raw scraped record after the normalizer attached an identifier.
///
/// `identifier` keeps its source JSON type; the validator coerces it to text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub position: usize,
    pub identifier: JsonValue,
    pub fields: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub verdict: Tier,
    pub explanation: String,
}

/// Result of consulting the relevance oracle for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum VerdictOutcome {
    #[default]
    Absent,
    Classified(Classification),
    Failed(OracleError),
}

impl VerdictOutcome {
    pub fn bonus(&self) -> u32 {
        match self {
            Self::Classified(c) => c.verdict.weight(),
            Self::Absent | Self::Failed(_) => 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// One ranked candidate. Produced per ranking pass, never persisted by the pipeline itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityResult {
    pub candidate: JobCandidate,
    pub score: u32,
    pub priority: Tier,
    pub explanation: String,
    /// Batch position of the first occurrence, used as the tie breaker.
    pub position: usize,
}

/// Attributes handed to the job store on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttributes {
    pub candidate: JobCandidate,
    pub score: Option<u32>,
    pub priority: Option<Tier>,
    pub explanation: Option<String>,
}

impl From<&PriorityResult> for JobAttributes {
    fn from(result: &PriorityResult) -> Self {
        Self {
            candidate: result.candidate.clone(),
            score: Some(result.score),
            priority: Some(result.priority),
            explanation: Some(result.explanation.clone()),
        }
    }
}

/// Persisted job as held by a job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub candidate: JobCandidate,
    pub status: JobStatus,
    pub score: Option<u32>,
    pub priority: Option<Tier>,
    pub explanation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn identifier(&self) -> &str {
        &self.candidate.identifier
    }

    pub fn new(attributes: JobAttributes, now: DateTime<Utc>) -> Self {
        Self {
            candidate: attributes.candidate,
            status: JobStatus::New,
            score: attributes.score,
            priority: attributes.priority,
            explanation: attributes.explanation,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces attributes and score; status and creation time survive.
    pub fn apply(&mut self, attributes: JobAttributes, now: DateTime<Utc>) {
        self.candidate = attributes.candidate;
        self.score = attributes.score;
        self.priority = attributes.priority;
        self.explanation = attributes.explanation;
        self.updated_at = now;
    }
}

/// A record dropped from a batch, with the reason it was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub position: usize,
    pub identifier: Option<String>,
    pub reason: RecordError,
}

fn braced(names: &BTreeSet<String>) -> String {
    format!(
        "{{{}}}",
        names.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
    )
}

/// Record-level defects; recovered by skip + log.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RecordError {
    #[error("unexpected record shape at position {position}: expected an object, found {found}")]
    UnexpectedRecordShape { position: usize, found: String },
    #[error("missing required fields {}", braced(.0))]
    MissingFields(BTreeSet<String>),
    #[error("invalid job type `{0}`")]
    InvalidJobType(String),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

impl RecordError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnexpectedRecordShape { .. } => "UnexpectedRecordShape",
            Self::MissingFields(_) => "MissingFields",
            Self::InvalidJobType(_) => "InvalidJobType",
            Self::InvalidField { .. } => "InvalidField",
        }
    }

    pub fn missing<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::MissingFields(names.into_iter().map(Into::into).collect())
    }
}

/// Batch-level failures; fatal to the run that hit them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("malformed batch: {0}")]
    MalformedBatch(String),
    #[error("batch cancelled after scoring {scored} candidates")]
    Cancelled { scored: usize },
}

/// Candidate-level oracle failures; recovered by scoring with a neutral signal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OracleError {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle failure: {0}")]
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("store write failed for {identifier}: {reason}")]
    WriteFailure { identifier: String, reason: String },
    #[error("job {0} not found")]
    NotFound(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriteriaError {
    #[error(transparent)]
    InvalidTier(#[from] InvalidTier),
    #[error("criterion name must not be empty")]
    EmptyName,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_normalizes_by_substring() {
        assert_eq!(JobType::normalize("  Hourly: $15-$25 "), Some(JobType::Hourly));
        assert_eq!(JobType::normalize("FIXED-PRICE"), Some(JobType::Fixed));
        assert_eq!(JobType::normalize("fixed or hourly"), Some(JobType::Hourly));
        assert_eq!(JobType::normalize("contract"), None);
        assert_eq!(
            "retainer".parse::<JobType>(),
            Err(RecordError::InvalidJobType("retainer".into()))
        );
    }

    #[test]
    fn tier_parsing_is_case_insensitive_and_strict() {
        assert_eq!(" high ".parse::<Tier>(), Ok(Tier::High));
        assert_eq!("MEDIUM".parse::<Tier>(), Ok(Tier::Medium));
        assert_eq!("Urgent".parse::<Tier>(), Err(InvalidTier("Urgent".into())));
        assert_eq!(Tier::ALL.map(Tier::weight), [3, 2, 1]);
    }

    #[test]
    fn status_accepts_ui_spellings() {
        assert_eq!("Not Interested".parse::<JobStatus>(), Ok(JobStatus::NotInterested));
        assert_eq!("not_interested".parse::<JobStatus>(), Ok(JobStatus::NotInterested));
        assert_eq!("applied".parse::<JobStatus>(), Ok(JobStatus::Applied));
        assert!("archived".parse::<JobStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStatus::NotInterested).unwrap(),
            "\"Not Interested\""
        );
    }

    #[test]
    fn failed_verdicts_contribute_nothing() {
        let classified = VerdictOutcome::Classified(Classification {
            verdict: Tier::Medium,
            explanation: "close match".into(),
        });
        assert_eq!(classified.bonus(), 2);
        assert_eq!(VerdictOutcome::Absent.bonus(), 0);
        let failed = VerdictOutcome::Failed(OracleError::Timeout(Duration::from_secs(2)));
        assert_eq!(failed.bonus(), 0);
        assert!(failed.is_failure());
    }

    #[test]
    fn missing_fields_display_lists_names() {
        let err = RecordError::missing(["title", "description"]);
        assert_eq!(err.to_string(), "missing required fields {description, title}");
        assert_eq!(err.kind(), "MissingFields");
    }

    #[test]
    fn budget_is_the_lower_bound_of_the_rate() {
        let mut job = JobCandidate {
            identifier: "1".into(),
            title: "t".into(),
            description: "d".into(),
            job_type: JobType::Hourly,
            experience_level: "Expert".into(),
            duration: "Ongoing".into(),
            rate: Some("$15.00 - $30.00".into()),
            client_info: None,
            posted_at: "today".into(),
            skills: vec![],
            category: None,
            country: None,
            payment_verified: None,
            proposal_count: None,
            client_rating: None,
            client_spend: None,
        };
        assert_eq!(job.budget(), Some(15.0));
        job.rate = Some("$1,200".into());
        assert_eq!(job.budget(), Some(1200.0));
        job.rate = Some("Negotiable".into());
        assert_eq!(job.budget(), None);
        job.rate = None;
        assert_eq!(job.budget(), None);
    }
}

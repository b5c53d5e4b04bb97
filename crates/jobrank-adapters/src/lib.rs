//! Source fetchers, record normalization and candidate validation.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use async_trait::async_trait;
use jobrank_core::{BatchError, JobCandidate, JobType, RawRecord, RecordError, SkippedRecord};
use jobrank_storage::{FetchError, HttpFetcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobrank-adapters";

/// Key the source fetcher puts the record list under.
pub const DEFAULT_RECORDS_KEY: &str = "projects";

/// Digits in a generated fallback identifier.
pub const FALLBACK_ID_LEN: u32 = 21;

/// Record keys searched, in order, for an href-like identifier.
const IDENTIFIER_KEYS: [&str; 4] = ["id", "href", "url", "link"];

macro_rules! re {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("static regex compiles"));
    };
}

// The whole `_~` token must be digits; `_~01abc` is not an identifier.
re!(HREF_ID_RE, r"_~(\d+)(?:[/?#&]|$)");
re!(
    RATE_RE,
    r"^[$€£¥₹]\s*\d[\d,]*(?:\.\d+)?(?:\s*-\s*[$€£¥₹]?\s*\d[\d,]*(?:\.\d+)?)?"
);
re!(RATING_RE, r"(\d+(?:\.\d+)?)\s*/\s*5\b");
re!(
    SPEND_RE,
    r"(?i)\$\s*(\d[\d,]*(?:\.\d+)?)\s*([km])?\+?\s*(?:total\s+)?(?:spent|paid)"
);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("batch document is not valid JSON: {0}")]
    Unparseable(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Collaborator that hands over one raw batch document.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_batch(&self) -> Result<JsonValue, AdapterError>;
}

fn parse_batch_bytes(origin: &str, bytes: &[u8]) -> Result<JsonValue, AdapterError> {
    serde_json::from_slice(bytes).map_err(|e| AdapterError::Unparseable(format!("{origin}: {e}")))
}

/// Reads a batch document from disk.
#[derive(Debug, Clone)]
pub struct FileBatchFetcher {
    path: PathBuf,
}

impl FileBatchFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceFetcher for FileBatchFetcher {
    fn source_id(&self) -> &str {
        "file"
    }

    async fn fetch_batch(&self) -> Result<JsonValue, AdapterError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading batch {}", self.path.display()))?;
        parse_batch_bytes(&self.path.display().to_string(), &bytes)
    }
}

/// Fetches a batch document over HTTP with the shared retrying client.
#[derive(Debug, Clone)]
pub struct HttpBatchFetcher {
    http: Arc<HttpFetcher>,
    url: String,
}

impl HttpBatchFetcher {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SourceFetcher for HttpBatchFetcher {
    fn source_id(&self) -> &str {
        "http"
    }

    async fn fetch_batch(&self) -> Result<JsonValue, AdapterError> {
        let response = self.http.get_bytes(&self.url).await?;
        debug!(
            status = %response.status,
            url = %response.final_url,
            bytes = response.body.len(),
            "fetched batch"
        );
        parse_batch_bytes(&response.final_url, &response.body)
    }
}

/// Raw records with identifiers attached, plus the records that had to be dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBatch {
    pub records: Vec<RawRecord>,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    records_key: String,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_RECORDS_KEY)
    }
}

impl RecordNormalizer {
    pub fn new(records_key: impl Into<String>) -> Self {
        Self {
            records_key: records_key.into(),
        }
    }

    pub fn records_key(&self) -> &str {
        &self.records_key
    }

    /// Rejects the whole batch unless it is an object holding a record array under the key.
    pub fn records<'a>(&self, batch: &'a JsonValue) -> Result<&'a [JsonValue], BatchError> {
        let object = batch.as_object().ok_or_else(|| {
            BatchError::MalformedBatch(format!("expected an object, found {}", json_kind(batch)))
        })?;
        let records = object.get(&self.records_key).ok_or_else(|| {
            BatchError::MalformedBatch(format!("missing `{}` key", self.records_key))
        })?;
        records.as_array().map(Vec::as_slice).ok_or_else(|| {
            BatchError::MalformedBatch(format!(
                "`{}` is {}, expected an array",
                self.records_key,
                json_kind(records)
            ))
        })
    }

    pub fn normalize_batch(&self, batch: &JsonValue) -> Result<NormalizedBatch, BatchError> {
        let mut out = NormalizedBatch::default();
        for (position, value) in self.records(batch)?.iter().enumerate() {
            match normalize_record(position, value) {
                Ok(record) => out.records.push(record),
                Err(reason) => {
                    warn!(position, %reason, "skipping record");
                    out.skipped.push(SkippedRecord {
                        position,
                        identifier: None,
                        reason,
                    });
                }
            }
        }
        Ok(out)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

pub fn normalize_record(position: usize, value: &JsonValue) -> Result<RawRecord, RecordError> {
    let JsonValue::Object(fields) = value else {
        return Err(RecordError::UnexpectedRecordShape {
            position,
            found: json_kind(value).to_string(),
        });
    };
    let identifier = extract_identifier(fields).unwrap_or_else(|| {
        let generated = fallback_identifier();
        debug!(position, identifier = %generated, "no href token, generated fallback identifier");
        JsonValue::String(generated)
    });
    Ok(RawRecord {
        position,
        identifier,
        fields: fields.clone(),
    })
}

/// Numeric ids are used as-is; string ids must carry an `_~<digits>` token.
pub fn extract_identifier(fields: &Map<String, JsonValue>) -> Option<JsonValue> {
    for key in IDENTIFIER_KEYS {
        match fields.get(key) {
            Some(JsonValue::Number(n)) => return Some(JsonValue::Number(n.clone())),
            Some(JsonValue::String(href)) => {
                if let Some(token) = identifier_from_href(href) {
                    return Some(JsonValue::String(token));
                }
            }
            _ => {}
        }
    }
    None
}

pub fn identifier_from_href(href: &str) -> Option<String> {
    HREF_ID_RE
        .captures(href)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn fallback_identifier() -> String {
    let modulus = 10u128.pow(FALLBACK_ID_LEN);
    format!(
        "{:0width$}",
        Uuid::new_v4().as_u128() % modulus,
        width = FALLBACK_ID_LEN as usize
    )
}

/// Accepted raw keys per canonical field, first match wins.
fn aliases(field: &str) -> &'static [&'static str] {
    match field {
        "title" => &["title"],
        "description" => &["description"],
        "job_type" => &["job_type", "type"],
        "experience_level" => &["experience_level", "experience"],
        "duration" => &["duration"],
        "posted_at" => &["posted_at", "date_time", "posted"],
        "rate" => &["rate", "budget"],
        "client_info" => &["client_info", "client_information"],
        "skills" => &["skills"],
        "category" => &["category"],
        "country" => &["country"],
        "payment_verified" => &["payment_verified"],
        "proposal_count" => &["proposal_count", "proposals"],
        "client_rating" => &["client_rating", "ratings", "rating"],
        "client_spend" => &["client_spend", "spent", "spend"],
        _ => &[],
    }
}

fn lookup<'a>(fields: &'a Map<String, JsonValue>, field: &str) -> Option<&'a JsonValue> {
    aliases(field)
        .iter()
        .filter_map(|key| fields.get(*key))
        .find(|v| !v.is_null())
}

fn coerce_text(field: &str, value: Option<&JsonValue>) -> Result<Option<String>, RecordError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(JsonValue::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(RecordError::InvalidField {
            field: field.to_string(),
            reason: format!("expected text, found {}", json_kind(other)),
        }),
    }
}

fn coerce_identifier(value: &JsonValue) -> Result<Option<String>, RecordError> {
    match value {
        JsonValue::String(_) | JsonValue::Number(_) | JsonValue::Null => {
            coerce_text("identifier", Some(value))
        }
        other => Err(RecordError::InvalidField {
            field: "identifier".into(),
            reason: format!("expected text or number, found {}", json_kind(other)),
        }),
    }
}

/// True when `rest` starts with exactly three digits, i.e. the comma before it groups thousands.
fn thousands_group(rest: &[char]) -> bool {
    rest.len() >= 3
        && rest[..3].iter().all(char::is_ascii_digit)
        && !rest.get(3).is_some_and(char::is_ascii_digit)
}

/// Pulls decimal numbers out of free text, ignoring thousands separators.
fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    let flush = |current: &mut String, seen_dot: &mut bool, out: &mut Vec<f64>| {
        let cleaned = current.trim_end_matches('.');
        if let Ok(v) = cleaned.parse::<f64>() {
            out.push(v);
        }
        current.clear();
        *seen_dot = false;
    };
    let chars: Vec<char> = text.chars().collect();
    for (idx, &ch) in chars.iter().enumerate() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if ch == ',' && !current.is_empty() && !seen_dot && thousands_group(&chars[idx + 1..]) {
            continue;
        } else if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
        } else if !current.is_empty() {
            flush(&mut current, &mut seen_dot, &mut out);
        }
    }
    if !current.is_empty() {
        flush(&mut current, &mut seen_dot, &mut out);
    }
    out
}

/// Parses "$10K+", "1,250.50" and similar into a plain amount.
fn parse_amount(text: &str) -> Option<f64> {
    let lower = text.to_ascii_lowercase();
    let value = extract_numbers(&lower).into_iter().next()?;
    let after_digits = lower
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == ',' || c == '.')
        .trim_start();
    let multiplier = match after_digits.chars().next() {
        Some('k') => 1_000.0,
        Some('m') => 1_000_000.0,
        _ => 1.0,
    };
    Some(value * multiplier)
}

fn optional_f64(value: Option<&JsonValue>) -> Option<f64> {
    let v = match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_amount(s),
        _ => None,
    }?;
    (v.is_finite() && v >= 0.0).then_some(v)
}

fn optional_rating(value: Option<&JsonValue>) -> Option<f64> {
    let v = match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => extract_numbers(s).into_iter().next(),
        _ => None,
    }?;
    (v.is_finite() && (0.0..=5.0).contains(&v)).then_some(v)
}

fn optional_count(value: Option<&JsonValue>) -> Option<u32> {
    let v = match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => extract_numbers(s).into_iter().next(),
        _ => None,
    }?;
    (v.is_finite() && v >= 0.0).then(|| v.min(u32::MAX as f64) as u32)
}

fn optional_bool(value: Option<&JsonValue>) -> Option<bool> {
    match value? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_i64().map(|n| n != 0),
        JsonValue::String(s) => verification_flag(s),
        _ => None,
    }
}

fn verification_flag(text: &str) -> Option<bool> {
    let lower = text.trim().to_ascii_lowercase();
    if lower.contains("unverified") || lower.contains("not verified") {
        return Some(false);
    }
    match lower.as_str() {
        "true" | "yes" | "y" | "1" | "verified" | "payment verified" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn optional_text(field: &str, value: Option<&JsonValue>) -> Option<String> {
    coerce_text(field, value).ok().flatten()
}

fn optional_skills(value: Option<&JsonValue>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| optional_text("skills", Some(item)))
            .collect(),
        Some(JsonValue::String(s)) => s.split([',', ';', '|']).map(str::to_string).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn check_rate(rate: &str) -> Result<(), RecordError> {
    if RATE_RE.is_match(rate) {
        Ok(())
    } else {
        Err(RecordError::InvalidField {
            field: "rate".into(),
            reason: format!("`{rate}` is not a currency amount or range such as $500 or $15-$25"),
        })
    }
}

/// Enforces the candidate schema. Pure: never logs, never panics.
pub fn validate_record(raw: &RawRecord) -> Result<JobCandidate, RecordError> {
    let fields = &raw.fields;
    let mut missing = BTreeSet::new();

    let identifier = coerce_identifier(&raw.identifier)?;
    if identifier.is_none() {
        missing.insert("identifier".to_string());
    }

    let mut required = |name: &str| -> Result<Option<String>, RecordError> {
        let value = coerce_text(name, lookup(fields, name))?;
        if value.is_none() {
            missing.insert(name.to_string());
        }
        Ok(value)
    };
    let title = required("title")?;
    let description = required("description")?;
    let job_type_raw = required("job_type")?;
    let experience_level = required("experience_level")?;
    let duration = required("duration")?;
    let posted_at = required("posted_at")?;

    let (
        Some(identifier),
        Some(title),
        Some(description),
        Some(job_type_raw),
        Some(experience_level),
        Some(duration),
        Some(posted_at),
    ) = (
        identifier,
        title,
        description,
        job_type_raw,
        experience_level,
        duration,
        posted_at,
    )
    else {
        return Err(RecordError::MissingFields(missing));
    };

    let job_type = JobType::normalize(&job_type_raw)
        .ok_or_else(|| RecordError::InvalidJobType(job_type_raw.clone()))?;

    let rate = coerce_text("rate", lookup(fields, "rate"))?;
    if let Some(rate) = &rate {
        check_rate(rate)?;
    }

    Ok(JobCandidate {
        identifier,
        title,
        description,
        job_type,
        experience_level,
        duration,
        rate,
        client_info: optional_text("client_info", lookup(fields, "client_info")),
        posted_at,
        skills: optional_skills(lookup(fields, "skills")),
        category: optional_text("category", lookup(fields, "category")),
        country: optional_text("country", lookup(fields, "country")),
        payment_verified: optional_bool(lookup(fields, "payment_verified")),
        proposal_count: optional_count(lookup(fields, "proposal_count")),
        client_rating: optional_rating(lookup(fields, "client_rating")),
        client_spend: optional_f64(lookup(fields, "client_spend")),
    })
}

/// Structured signals recovered from a free-text client blurb.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSignals {
    pub country: Option<String>,
    pub rating: Option<f64>,
    pub spend: Option<f64>,
    pub payment_verified: Option<bool>,
}

const NON_COUNTRY_WORDS: [&str; 8] = [
    "payment", "verified", "unverified", "rating", "review", "spent", "hire", "member",
];

fn leading_country(text: &str) -> Option<String> {
    text.split(['\n', ',', '|', '·', '•'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split(|c: char| c.is_ascii_digit() || c == '$' || c == '(')
                .next()
                .unwrap_or_default()
                .trim()
        })
        .find(|candidate| {
            let lower = candidate.to_ascii_lowercase();
            !candidate.is_empty()
                && candidate.len() <= 40
                && candidate
                    .chars()
                    .all(|c| c.is_alphabetic() || c == ' ' || c == '.' || c == '-')
                && !NON_COUNTRY_WORDS.iter().any(|w| lower.contains(w))
        })
        .map(str::to_string)
}

pub fn extract_client_info(text: &str) -> ClientSignals {
    let rating = RATING_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|r| (0.0..=5.0).contains(r));
    let spend = SPEND_RE.captures(text).and_then(|c| {
        let base = c.get(1)?.as_str().replace(',', "").parse::<f64>().ok()?;
        let multiplier = match c.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(s) if s == "k" => 1_000.0,
            Some(s) if s == "m" => 1_000_000.0,
            _ => 1.0,
        };
        Some(base * multiplier)
    });
    let lower = text.to_ascii_lowercase();
    let payment_verified = if lower.contains("payment unverified") || lower.contains("payment not verified") {
        Some(false)
    } else if lower.contains("payment verified") {
        Some(true)
    } else {
        None
    };
    ClientSignals {
        country: leading_country(text),
        rating,
        spend,
        payment_verified,
    }
}

/// Fills absent structured client fields from `client_info`; supplied fields always win.
pub fn enrich_from_client_info(mut candidate: JobCandidate) -> JobCandidate {
    let Some(text) = candidate.client_info.as_deref() else {
        return candidate;
    };
    let signals = extract_client_info(text);
    if candidate.client_rating.is_none() {
        candidate.client_rating = signals.rating;
    }
    if candidate.client_spend.is_none() {
        candidate.client_spend = signals.spend;
    }
    if candidate.country.is_none() {
        candidate.country = signals.country;
    }
    if candidate.payment_verified.is_none() {
        candidate.payment_verified = signals.payment_verified;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn well_formed(id: &str) -> JsonValue {
        json!({
            "id": format!("https://www.upwork.com/jobs/Airtable-CRM_~{id}/"),
            "title": "Airtable CRM build",
            "description": "Set up a simple CRUD app in Airtable with Zapier hooks",
            "job_type": "Fixed-price",
            "experience_level": "Intermediate",
            "duration": "Less than 1 month",
            "rate": "$500",
            "date_time": "2024-05-01T10:00:00Z",
            "client_information": "United States 4.9/5 $12K+ spent",
        })
    }

    fn raw(value: JsonValue) -> RawRecord {
        normalize_record(0, &value).expect("object record")
    }

    #[test]
    fn href_token_becomes_identifier() {
        let record = raw(well_formed("021793212345"));
        assert_eq!(record.identifier, json!("021793212345"));
        let again = raw(well_formed("021793212345"));
        assert_eq!(record.identifier, again.identifier);
    }

    #[test]
    fn missing_token_generates_distinct_fixed_length_fallbacks() {
        let mut value = well_formed("1");
        value["id"] = json!("https://www.upwork.com/jobs/no-token-here");
        let a = raw(value.clone());
        let b = raw(value);
        let (JsonValue::String(a_id), JsonValue::String(b_id)) = (&a.identifier, &b.identifier) else {
            panic!("fallback identifiers are strings");
        };
        assert_ne!(a_id, b_id);
        assert_eq!(a_id.len(), 21);
        assert!(a_id.chars().all(|c| c.is_ascii_digit()));
        assert!(validate_record(&a).is_ok());
        assert!(validate_record(&b).is_ok());
    }

    #[test]
    fn partly_numeric_href_token_falls_back() {
        assert_eq!(identifier_from_href("https://www.upwork.com/jobs/A_~01abc123/"), None);
        assert_eq!(identifier_from_href("https://www.upwork.com/jobs/B_~01xyz789/"), None);
        assert_eq!(
            identifier_from_href("https://www.upwork.com/jobs/C_~0123?source=rss"),
            Some("0123".to_string())
        );
        assert_eq!(identifier_from_href("/jobs/D_~0456"), Some("0456".to_string()));

        let mut a = well_formed("01abc123");
        a["href"] = json!("https://www.upwork.com/jobs/A_~0199/");
        assert_eq!(raw(a).identifier, json!("0199"));

        let a = raw(well_formed("01abc123"));
        let b = raw(well_formed("01xyz789"));
        let (JsonValue::String(a_id), JsonValue::String(b_id)) = (&a.identifier, &b.identifier) else {
            panic!("fallback identifiers are strings");
        };
        assert_eq!(a_id.len(), 21);
        assert_ne!(a_id, b_id);
    }

    #[test]
    fn commas_only_group_thousands() {
        assert_eq!(extract_numbers("5, 10"), vec![5.0, 10.0]);
        assert_eq!(extract_numbers("$1,250.50 spent"), vec![1250.5]);
        assert_eq!(extract_numbers("1,25"), vec![1.0, 25.0]);
        assert_eq!(extract_numbers("12,3456"), vec![12.0, 3456.0]);
        assert_eq!(optional_count(Some(&json!("5, 10"))), Some(5));
        assert_eq!(optional_f64(Some(&json!("$1,000,000"))), Some(1_000_000.0));
    }

    #[test]
    fn numeric_id_is_coerced_to_text() {
        let mut value = well_formed("1");
        value["id"] = json!(4242);
        let candidate = validate_record(&raw(value)).expect("valid");
        assert_eq!(candidate.identifier, "4242");
    }

    #[test]
    fn non_object_batches_are_malformed() {
        let normalizer = RecordNormalizer::default();
        for batch in [json!([well_formed("1")]), json!({"jobs": []}), json!({"projects": "nope"})] {
            assert!(matches!(
                normalizer.normalize_batch(&batch),
                Err(BatchError::MalformedBatch(_))
            ));
        }
    }

    #[test]
    fn non_object_records_are_skipped_without_stopping_the_batch() {
        let batch = json!({"projects": [well_formed("11"), "garbage", well_formed("12")]});
        let normalized = RecordNormalizer::default().normalize_batch(&batch).unwrap();
        assert_eq!(normalized.records.len(), 2);
        assert_eq!(normalized.records[1].position, 2);
        assert_eq!(normalized.skipped.len(), 1);
        assert_eq!(
            normalized.skipped[0].reason,
            RecordError::UnexpectedRecordShape {
                position: 1,
                found: "a string".into()
            }
        );
    }

    #[test]
    fn missing_and_blank_fields_are_reported_together() {
        let mut value = well_formed("5");
        value.as_object_mut().unwrap().remove("description");
        value["title"] = json!("   ");
        let err = validate_record(&raw(value)).unwrap_err();
        assert_eq!(err, RecordError::missing(["description", "title"]));
    }

    #[test]
    fn job_type_outside_hourly_fixed_is_rejected() {
        let mut value = well_formed("6");
        value["job_type"] = json!("Retainer");
        assert_eq!(
            validate_record(&raw(value)).unwrap_err(),
            RecordError::InvalidJobType("Retainer".into())
        );
    }

    #[test]
    fn rate_must_start_with_currency_symbol() {
        for ok in ["$500", "$15.00 - $35.00", "$15-25/hr", "€1,200"] {
            let mut value = well_formed("7");
            value["rate"] = json!(ok);
            assert!(validate_record(&raw(value)).is_ok(), "{ok} should pass");
        }
        let mut value = well_formed("7");
        value["rate"] = json!("500 USD");
        assert!(matches!(
            validate_record(&raw(value)),
            Err(RecordError::InvalidField { ref field, .. }) if field == "rate"
        ));
    }

    #[test]
    fn structured_attributes_are_coerced_leniently() {
        let mut value = well_formed("8");
        let obj = value.as_object_mut().unwrap();
        obj.insert("skills".into(), json!("Airtable, Zapier , "));
        obj.insert("proposals".into(), json!("5 to 10"));
        obj.insert("payment_verified".into(), json!("Payment verified"));
        obj.insert("client_rating".into(), json!("4.7 of 5"));
        obj.insert("client_spend".into(), json!("$10K+"));
        obj.insert("category".into(), json!({"nested": true}));
        let candidate = validate_record(&raw(value)).unwrap();
        assert_eq!(candidate.skills, vec!["Airtable", "Zapier"]);
        assert_eq!(candidate.proposal_count, Some(5));
        assert_eq!(candidate.payment_verified, Some(true));
        assert_eq!(candidate.client_rating, Some(4.7));
        assert_eq!(candidate.client_spend, Some(10_000.0));
        assert_eq!(candidate.category, None);
        assert_eq!(candidate.job_type, JobType::Fixed);
        assert_eq!(candidate.posted_at, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn client_info_fills_only_absent_fields() {
        let signals = extract_client_info("Payment verified, United States, 4.9/5 (12 reviews), $1,250+ spent");
        assert_eq!(signals.country.as_deref(), Some("United States"));
        assert_eq!(signals.rating, Some(4.9));
        assert_eq!(signals.spend, Some(1250.0));
        assert_eq!(signals.payment_verified, Some(true));

        let mut value = well_formed("9");
        value["client_rating"] = json!(3.2);
        let candidate = enrich_from_client_info(validate_record(&raw(value)).unwrap());
        assert_eq!(candidate.client_rating, Some(3.2));
        assert_eq!(candidate.client_spend, Some(12_000.0));
        assert_eq!(candidate.country.as_deref(), Some("United States"));
    }

    #[tokio::test]
    async fn file_fetcher_reads_and_rejects_non_json() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("batch.json");
        std::fs::write(&good, json!({"projects": [well_formed("1")]}).to_string()).unwrap();
        let batch = FileBatchFetcher::new(&good).fetch_batch().await.unwrap();
        assert_eq!(batch["projects"].as_array().map(Vec::len), Some(1));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "<html>not json</html>").unwrap();
        match FileBatchFetcher::new(&bad).fetch_batch().await {
            Err(AdapterError::Unparseable(message)) => assert!(message.contains("bad.json")),
            other => panic!("expected an unparseable batch, got {other:?}"),
        }
    }
}

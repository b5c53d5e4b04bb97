//! Deduplication, criteria scoring, batch prioritization and the sync run that ties them together.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use jobrank_adapters::{
    enrich_from_client_info, validate_record, FileBatchFetcher, HttpBatchFetcher,
    NormalizedBatch, RecordNormalizer, SourceFetcher, DEFAULT_RECORDS_KEY,
};
use jobrank_core::{
    BatchError, CriteriaError, JobAttributes, JobCandidate, PriorityResult, SkippedRecord,
    StoreError, Tier, VerdictOutcome,
};
use jobrank_oracle::{classify_with_deadline, ChatCompletionsOracle, ChatOracleConfig, RelevanceOracle};
use jobrank_storage::{
    write_atomically, HttpClientConfig, HttpFetcher, JobStore, JsonFileJobStore, PgJobStore,
    UpsertOutcome,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobrank-sync";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub budget_floor: f64,
    pub rating_floor: f64,
    pub client_bonus: u32,
    pub client_penalty: u32,
    pub high_threshold: u32,
    pub medium_threshold: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            budget_floor: 1000.0,
            rating_floor: 4.0,
            client_bonus: 1,
            client_penalty: 1,
            high_threshold: 6,
            medium_threshold: 3,
        }
    }
}

impl ScoringConfig {
    pub fn bucket(&self, score: u32) -> Tier {
        if score >= self.high_threshold {
            Tier::High
        } else if score >= self.medium_threshold {
            Tier::Medium
        } else {
            Tier::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub tier: Tier,
    /// Inactive criteria stay in the set but are skipped by scoring and the oracle.
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

impl Criterion {
    fn new(name: &str, tier: Tier) -> Self {
        Self {
            name: name.to_string(),
            tier,
            active: true,
        }
    }
}

/// Ordered criterion name to tier mapping. Names are unique ignoring case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriteriaSet {
    entries: Vec<Criterion>,
}

impl CriteriaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defaults() -> Self {
        let mut set = Self::new();
        for (name, tier) in [
            ("airtable", Tier::High),
            ("zapier", Tier::High),
            ("calendly", Tier::Medium),
            ("crud", Tier::Medium),
            ("automation", Tier::Low),
        ] {
            set.entries.push(Criterion::new(name, tier));
        }
        set
    }

    fn position(&self, name: &str) -> Option<usize> {
        let key = name.trim().to_lowercase();
        self.entries
            .iter()
            .position(|c| c.name.to_lowercase() == key)
    }

    /// Last write wins; an existing name keeps its place in the order and its active flag.
    pub fn upsert(&mut self, name: &str, tier: Tier) -> Result<(), CriteriaError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(CriteriaError::EmptyName);
        }
        match self.position(trimmed) {
            Some(idx) => self.entries[idx].tier = tier,
            None => self.entries.push(Criterion::new(trimmed, tier)),
        }
        Ok(())
    }

    /// Returns the updated criterion, or `None` when no criterion has that name.
    pub fn set_active(&mut self, name: &str, active: bool) -> Option<Criterion> {
        let idx = self.position(name)?;
        self.entries[idx].active = active;
        Some(self.entries[idx].clone())
    }

    pub fn find(&self, name: &str) -> Option<&Criterion> {
        self.position(name).map(|idx| &self.entries[idx])
    }

    pub fn remove(&mut self, name: &str) -> Option<Criterion> {
        self.position(name).map(|idx| self.entries.remove(idx))
    }

    pub fn get(&self, name: &str) -> Option<Tier> {
        self.position(name).map(|idx| self.entries[idx].tier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Criterion> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &Criterion> {
        self.entries.iter().filter(|c| c.active)
    }

    /// Names of the active criteria, in order.
    pub fn names(&self) -> Vec<String> {
        self.active().map(|c| c.name.clone()).collect()
    }
}

/// Score with the terms that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub score: u32,
    pub matched: Vec<String>,
    pub keyword_points: u32,
    pub client_points: i64,
    pub oracle_points: u32,
    pub explanation: String,
}

fn client_term(
    candidate: &JobCandidate,
    config: &ScoringConfig,
) -> (i64, String) {
    let (Some(spend), Some(rating)) = (candidate.client_spend, candidate.client_rating) else {
        return (0, "client: no spend/rating data (+0)".to_string());
    };
    let bonus = i64::from(config.client_bonus);
    let penalty = -i64::from(config.client_penalty);
    let (spend_points, spend_cmp) = if spend >= config.budget_floor {
        (bonus, ">=")
    } else {
        (penalty, "<")
    };
    let (rating_points, rating_cmp) = if rating >= config.rating_floor {
        (bonus, ">=")
    } else {
        (penalty, "<")
    };
    (
        spend_points + rating_points,
        format!(
            "client: spend ${spend:.0} {spend_cmp} ${:.0} ({spend_points:+}), rating {rating:.1} {rating_cmp} {:.1} ({rating_points:+})",
            config.budget_floor, config.rating_floor
        ),
    )
}

fn oracle_term(verdict: &VerdictOutcome) -> String {
    match verdict {
        VerdictOutcome::Classified(c) if c.explanation.is_empty() => {
            format!("oracle: {} (+{})", c.verdict, c.verdict.weight())
        }
        VerdictOutcome::Classified(c) => {
            format!("oracle: {} (+{}) {}", c.verdict, c.verdict.weight(), c.explanation)
        }
        VerdictOutcome::Failed(err) => format!("oracle: unavailable (+0) {err}"),
        VerdictOutcome::Absent => "oracle: not consulted (+0)".to_string(),
    }
}

/// Pure scoring of one candidate against a criteria snapshot.
pub fn score_candidate(
    criteria: &CriteriaSet,
    config: &ScoringConfig,
    candidate: &JobCandidate,
    verdict: &VerdictOutcome,
) -> ScoreBreakdown {
    let haystack = candidate.search_text();
    let mut matched = Vec::new();
    let mut keyword_points = 0u32;
    let mut matched_terms = Vec::new();
    for criterion in criteria.active() {
        if haystack.contains(&criterion.name.to_lowercase()) {
            keyword_points += criterion.tier.weight();
            matched_terms.push(format!(
                "{} ({} +{})",
                criterion.name,
                criterion.tier,
                criterion.tier.weight()
            ));
            matched.push(criterion.name.clone());
        }
    }
    let keyword_text = if matched_terms.is_empty() {
        "criteria: no match".to_string()
    } else {
        format!("criteria: {}", matched_terms.join(", "))
    };

    let (client_points, client_text) = client_term(candidate, config);
    let oracle_points = verdict.bonus();
    let total = i64::from(keyword_points) + client_points + i64::from(oracle_points);
    let score = u32::try_from(total.max(0)).unwrap_or(u32::MAX);

    ScoreBreakdown {
        score,
        matched,
        keyword_points,
        client_points,
        oracle_points,
        explanation: [keyword_text, client_text, oracle_term(verdict)].join("; "),
    }
}

/// Owns the live criteria set and hands out immutable snapshots of it.
#[derive(Debug)]
pub struct CriteriaEngine {
    current: RwLock<Arc<CriteriaSet>>,
    scoring: ScoringConfig,
}

impl CriteriaEngine {
    pub fn new(criteria: CriteriaSet, scoring: ScoringConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(criteria)),
            scoring,
        }
    }

    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    pub fn snapshot(&self) -> Arc<CriteriaSet> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn update<R>(&self, f: impl FnOnce(&mut CriteriaSet) -> R) -> R {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = CriteriaSet::clone(&guard);
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }

    pub fn set_criterion(&self, name: &str, tier: &str) -> Result<Tier, CriteriaError> {
        let tier = tier.parse::<Tier>()?;
        self.upsert(name, tier)?;
        Ok(tier)
    }

    pub fn upsert(&self, name: &str, tier: Tier) -> Result<(), CriteriaError> {
        self.update(|set| set.upsert(name, tier))
    }

    pub fn remove(&self, name: &str) -> Option<Criterion> {
        self.update(|set| set.remove(name))
    }

    pub fn set_active(&self, name: &str, active: bool) -> Option<Criterion> {
        self.update(|set| set.set_active(name, active))
    }

    pub fn replace(&self, criteria: CriteriaSet) {
        self.update(|set| *set = criteria);
    }

    pub fn score(&self, candidate: &JobCandidate, verdict: &VerdictOutcome) -> ScoreBreakdown {
        score_candidate(&self.snapshot(), &self.scoring, candidate, verdict)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CriteriaFile {
    version: u32,
    #[serde(default)]
    criteria: Vec<CriterionEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CriterionEntry {
    name: String,
    tier: String,
    #[serde(default = "active_by_default")]
    active: bool,
}

pub fn parse_criteria_yaml(text: &str) -> Result<CriteriaSet> {
    let file: CriteriaFile = serde_yaml::from_str(text).context("parsing criteria yaml")?;
    let mut set = CriteriaSet::new();
    for entry in file.criteria {
        let tier = entry
            .tier
            .parse::<Tier>()
            .with_context(|| format!("criterion `{}`", entry.name))?;
        set.upsert(&entry.name, tier)
            .with_context(|| format!("criterion `{}`", entry.name))?;
        if !entry.active {
            set.set_active(&entry.name, false);
        }
    }
    Ok(set)
}

pub fn criteria_yaml(set: &CriteriaSet) -> Result<String> {
    let file = CriteriaFile {
        version: 1,
        criteria: set
            .iter()
            .map(|c| CriterionEntry {
                name: c.name.clone(),
                tier: c.tier.to_string(),
                active: c.active,
            })
            .collect(),
    };
    serde_yaml::to_string(&file).context("serializing criteria yaml")
}

/// Missing file yields the default keyword set.
pub async fn load_criteria(path: &Path) -> Result<CriteriaSet> {
    match fs::read_to_string(path).await {
        Ok(text) => parse_criteria_yaml(&text).with_context(|| format!("loading {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no criteria file, using defaults");
            Ok(CriteriaSet::defaults())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

pub async fn save_criteria(path: &Path, set: &CriteriaSet) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    write_atomically(path, criteria_yaml(set)?.as_bytes()).await
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduplicated {
    /// Batch position of the first occurrence, with the latest attributes.
    pub candidates: Vec<(usize, JobCandidate)>,
    pub duplicates: usize,
    pub known: usize,
    pub dropped_known: usize,
}

pub fn deduplicate(
    items: impl IntoIterator<Item = (usize, JobCandidate)>,
    known: &HashSet<String>,
    drop_known: bool,
) -> Deduplicated {
    let mut out = Deduplicated::default();
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut dropped: HashSet<String> = HashSet::new();
    for (position, candidate) in items {
        if let Some(&slot) = slots.get(&candidate.identifier) {
            out.candidates[slot].1 = candidate;
            out.duplicates += 1;
            continue;
        }
        if dropped.contains(&candidate.identifier) {
            out.duplicates += 1;
            continue;
        }
        if known.contains(&candidate.identifier) {
            out.known += 1;
            if drop_known {
                out.dropped_known += 1;
                dropped.insert(candidate.identifier);
                continue;
            }
        }
        slots.insert(candidate.identifier.clone(), out.candidates.len());
        out.candidates.push((position, candidate));
    }
    out
}

#[derive(Debug, Clone)]
pub struct PrioritizerConfig {
    pub oracle_timeout: Duration,
    pub oracle_concurrency: usize,
    pub batch_limit: usize,
    pub store_timeout: Duration,
    pub drop_known: bool,
    pub extract_client_info: bool,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            oracle_timeout: Duration::from_secs(10),
            oracle_concurrency: 4,
            batch_limit: 50,
            store_timeout: Duration::from_secs(10),
            drop_known: false,
            extract_client_info: true,
        }
    }
}

/// Counts for one ranking pass; always returned, even when most records were dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub received: usize,
    pub over_limit: usize,
    pub valid: usize,
    pub skipped: Vec<SkippedRecord>,
    pub skipped_by_reason: BTreeMap<String, usize>,
    pub duplicates: usize,
    pub known: usize,
    pub dropped_known: usize,
    pub oracle_failures: usize,
    pub ranked: usize,
    pub store_lookup_error: Option<String>,
}

impl BatchSummary {
    fn record_skip(&mut self, skipped: SkippedRecord) {
        *self
            .skipped_by_reason
            .entry(skipped.reason.kind().to_string())
            .or_default() += 1;
        self.skipped.push(skipped);
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedBatch {
    pub results: Vec<PriorityResult>,
    pub summary: BatchSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreFailure {
    pub identifier: String,
    pub reason: StoreError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistReport {
    pub created: usize,
    pub updated: usize,
    pub failures: Vec<StoreFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub ranked: RankedBatch,
    pub persisted: PersistReport,
}

fn identifier_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalize, validate, dedup, score and sort one batch.
pub struct Prioritizer {
    normalizer: RecordNormalizer,
    engine: Arc<CriteriaEngine>,
    oracle: Option<Arc<dyn RelevanceOracle>>,
    store: Option<Arc<dyn JobStore>>,
    config: PrioritizerConfig,
}

impl Prioritizer {
    pub fn new(engine: Arc<CriteriaEngine>, config: PrioritizerConfig) -> Self {
        Self {
            normalizer: RecordNormalizer::default(),
            engine,
            oracle: None,
            store: None,
            config,
        }
    }

    pub fn with_normalizer(mut self, normalizer: RecordNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RelevanceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn engine(&self) -> &Arc<CriteriaEngine> {
        &self.engine
    }

    pub fn config(&self) -> &PrioritizerConfig {
        &self.config
    }

    async fn known_identifiers(&self) -> Result<HashSet<String>, StoreError> {
        let Some(store) = &self.store else {
            return Ok(HashSet::new());
        };
        tokio::time::timeout(self.config.store_timeout, store.known_identifiers())
            .await
            .unwrap_or(Err(StoreError::Timeout(self.config.store_timeout)))
    }

    async fn consult_oracle(
        &self,
        candidates: &[(usize, JobCandidate)],
        criteria: &[String],
        cancel: &CancellationToken,
    ) -> Vec<Option<VerdictOutcome>> {
        let deadline = self.config.oracle_timeout;
        let criteria: Arc<[String]> = criteria.into();
        let calls = candidates
            .iter()
            .map(|(_, candidate)| {
                let oracle = self.oracle.clone();
                let criteria = Arc::clone(&criteria);
                let cancel = cancel.clone();
                let title = candidate.title.clone();
                let description = candidate.description.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some(match oracle {
                        Some(oracle) => {
                            classify_with_deadline(
                                &*oracle,
                                &title,
                                &description,
                                &criteria,
                                deadline,
                            )
                            .await
                        }
                        None => VerdictOutcome::Absent,
                    })
                }
            })
            .collect::<Vec<_>>();
        stream::iter(calls)
            .buffered(self.config.oracle_concurrency.max(1))
            .collect::<Vec<_>>()
            .await
    }

    /// Ranks a batch in memory. Nothing is written; see [`Prioritizer::persist`].
    pub async fn rank(
        &self,
        batch: &JsonValue,
        cancel: &CancellationToken,
    ) -> Result<RankedBatch, BatchError> {
        let NormalizedBatch {
            mut records,
            skipped,
        } = self.normalizer.normalize_batch(batch)?;

        let mut summary = BatchSummary {
            received: records.len() + skipped.len(),
            ..Default::default()
        };
        for skip in skipped {
            summary.record_skip(skip);
        }
        if records.len() > self.config.batch_limit {
            summary.over_limit = records.len() - self.config.batch_limit;
            warn!(
                limit = self.config.batch_limit,
                dropped = summary.over_limit,
                "batch exceeds size limit, truncating"
            );
            records.truncate(self.config.batch_limit);
        }

        let mut valid = Vec::with_capacity(records.len());
        for raw in &records {
            match validate_record(raw) {
                Ok(candidate) if self.config.extract_client_info => {
                    valid.push((raw.position, enrich_from_client_info(candidate)))
                }
                Ok(candidate) => valid.push((raw.position, candidate)),
                Err(reason) => {
                    let identifier = identifier_text(&raw.identifier);
                    warn!(
                        position = raw.position,
                        identifier = identifier.as_deref().unwrap_or("-"),
                        %reason,
                        "skipping invalid record"
                    );
                    summary.record_skip(SkippedRecord {
                        position: raw.position,
                        identifier,
                        reason,
                    });
                }
            }
        }
        summary.valid = valid.len();

        let known = match self.known_identifiers().await {
            Ok(known) => known,
            Err(err) => {
                warn!(error = %err, "could not read known identifiers, deduplicating within batch only");
                summary.store_lookup_error = Some(err.to_string());
                HashSet::new()
            }
        };
        let deduped = deduplicate(valid, &known, self.config.drop_known);
        summary.duplicates = deduped.duplicates;
        summary.known = deduped.known;
        summary.dropped_known = deduped.dropped_known;

        let criteria = self.engine.snapshot();
        let names = criteria.names();
        let verdicts = self.consult_oracle(&deduped.candidates, &names, cancel).await;
        let scored = verdicts.iter().filter(|v| v.is_some()).count();
        if scored < verdicts.len() {
            info!(scored, total = verdicts.len(), "batch cancelled before scoring finished");
            return Err(BatchError::Cancelled { scored });
        }

        let scoring = self.engine.scoring();
        let mut results = Vec::with_capacity(deduped.candidates.len());
        for ((position, candidate), verdict) in deduped.candidates.into_iter().zip(verdicts.into_iter().flatten()) {
            if verdict.is_failure() {
                summary.oracle_failures += 1;
            }
            let breakdown = score_candidate(&criteria, scoring, &candidate, &verdict);
            results.push(PriorityResult {
                priority: scoring.bucket(breakdown.score),
                score: breakdown.score,
                explanation: breakdown.explanation,
                candidate,
                position,
            });
        }
        results.sort_by(|a, b| b.score.cmp(&a.score).then(a.position.cmp(&b.position)));
        summary.ranked = results.len();

        info!(
            received = summary.received,
            ranked = summary.ranked,
            skipped = summary.skipped_count(),
            duplicates = summary.duplicates,
            oracle_failures = summary.oracle_failures,
            "batch ranked"
        );
        Ok(RankedBatch { results, summary })
    }

    /// Single terminal write of a ranked batch; one identifier's failure never hides the rest.
    pub async fn persist(&self, results: &[PriorityResult]) -> PersistReport {
        let mut report = PersistReport::default();
        let Some(store) = &self.store else {
            return report;
        };
        let items: Vec<JobAttributes> = results.iter().map(JobAttributes::from).collect();
        let identifiers: Vec<String> = results
            .iter()
            .map(|r| r.candidate.identifier.clone())
            .collect();
        let timeout = self.config.store_timeout;
        let outcomes = match tokio::time::timeout(timeout, store.upsert_batch(items)).await {
            Ok(outcomes) => outcomes,
            Err(_) => identifiers
                .into_iter()
                .map(|id| (id, Err(StoreError::Timeout(timeout))))
                .collect(),
        };
        for (identifier, outcome) in outcomes {
            match outcome {
                Ok(UpsertOutcome::Created) => report.created += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(reason) => {
                    error!(%identifier, error = %reason, "store write failed");
                    report.failures.push(StoreFailure { identifier, reason });
                }
            }
        }
        report
    }

    pub async fn run(
        &self,
        batch: &JsonValue,
        cancel: &CancellationToken,
    ) -> Result<BatchRun, BatchError> {
        let ranked = self.rank(batch, cancel).await?;
        let persisted = self.persist(&ranked.results).await;
        Ok(BatchRun { ranked, persisted })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub batch_path: PathBuf,
    pub source_url: Option<String>,
    pub records_key: String,
    pub criteria_path: PathBuf,
    pub scoring: ScoringConfig,
    pub prioritizer: PrioritizerConfig,
    pub store_path: PathBuf,
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            batch_path: PathBuf::from("fixtures/batches/sample.json"),
            source_url: None,
            records_key: DEFAULT_RECORDS_KEY.to_string(),
            criteria_path: PathBuf::from("rules/criteria.yaml"),
            scoring: ScoringConfig::default(),
            prioritizer: PrioritizerConfig::default(),
            store_path: PathBuf::from("data/jobs.json"),
            database_url: None,
            scheduler_enabled: false,
            sync_cron: "0 0 * * * *".to_string(),
            user_agent: format!("jobrank/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let scoring = ScoringConfig {
            budget_floor: env_or("JOBRANK_BUDGET_FLOOR", defaults.scoring.budget_floor),
            rating_floor: env_or("JOBRANK_RATING_FLOOR", defaults.scoring.rating_floor),
            ..defaults.scoring
        };
        let prioritizer = PrioritizerConfig {
            oracle_timeout: Duration::from_secs(env_or("JOBRANK_ORACLE_TIMEOUT_SECS", 10)),
            oracle_concurrency: env_or("JOBRANK_ORACLE_CONCURRENCY", 4),
            batch_limit: env_or("JOBRANK_BATCH_LIMIT", 50),
            store_timeout: Duration::from_secs(env_or("JOBRANK_STORE_TIMEOUT_SECS", 10)),
            drop_known: env_flag("JOBRANK_DROP_KNOWN", false),
            extract_client_info: env_flag("JOBRANK_EXTRACT_CLIENT_INFO", true),
        };
        Self {
            workspace_root: std::env::var("JOBRANK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            batch_path: std::env::var("JOBRANK_BATCH_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.batch_path),
            source_url: std::env::var("JOBRANK_SOURCE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            records_key: std::env::var("JOBRANK_RECORDS_KEY").unwrap_or(defaults.records_key),
            criteria_path: std::env::var("JOBRANK_CRITERIA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.criteria_path),
            scoring,
            prioritizer,
            store_path: std::env::var("JOBRANK_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            scheduler_enabled: env_flag("JOBRANK_SCHEDULER_ENABLED", false),
            sync_cron: std::env::var("JOBRANK_SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("JOBRANK_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    /// Relative paths are taken from the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn criteria_file(&self) -> PathBuf {
        self.resolve(&self.criteria_path)
    }
}

pub async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn JobStore>> {
    if let Some(url) = &config.database_url {
        let store = PgJobStore::connect(url).await?;
        store.ensure_schema().await?;
        return Ok(Arc::new(store));
    }
    let path = config.resolve(&config.store_path);
    Ok(Arc::new(JsonFileJobStore::open(path).await?))
}

pub fn oracle_from_env() -> Result<Option<Arc<dyn RelevanceOracle>>> {
    let Some(config) = ChatOracleConfig::from_env() else {
        info!("no oracle api key configured, ranking without relevance verdicts");
        return Ok(None);
    };
    let oracle: Arc<dyn RelevanceOracle> = Arc::new(ChatCompletionsOracle::new(config)?);
    Ok(Some(oracle))
}

pub fn fetcher_for(config: &PipelineConfig) -> Result<Arc<dyn SourceFetcher>> {
    if let Some(url) = &config.source_url {
        let http = HttpFetcher::new(HttpClientConfig {
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        return Ok(Arc::new(HttpBatchFetcher::new(Arc::new(http), url.clone())));
    }
    Ok(Arc::new(FileBatchFetcher::new(config.resolve(&config.batch_path))))
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batch: BatchSummary,
    pub persisted: PersistReport,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Fetch, rank, persist and report. Runs are serialized.
pub struct SyncPipeline {
    config: PipelineConfig,
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn JobStore>,
    prioritizer: Prioritizer,
    running: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: PipelineConfig,
        fetcher: Arc<dyn SourceFetcher>,
        store: Arc<dyn JobStore>,
        engine: Arc<CriteriaEngine>,
        oracle: Option<Arc<dyn RelevanceOracle>>,
    ) -> Self {
        let mut prioritizer = Prioritizer::new(engine, config.prioritizer.clone())
            .with_normalizer(RecordNormalizer::new(config.records_key.clone()))
            .with_store(Arc::clone(&store));
        if let Some(oracle) = oracle {
            prioritizer = prioritizer.with_oracle(oracle);
        }
        Self {
            config,
            fetcher,
            store,
            prioritizer,
            running: Mutex::new(()),
        }
    }

    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let criteria = load_criteria(&config.criteria_file()).await?;
        let engine = Arc::new(CriteriaEngine::new(criteria, config.scoring));
        let store = open_store(&config).await?;
        let fetcher = fetcher_for(&config)?;
        let oracle = oracle_from_env()?;
        Ok(Self::new(config, fetcher, store, engine, oracle))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<CriteriaEngine> {
        self.prioritizer.engine()
    }

    pub async fn save_criteria(&self) -> Result<()> {
        save_criteria(&self.config.criteria_file(), &self.engine().snapshot()).await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_once_with_cancel(&CancellationToken::new()).await
    }

    pub async fn run_once_with_cancel(&self, cancel: &CancellationToken) -> Result<SyncRunSummary> {
        let _running = self.running.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, source = self.fetcher.source_id(), "sync run started");

        let batch = self
            .fetcher
            .fetch_batch()
            .await
            .with_context(|| format!("fetching batch from {} source", self.fetcher.source_id()))?;
        let run = self
            .prioritizer
            .run(&batch, cancel)
            .await
            .with_context(|| format!("ranking batch for run {run_id}"))?;

        let finished_at = Utc::now();
        let reports_dir = self
            .write_reports(run_id, started_at, finished_at, &run)
            .await?;
        let manifest_path = export_parquet_snapshot(&reports_dir, &run.ranked.results).await?;

        info!(
            %run_id,
            ranked = run.ranked.summary.ranked,
            created = run.persisted.created,
            updated = run.persisted.updated,
            failed = run.persisted.failures.len(),
            "sync run finished"
        );
        Ok(SyncRunSummary {
            run_id,
            source_id: self.fetcher.source_id().to_string(),
            started_at,
            finished_at,
            batch: run.ranked.summary,
            persisted: run.persisted,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        run: &BatchRun,
    ) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let ranked_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": run_id,
            "started_at": started_at,
            "finished_at": finished_at,
            "summary": run.ranked.summary,
            "persisted": run.persisted,
            "results": run.ranked.results,
        }))
        .context("serializing ranked results")?;
        fs::write(reports_dir.join("ranked.json"), ranked_json)
            .await
            .context("writing ranked.json")?;

        fs::write(
            reports_dir.join("brief.md"),
            brief_markdown(run_id, started_at, finished_at, run),
        )
        .await
        .context("writing brief.md")?;

        Ok(reports_dir)
    }
}

pub fn brief_markdown(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    run: &BatchRun,
) -> String {
    let summary = &run.ranked.summary;
    let mut lines = vec![
        "# Job Ranking Brief".to_string(),
        String::new(),
        format!("- Run ID: `{run_id}`"),
        format!("- Started: {started_at}"),
        format!("- Finished: {finished_at}"),
        format!("- Records received: {}", summary.received),
        format!("- Ranked: {}", summary.ranked),
        format!("- Skipped: {}", summary.skipped_count()),
        format!("- Duplicates collapsed: {}", summary.duplicates),
        format!("- Already known: {}", summary.known),
        format!("- Oracle failures: {}", summary.oracle_failures),
        format!(
            "- Stored: {} created, {} updated, {} failed",
            run.persisted.created,
            run.persisted.updated,
            run.persisted.failures.len()
        ),
        String::new(),
        "## Top Jobs".to_string(),
    ];
    if run.ranked.results.is_empty() {
        lines.push("_none_".to_string());
    }
    for (rank, result) in run.ranked.results.iter().take(10).enumerate() {
        lines.push(format!(
            "{}. **{}** ({}, score {}, {}) `{}`",
            rank + 1,
            result.candidate.title,
            result.candidate.job_type,
            result.score,
            result.priority,
            result.candidate.identifier
        ));
    }
    if !summary.skipped_by_reason.is_empty() {
        lines.push(String::new());
        lines.push("## Skipped Records".to_string());
        for (reason, count) in &summary.skipped_by_reason {
            lines.push(format!("- {reason}: {count}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_ranked_parquet(path: &Path, results: &[PriorityResult]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("identifier", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("job_type", DataType::Utf8, false),
        ArrowField::new("score", DataType::UInt32, false),
        ArrowField::new("priority", DataType::Utf8, false),
        ArrowField::new("client_rating", DataType::Float64, true),
        ArrowField::new("client_spend", DataType::Float64, true),
        ArrowField::new("explanation", DataType::Utf8, false),
    ]));

    let ranks = UInt32Array::from(
        (1..=results.len())
            .map(|r| u32::try_from(r).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let identifiers = StringArray::from(
        results
            .iter()
            .map(|r| r.candidate.identifier.as_str())
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        results
            .iter()
            .map(|r| r.candidate.title.as_str())
            .collect::<Vec<_>>(),
    );
    let job_types = StringArray::from(
        results
            .iter()
            .map(|r| r.candidate.job_type.as_str())
            .collect::<Vec<_>>(),
    );
    let scores = UInt32Array::from(results.iter().map(|r| r.score).collect::<Vec<_>>());
    let priorities = StringArray::from(
        results
            .iter()
            .map(|r| r.priority.as_str())
            .collect::<Vec<_>>(),
    );
    let ratings = Float64Array::from(
        results
            .iter()
            .map(|r| r.candidate.client_rating)
            .collect::<Vec<_>>(),
    );
    let spends = Float64Array::from(
        results
            .iter()
            .map(|r| r.candidate.client_spend)
            .collect::<Vec<_>>(),
    );
    let explanations = StringArray::from(
        results
            .iter()
            .map(|r| r.explanation.as_str())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ranks),
            Arc::new(identifiers),
            Arc::new(titles),
            Arc::new(job_types),
            Arc::new(scores),
            Arc::new(priorities),
            Arc::new(ratings),
            Arc::new(spends),
            Arc::new(explanations),
        ],
    )
    .context("building ranked record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

pub async fn export_parquet_snapshot(reports_dir: &Path, results: &[PriorityResult]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let ranked_path = snapshot_dir.join("ranked.parquet");
    write_ranked_parquet(&ranked_path, results)?;
    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("ranked", reports_dir, &ranked_path)?],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Cron-driven runs; `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }
    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, ranked = summary.batch.ranked, "scheduled sync finished"),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "scheduled sync failed");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(PipelineConfig::from_env()).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrank_core::{Classification, JobType, OracleError};

    fn candidate(id: &str, title: &str, description: &str) -> JobCandidate {
        JobCandidate {
            identifier: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            job_type: JobType::Fixed,
            experience_level: "Intermediate".into(),
            duration: "1 to 3 months".into(),
            rate: Some("$500".into()),
            client_info: None,
            posted_at: "2024-05-01".into(),
            skills: vec![],
            category: None,
            country: None,
            payment_verified: None,
            proposal_count: None,
            client_rating: None,
            client_spend: None,
        }
    }

    #[test]
    fn later_duplicate_updates_attributes_but_keeps_first_position() {
        let a1 = candidate("1", "v1", "d");
        let b = candidate("2", "B", "d");
        let a2 = candidate("1", "v2", "d");
        let out = deduplicate(vec![(0, a1), (1, b), (2, a2)], &HashSet::new(), false);
        let titles: Vec<_> = out.candidates.iter().map(|(p, c)| (*p, c.title.as_str())).collect();
        assert_eq!(titles, vec![(0, "v2"), (1, "B")]);
        assert_eq!(out.duplicates, 1);
    }

    #[test]
    fn known_identifiers_are_counted_and_optionally_dropped() {
        let known: HashSet<String> = ["2".to_string()].into();
        let items = || vec![(0, candidate("1", "A", "d")), (1, candidate("2", "B", "d"))];
        let kept = deduplicate(items(), &known, false);
        assert_eq!((kept.candidates.len(), kept.known, kept.dropped_known), (2, 1, 0));
        let dropped = deduplicate(items(), &known, true);
        assert_eq!((dropped.candidates.len(), dropped.known, dropped.dropped_known), (1, 1, 1));
    }

    #[test]
    fn repeated_known_identifier_is_dropped_once_then_counted_as_duplicate() {
        let known: HashSet<String> = ["2".to_string()].into();
        let items = vec![
            (0, candidate("2", "B", "d")),
            (1, candidate("1", "A", "d")),
            (2, candidate("2", "B v2", "d")),
        ];
        let out = deduplicate(items, &known, true);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!((out.known, out.dropped_known, out.duplicates), (1, 1, 1));

        let kept = deduplicate(
            vec![(0, candidate("2", "B", "d")), (1, candidate("2", "B v2", "d"))],
            &known,
            false,
        );
        assert_eq!((kept.known, kept.dropped_known, kept.duplicates), (1, 0, 1));
        assert_eq!(kept.candidates[0].1.title, "B v2");
    }

    #[test]
    fn criteria_names_are_unique_ignoring_case() {
        let mut set = CriteriaSet::defaults();
        set.upsert("  AirTable ", Tier::Low).unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.get("airtable"), Some(Tier::Low));
        assert_eq!(set.names()[0], "airtable");
        assert_eq!(set.upsert("   ", Tier::High), Err(CriteriaError::EmptyName));
        assert!(set.remove("ZAPIER").is_some());
        assert_eq!(set.get("zapier"), None);
    }

    #[test]
    fn set_criterion_rejects_unknown_tiers() {
        let engine = CriteriaEngine::new(CriteriaSet::new(), ScoringConfig::default());
        assert_eq!(engine.set_criterion("crm", "medium"), Ok(Tier::Medium));
        assert!(matches!(
            engine.set_criterion("crm", "urgent"),
            Err(CriteriaError::InvalidTier(_))
        ));
        assert_eq!(engine.snapshot().get("crm"), Some(Tier::Medium));
    }

    #[test]
    fn snapshots_do_not_see_later_updates() {
        let engine = CriteriaEngine::new(CriteriaSet::defaults(), ScoringConfig::default());
        let before = engine.snapshot();
        engine.upsert("airtable", Tier::Low).unwrap();
        assert_eq!(before.get("airtable"), Some(Tier::High));
        assert_eq!(engine.snapshot().get("airtable"), Some(Tier::Low));
    }

    #[test]
    fn keyword_client_and_oracle_terms_add_up() {
        let mut job = candidate("1", "Airtable CRM", "Zapier automation for a small team");
        job.client_spend = Some(5000.0);
        job.client_rating = Some(4.8);
        let verdict = VerdictOutcome::Classified(Classification {
            verdict: Tier::Medium,
            explanation: "fits".into(),
        });
        let out = score_candidate(&CriteriaSet::defaults(), &ScoringConfig::default(), &job, &verdict);
        assert_eq!(out.keyword_points, 3 + 3 + 1);
        assert_eq!(out.client_points, 2);
        assert_eq!(out.oracle_points, 2);
        assert_eq!(out.score, 11);
        assert_eq!(out.matched, vec!["airtable", "zapier", "automation"]);
        assert!(out.explanation.contains("airtable (High +3)"));
        assert!(out.explanation.contains("oracle: Medium (+2) fits"));
    }

    #[test]
    fn scoring_is_pure_and_never_negative() {
        let mut job = candidate("1", "Logo design", "Need a logo");
        job.client_spend = Some(10.0);
        job.client_rating = Some(2.5);
        let criteria = CriteriaSet::defaults();
        let config = ScoringConfig::default();
        let first = score_candidate(&criteria, &config, &job, &VerdictOutcome::Absent);
        let second = score_candidate(&criteria, &config, &job, &VerdictOutcome::Absent);
        assert_eq!(first, second);
        assert_eq!(first.client_points, -2);
        assert_eq!(first.score, 0);
    }

    #[test]
    fn oracle_failure_only_drops_its_own_term() {
        let job = candidate("1", "Calendly setup", "Embed calendly");
        let criteria = CriteriaSet::defaults();
        let config = ScoringConfig::default();
        let absent = score_candidate(&criteria, &config, &job, &VerdictOutcome::Absent);
        let failed = score_candidate(
            &criteria,
            &config,
            &job,
            &VerdictOutcome::Failed(OracleError::Timeout(Duration::from_secs(10))),
        );
        assert_eq!(absent.score, failed.score);
        assert_eq!(failed.score, 2);
        assert!(failed.explanation.contains("oracle: unavailable (+0) oracle timed out"));
    }

    #[test]
    fn inactive_criteria_are_kept_but_not_scored() {
        let job = candidate("1", "Airtable CRM", "Zapier hooks");
        let mut criteria = CriteriaSet::defaults();
        assert!(criteria.set_active("AIRTABLE", false).is_some());
        assert!(criteria.set_active("webflow", false).is_none());

        let out = score_candidate(&criteria, &ScoringConfig::default(), &job, &VerdictOutcome::Absent);
        assert_eq!(out.matched, vec!["zapier"]);
        assert_eq!(out.keyword_points, 3);
        assert_eq!(criteria.len(), 5);
        assert!(!criteria.names().contains(&"airtable".to_string()));

        criteria.upsert("airtable", Tier::Medium).unwrap();
        assert_eq!(criteria.find("airtable").map(|c| c.active), Some(false));
    }

    #[test]
    fn buckets_follow_thresholds() {
        let config = ScoringConfig::default();
        assert_eq!(config.bucket(6), Tier::High);
        assert_eq!(config.bucket(3), Tier::Medium);
        assert_eq!(config.bucket(2), Tier::Low);
    }

    #[tokio::test]
    async fn criteria_file_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules").join("criteria.yaml");
        assert_eq!(load_criteria(&path).await.unwrap(), CriteriaSet::defaults());

        let mut set = CriteriaSet::new();
        set.upsert("Webflow", Tier::High).unwrap();
        set.upsert("crud", Tier::Low).unwrap();
        set.set_active("crud", false);
        save_criteria(&path, &set).await.unwrap();
        let loaded = load_criteria(&path).await.unwrap();
        assert_eq!(loaded, set);
        assert_eq!(loaded.find("crud").map(|c| c.active), Some(false));

        let legacy = parse_criteria_yaml("version: 1\ncriteria:\n  - name: zapier\n    tier: High\n").unwrap();
        assert_eq!(legacy.find("zapier").map(|c| c.active), Some(true));

        assert!(parse_criteria_yaml("version: 1\ncriteria:\n  - name: x\n    tier: huge\n").is_err());
    }
}

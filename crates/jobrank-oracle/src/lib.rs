//! Relevance oracle: classifies a job posting against the active criteria.
//!
//! The oracle is remote and unreliable. Callers go through
//! [`classify_with_deadline`], which folds timeouts and failures into a
//! [`VerdictOutcome`] instead of an error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobrank_core::{Classification, OracleError, Tier, VerdictOutcome};
use jobrank_storage::{HttpClientConfig, HttpFetcher, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jobrank-oracle";

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama3-70b-8192";

/// Request budget per minute sent to the inference API; matches Groq's free tier.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 30;

#[async_trait]
pub trait RelevanceOracle: Send + Sync {
    async fn classify(
        &self,
        title: &str,
        description: &str,
        criteria: &[String],
    ) -> Result<Classification, OracleError>;
}

/// Runs one oracle call under `deadline`. Never fails; degraded outcomes carry the reason.
pub async fn classify_with_deadline(
    oracle: &dyn RelevanceOracle,
    title: &str,
    description: &str,
    criteria: &[String],
    deadline: Duration,
) -> VerdictOutcome {
    match tokio::time::timeout(deadline, oracle.classify(title, description, criteria)).await {
        Ok(Ok(classification)) => VerdictOutcome::Classified(classification),
        Ok(Err(err)) => {
            warn!(title, error = %err, "relevance oracle failed");
            VerdictOutcome::Failed(err)
        }
        Err(_) => {
            warn!(title, ?deadline, "relevance oracle timed out");
            VerdictOutcome::Failed(OracleError::Timeout(deadline))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOracleConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
    /// Zero disables client-side rate limiting.
    pub requests_per_minute: u32,
}

impl ChatOracleConfig {
    /// `None` when no API key is configured; the pipeline then ranks without an oracle.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("JOBRANK_ORACLE_API_KEY")
            .or_else(|_| std::env::var("GROQ_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty())?;
        Some(Self {
            api_key,
            base_url: std::env::var("JOBRANK_ORACLE_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: std::env::var("JOBRANK_ORACLE_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            request_timeout: Duration::from_secs(
                std::env::var("JOBRANK_ORACLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            requests_per_minute: std::env::var("JOBRANK_ORACLE_RPM")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_REQUESTS_PER_MINUTE),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.request_timeout,
            user_agent: Some(format!("jobrank/{}", env!("CARGO_PKG_VERSION"))),
            token_bucket: TokenBucketConfig::per_minute(self.requests_per_minute),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    verdict: String,
    #[serde(default)]
    explanation: String,
}

const SYSTEM_PROMPT: &str = "You rate freelance job postings for relevance to a freelancer's focus areas. \
Answer with a JSON object {\"verdict\": \"High\" | \"Medium\" | \"Low\", \"explanation\": \"<one sentence>\"} and nothing else.";

/// OpenAI-compatible chat-completions oracle (Groq by default).
#[derive(Debug, Clone)]
pub struct ChatCompletionsOracle {
    http: Arc<HttpFetcher>,
    config: ChatOracleConfig,
}

impl ChatCompletionsOracle {
    pub fn new(config: ChatOracleConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building oracle http client")?;
        Ok(Self::with_fetcher(Arc::new(http), config))
    }

    pub fn with_fetcher(http: Arc<HttpFetcher>, config: ChatOracleConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

fn user_prompt(title: &str, description: &str, criteria: &[String]) -> String {
    let focus = if criteria.is_empty() {
        "(none configured)".to_string()
    } else {
        criteria.join(", ")
    };
    format!("Focus areas: {focus}\n\nTitle: {title}\n\nDescription:\n{description}")
}

/// Reads a verdict out of model output, tolerating code fences and surrounding prose.
pub fn parse_verdict(content: &str) -> Result<Classification, OracleError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => {
            return Err(OracleError::Failure(format!(
                "no JSON object in oracle reply: {}",
                truncate(content, 120)
            )))
        }
    };
    let payload: VerdictPayload = serde_json::from_str(json)
        .map_err(|e| OracleError::Failure(format!("unreadable oracle reply: {e}")))?;
    let verdict = payload
        .verdict
        .parse::<Tier>()
        .map_err(|e| OracleError::Failure(e.to_string()))?;
    Ok(Classification {
        verdict,
        explanation: payload.explanation.trim().to_string(),
    })
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl RelevanceOracle for ChatCompletionsOracle {
    async fn classify(
        &self,
        title: &str,
        description: &str,
        criteria: &[String],
    ) -> Result<Classification, OracleError> {
        let prompt = user_prompt(title, description, criteria);
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        let response = self
            .http
            .post_json(&self.endpoint(), Some(&self.config.api_key), &request)
            .await
            .map_err(|e| OracleError::Failure(e.to_string()))?;
        let parsed: ChatResponse = serde_json::from_slice(&response.body)
            .map_err(|e| OracleError::Failure(format!("unexpected completions payload: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OracleError::Failure("empty completion".into()))?;
        debug!(
            model = %self.config.model,
            status = %response.status,
            url = %response.final_url,
            "oracle replied"
        );
        parse_verdict(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<Classification, OracleError>);

    #[async_trait]
    impl RelevanceOracle for Fixed {
        async fn classify(&self, _: &str, _: &str, _: &[String]) -> Result<Classification, OracleError> {
            self.0.clone()
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl RelevanceOracle for Sleepy {
        async fn classify(&self, _: &str, _: &str, _: &[String]) -> Result<Classification, OracleError> {
            tokio::time::sleep(self.0).await;
            Ok(Classification {
                verdict: Tier::High,
                explanation: "late".into(),
            })
        }
    }

    #[tokio::test]
    async fn deadline_turns_slow_calls_into_timeouts() {
        let outcome = classify_with_deadline(
            &Sleepy(Duration::from_millis(500)),
            "t",
            "d",
            &[],
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(
            outcome,
            VerdictOutcome::Failed(OracleError::Timeout(Duration::from_millis(20)))
        );
        assert_eq!(outcome.bonus(), 0);
    }

    #[tokio::test]
    async fn failures_are_folded_into_the_outcome() {
        let oracle = Fixed(Err(OracleError::Failure("503".into())));
        let outcome = classify_with_deadline(&oracle, "t", "d", &[], Duration::from_secs(1)).await;
        assert!(outcome.is_failure());

        let oracle = Fixed(Ok(Classification {
            verdict: Tier::Medium,
            explanation: "close".into(),
        }));
        let outcome = classify_with_deadline(&oracle, "t", "d", &[], Duration::from_secs(1)).await;
        assert_eq!(outcome.bonus(), 2);
    }

    #[test]
    fn verdict_parsing_accepts_fenced_json() {
        let parsed = parse_verdict("```json\n{\"verdict\": \"high\", \"explanation\": \" Airtable build \"}\n```")
            .unwrap();
        assert_eq!(parsed.verdict, Tier::High);
        assert_eq!(parsed.explanation, "Airtable build");
    }

    #[test]
    fn verdict_parsing_rejects_unknown_tiers_and_prose() {
        assert!(matches!(
            parse_verdict("{\"verdict\": \"critical\"}"),
            Err(OracleError::Failure(_))
        ));
        assert!(matches!(parse_verdict("sounds good"), Err(OracleError::Failure(_))));
    }

    #[test]
    fn request_budget_becomes_a_token_bucket() {
        let mut config = ChatOracleConfig {
            api_key: "k".into(),
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            request_timeout: Duration::from_secs(5),
            requests_per_minute: 30,
        };
        let http = config.http_client_config();
        let bucket = http.token_bucket.expect("rate limited");
        assert_eq!(bucket.capacity, 30);
        assert_eq!(bucket.refill_every, Duration::from_secs(2));
        assert_eq!(http.timeout, Duration::from_secs(5));

        config.requests_per_minute = 0;
        assert!(config.http_client_config().token_bucket.is_none());
    }

    #[test]
    fn prompt_lists_focus_areas() {
        let prompt = user_prompt("CRM", "Build it", &["airtable".into(), "zapier".into()]);
        assert!(prompt.starts_with("Focus areas: airtable, zapier"));
        assert!(user_prompt("a", "b", &[]).contains("(none configured)"));
    }
}

//! AI judgment escalation (pipeline stage 3).

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::types::Verdict;
use crate::error::JudgmentError;
use crate::matcher::{Category, RiskLevel};

const SYSTEM_PROMPT: &str = "You review actions requested by an autonomous coding agent \
working inside a project workspace. Decide whether the action is safe to approve. \
Reply with a single JSON object: {\"verdict\": \"approve\" | \"deny\", \"reasoning\": \"<one sentence>\"}.";

/// What the judge sees for one confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct JudgmentRequest {
    pub worker_id: String,
    pub category: Category,
    pub risk_level: RiskLevel,
    pub message: String,
    pub target: Option<String>,
}

impl JudgmentRequest {
    pub fn prompt(&self) -> String {
        format!(
            "Category: {}\nRisk: {}\nTarget: {}\nPrompt shown by the agent:\n{}",
            self.category,
            self.risk_level,
            self.target.as_deref().unwrap_or("(none)"),
            self.message
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgment {
    pub verdict: Verdict,
    pub reasoning: String,
}

pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    fn judge<'a>(
        &'a self,
        request: &'a JudgmentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Judgment, JudgmentError>> + Send + 'a>>;
}

/// Installed when judgment is disabled; every call is unavailable.
pub struct UnavailableJudge;

impl Judge for UnavailableJudge {
    fn name(&self) -> &str {
        "disabled"
    }

    fn judge<'a>(
        &'a self,
        _request: &'a JudgmentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Judgment, JudgmentError>> + Send + 'a>> {
        Box::pin(async { Err(JudgmentError::Disabled) })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Judge backed by an OpenAI-compatible chat-completions endpoint.
pub struct HttpJudge {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f64,
}

impl HttpJudge {
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>, temperature: f64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            temperature,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    async fn call(&self, request: &JudgmentRequest) -> Result<Judgment, JudgmentError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: request.prompt(),
                },
            ],
            temperature: self.temperature,
        };

        let mut builder = self.client.post(self.url()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| JudgmentError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JudgmentError::Transport(format!("HTTP {status}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| JudgmentError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| JudgmentError::Malformed("response has no choices".into()))?;
        parse_judgment(&content)
    }
}

impl Judge for HttpJudge {
    fn name(&self) -> &str {
        &self.model
    }

    fn judge<'a>(
        &'a self,
        request: &'a JudgmentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Judgment, JudgmentError>> + Send + 'a>> {
        Box::pin(self.call(request))
    }
}

#[derive(Debug, Deserialize)]
struct RawJudgment {
    verdict: String,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Extract `{"verdict", "reasoning"}` from model text.
///
/// Tolerates code fences and prose around the object; the outermost
/// `{...}` span is parsed.
pub fn parse_judgment(text: &str) -> Result<Judgment, JudgmentError> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(JudgmentError::Malformed(format!(
            "no JSON object in `{}`",
            truncate(text, 80)
        )));
    };
    if end < start {
        return Err(JudgmentError::Malformed("unbalanced braces".into()));
    }

    let raw: RawJudgment = serde_json::from_str(&text[start..=end])
        .map_err(|e| JudgmentError::Malformed(e.to_string()))?;

    let verdict = match raw.verdict.trim().to_ascii_lowercase().as_str() {
        "approve" | "approved" | "allow" | "yes" => Verdict::Approve,
        "deny" | "denied" | "reject" | "no" => Verdict::Deny,
        other => {
            return Err(JudgmentError::Malformed(format!("unknown verdict `{other}`")));
        }
    };
    let reasoning = raw
        .reasoning
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "no reasoning given".to_string());

    Ok(Judgment { verdict, reasoning })
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> JudgmentRequest {
        JudgmentRequest {
            worker_id: "w1".into(),
            category: Category::BashExec,
            risk_level: RiskLevel::Medium,
            message: "Run command `cargo test`? (y/n)".into(),
            target: Some("cargo test".into()),
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    #[test]
    fn parses_plain_json() {
        let j = parse_judgment(r#"{"verdict":"approve","reasoning":"safe read-only command"}"#).unwrap();
        assert_eq!(j.verdict, Verdict::Approve);
        assert_eq!(j.reasoning, "safe read-only command");
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let text = "Sure.\n```json\n{\"verdict\": \"DENY\", \"reasoning\": \"touches secrets\"}\n```\nDone.";
        let j = parse_judgment(text).unwrap();
        assert_eq!(j.verdict, Verdict::Deny);
        assert_eq!(j.reasoning, "touches secrets");
    }

    #[test]
    fn missing_reasoning_gets_placeholder() {
        let j = parse_judgment(r#"{"verdict":"deny"}"#).unwrap();
        assert_eq!(j.reasoning, "no reasoning given");
    }

    #[test]
    fn rejects_malformed_text() {
        for bad in ["approve", "{not json}", r#"{"verdict":"maybe"}"#, "} {"] {
            assert!(
                matches!(parse_judgment(bad), Err(JudgmentError::Malformed(_))),
                "expected malformed for {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn unavailable_judge_is_disabled() {
        let err = UnavailableJudge.judge(&request()).await.unwrap_err();
        assert!(matches!(err, JudgmentError::Disabled));
    }

    #[tokio::test]
    async fn http_judge_posts_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"verdict":"approve","reasoning":"safe read-only command"}"#,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let judge = HttpJudge::new(
            &format!("{}/v1/", server.uri()),
            "judge-model",
            Some("sk-test".into()),
            0.0,
        );
        let j = judge.judge(&request()).await.unwrap();
        assert_eq!(j.verdict, Verdict::Approve);
        assert_eq!(judge.name(), "judge-model");
    }

    #[tokio::test]
    async fn http_error_status_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let judge = HttpJudge::new(&server.uri(), "m", None, 0.0);
        let err = judge.judge(&request()).await.unwrap_err();
        assert!(matches!(err, JudgmentError::Transport(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn empty_choices_are_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let judge = HttpJudge::new(&server.uri(), "m", None, 0.0);
        assert!(matches!(
            judge.judge(&request()).await,
            Err(JudgmentError::Malformed(_))
        ));
    }
}

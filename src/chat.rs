use std::{sync::LazyLock, time::Duration};

use anyhow::Context;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{conf::ConfLlm, data::Storage, types::ChatReply};

static SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>")
        .unwrap_or_else(|e| unreachable!("Fat-fingered script regex: {e}"))
});

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Message is required")]
    EmptyMessage,

    #[error("User not found")]
    UserNotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct LlmReq<'a> {
    message: &'a str,
}

#[derive(Deserialize)]
struct LlmResp {
    response: String,
}

/// Client of the external LLM service. Never fails: anything that goes
/// wrong on the way yields the configured fallback reply.
#[derive(Clone)]
pub struct Llm {
    client: Client,
    url: String,
    fallback_reply: String,
}

impl Llm {
    pub fn new(conf: &ConfLlm) -> anyhow::Result<Self> {
        let timeout = Duration::try_from_secs_f32(conf.timeout)
            .context(format!("Invalid LLM timeout: {}", conf.timeout))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build LLM HTTP client")?;
        let url = format!("{}/api/chat", conf.base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            url,
            fallback_reply: conf.fallback_reply.clone(),
        })
    }

    pub async fn reply(&self, message: &str) -> String {
        match self.ask(message).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::error!(
                    ?error,
                    url = %self.url,
                    "LLM service call failed. Serving fallback reply."
                );
                self.fallback_reply.clone()
            }
        }
    }

    async fn ask(&self, message: &str) -> anyhow::Result<String> {
        tracing::debug!(url = %self.url, "Forwarding message to LLM service.");
        let LlmResp { response } = self
            .client
            .post(&self.url)
            .json(&LlmReq { message })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

/// Strips script blocks, trims, and caps the length at `max_chars`.
#[must_use]
pub fn sanitize_message(message: &str, max_chars: usize) -> String {
    let stripped = SCRIPT.replace_all(message, "");
    stripped.trim().chars().take(max_chars).collect()
}

pub struct Limits {
    pub free_calls: u64,
    pub max_message_chars: usize,
}

/// Relay one message and record the exchange.
///
/// The free-call limit is soft: the reply is served either way and only the
/// flags in the outcome reflect it. The call counter itself is advanced by
/// the usage tracking around the route, so the outcome counts this call on
/// top of the stored value.
#[tracing::instrument(skip_all, fields(uid = uid))]
pub async fn send(
    storage: &Storage,
    llm: &Llm,
    limits: &Limits,
    uid: i64,
    message: &str,
) -> Result<ChatReply, Error> {
    let message = sanitize_message(message, limits.max_message_chars);
    if message.is_empty() {
        return Err(Error::EmptyMessage);
    }
    let user = storage.user_by_id(uid).await?.ok_or(Error::UserNotFound)?;
    let reply = llm.reply(&message).await;
    storage.history_append(uid, &message, &reply).await?;

    let used = u64::try_from(user.api_calls_used)
        .context("Negative API call counter")?
        .saturating_add(1);
    let has_exceeded_limit = used >= limits.free_calls;
    if has_exceeded_limit {
        tracing::info!(used, limit = limits.free_calls, "Past free calls.");
    }
    Ok(ChatReply {
        success: true,
        response: reply,
        has_exceeded_limit,
        api_calls_remaining: limits.free_calls.saturating_sub(used),
        api_calls_used: used,
        warning: has_exceeded_limit.then(|| limit_warning(limits.free_calls)),
    })
}

fn limit_warning(free_calls: u64) -> String {
    format!(
        "You have exceeded your free API calls ({free_calls} calls). \
        The service will continue to work, but please note this limitation."
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const FALLBACK: &str = "fallback!";

    fn llm(base_url: &str, timeout: f32) -> Llm {
        Llm::new(&ConfLlm {
            base_url: base_url.to_string(),
            timeout,
            fallback_reply: FALLBACK.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn sanitize_strips_scripts() {
        assert_eq!(
            sanitize_message("hi <script>alert(1)</script> there", 1000),
            "hi  there"
        );
        assert_eq!(
            sanitize_message("<SCRIPT type=\"x\">\nbad()\n</Script >ok", 1000),
            "ok"
        );
        assert_eq!(sanitize_message("  padded  ", 1000), "padded");
        assert_eq!(sanitize_message("<script>only</script>", 1000), "");
    }

    #[test]
    fn sanitize_keeps_other_markup() {
        assert_eq!(sanitize_message("<b>bold</b>", 1000), "<b>bold</b>");
    }

    #[test]
    fn sanitize_truncates_by_chars() {
        let long = "é".repeat(1500);
        let out = sanitize_message(&long, 1000);
        assert_eq!(out.chars().count(), 1000);
        assert_eq!(sanitize_message("abcdef", 3), "abc");
    }

    #[tokio::test]
    async fn reply_from_service() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_json(serde_json::json!({"message": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"success": true, "response": "hi there"}),
            ))
            .expect(1)
            .mount(&server)
            .await;
        let llm = llm(&format!("{}/", server.uri()), 5.0);
        assert_eq!(llm.reply("hello").await, "hi there");
    }

    #[tokio::test]
    async fn fallback_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        assert_eq!(llm(&server.uri(), 5.0).reply("hello").await, FALLBACK);
    }

    #[tokio::test]
    async fn fallback_on_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"unexpected": 1})),
            )
            .mount(&server)
            .await;
        assert_eq!(llm(&server.uri(), 5.0).reply("hello").await, FALLBACK);
    }

    #[tokio::test]
    async fn fallback_on_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"response": "late"}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        assert_eq!(llm(&server.uri(), 0.2).reply("hello").await, FALLBACK);
    }

    #[tokio::test]
    async fn fallback_when_unreachable() {
        // Nothing listens on port 9 (discard) in test environments.
        assert_eq!(llm("http://127.0.0.1:9", 1.0).reply("hello").await, FALLBACK);
    }

    #[tokio::test]
    async fn send_records_and_flags_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"response": "pong"})),
            )
            .mount(&server)
            .await;
        let llm = llm(&server.uri(), 5.0);
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::connect(
            &dir.path().join("test.db"),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let user = storage.user_create("a@b.co", "h", false).await.unwrap();
        let limits = Limits {
            free_calls: 2,
            max_message_chars: 1000,
        };

        let first = send(&storage, &llm, &limits, user.id, " ping ")
            .await
            .unwrap();
        assert_eq!(first.response, "pong");
        assert_eq!(first.api_calls_used, 1);
        assert_eq!(first.api_calls_remaining, 1);
        assert!(!first.has_exceeded_limit);
        assert!(first.warning.is_none());

        // Stand in for the route's usage tracking.
        storage.record_usage(user.id, "POST", "/api/v1/chat/send").await.unwrap();

        let second = send(&storage, &llm, &limits, user.id, "ping")
            .await
            .unwrap();
        assert_eq!(second.api_calls_used, 2);
        assert_eq!(second.api_calls_remaining, 0);
        assert!(second.has_exceeded_limit);
        assert!(second.warning.is_some());

        let history = storage.history(user.id, 50).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user_message, "ping");
        assert_eq!(history[0].bot_response, "pong");
    }

    #[tokio::test]
    async fn send_rejects_empty_and_unknown() {
        let llm = llm("http://127.0.0.1:9", 1.0);
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::connect(
            &dir.path().join("test.db"),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let limits = Limits {
            free_calls: 20,
            max_message_chars: 1000,
        };
        assert!(matches!(
            send(&storage, &llm, &limits, 1, "<script>x</script>  ").await,
            Err(Error::EmptyMessage)
        ));
        assert!(matches!(
            send(&storage, &llm, &limits, 12345, "hello").await,
            Err(Error::UserNotFound)
        ));
    }
}

use anyhow::{Result, anyhow};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::llm::LlmErrorKind;
use crate::llm::client_core::OpenAIClient;
use crate::llm::types::{ChatRequestWithTools, ChatResponseWithTools, ChoiceMessageWithTools, Usage};

/// One model response, reduced to what the loop consumes.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    pub message: ChoiceMessageWithTools,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct HttpFailure {
    message: String,
    retry_after: Option<u64>,
}

/// Send one chat-completions request, retrying transient failures with
/// exponential backoff. Timeouts get a single extra attempt; cancellation,
/// policy rejections, and oversized contexts are returned immediately.
pub async fn chat_tools_once(
    client: &OpenAIClient,
    req: &ChatRequestWithTools,
    cancel: Option<CancellationToken>,
) -> Result<ModelTurn> {
    const MAX_TIMEOUT_RETRIES: u64 = 1;
    let max_retries = client.llm_cfg.max_retries.max(1);
    let mut last_error = anyhow!("failed after {max_retries} attempts");
    let mut timeout_retries = 0u64;

    for attempt in 1..=max_retries {
        match chat_tools_once_inner(client, req, cancel.clone()).await {
            Ok(turn) => return Ok(turn),
            Err(e) => {
                let kind = crate::llm::classify_error(None, &e);
                let retry_after = e
                    .downcast_ref::<HttpFailure>()
                    .and_then(|f| f.retry_after);
                last_error = e;

                if !kind.is_retryable() {
                    return Err(last_error);
                }
                if kind == LlmErrorKind::Timeout {
                    timeout_retries += 1;
                    if timeout_retries > MAX_TIMEOUT_RETRIES {
                        error!("giving up after repeated timeouts: {:?}", &last_error);
                        break;
                    }
                }
                if attempt >= max_retries {
                    error!("giving up after {attempt} attempts: {:?}", &last_error);
                    break;
                }

                let delay = client.backoff_delay(attempt, retry_after);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    ?kind,
                    "retrying chat_tools_once after error"
                );
                sleep(delay).await;
            }
        }
    }

    Err(last_error)
}

async fn chat_tools_once_inner(
    client: &OpenAIClient,
    req: &ChatRequestWithTools,
    cancel: Option<CancellationToken>,
) -> Result<ModelTurn> {
    use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, RETRY_AFTER};

    let url = client.endpoint();
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, "application/json".parse()?);
    headers.insert(AUTHORIZATION, format!("Bearer {}", client.api_key).parse()?);

    let cancel_token = cancel.unwrap_or_default();
    let req_builder = client.inner.post(&url).headers(headers).json(req);

    let timeout_duration = Duration::from_millis(client.llm_cfg.timeout_ms);
    let resp_fut = tokio::time::timeout(timeout_duration, req_builder.send());

    let resp = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => {
            warn!("chat_tools_once cancelled before send");
            return Err(anyhow!(LlmErrorKind::Cancelled));
        }
        res = resp_fut => {
            match res {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => return Err(anyhow::Error::new(e).context("send chat request (tools)")),
                Err(_) => return Err(anyhow!(LlmErrorKind::Timeout)),
            }
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = resp.text().await.unwrap_or_default().trim().to_owned();
        error!(status=%status.as_u16(), body=%text, "llm chat_tools_once non-success status");

        if status.as_u16() == 400
            && let Ok(json) = serde_json::from_str::<serde_json::Value>(&text)
            && let Some(code) = json
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(|c| c.as_str())
        {
            if code == "context_length_exceeded" {
                return Err(anyhow!(LlmErrorKind::ContextLengthExceeded));
            }
            if code == "content_policy_violation" || code == "content_filter" {
                return Err(anyhow!(LlmErrorKind::ContentPolicy));
            }
        }

        let kind = crate::llm::classify_error(Some(status), &anyhow!("http status"));
        return Err(anyhow::Error::new(HttpFailure {
            message: format!("chat (tools) error: {status} - {text}"),
            retry_after,
        })
        .context(kind));
    }

    let response_text_fut = tokio::time::timeout(timeout_duration, resp.text());
    let response_text: String = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => {
            warn!("chat_tools_once cancelled during body read");
            return Err(anyhow!(LlmErrorKind::Cancelled));
        }
        res = response_text_fut => {
            match res {
                Ok(Ok(text)) => text.trim().to_owned(),
                Ok(Err(e)) => return Err(anyhow::Error::new(e).context("read chat response body (tools)")),
                Err(_) => return Err(anyhow!(LlmErrorKind::Timeout)),
            }
        }
    };

    debug!(target: "llm", response_body=%response_text, "llm chat_tools_once response");
    let body: ChatResponseWithTools = serde_json::from_str(&response_text)?;
    let usage = body.usage;
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no choices"))?;

    Ok(ModelTurn {
        message: choice.message,
        finish_reason: choice.finish_reason,
        usage,
    })
}

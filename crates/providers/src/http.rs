use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use core_types::{GatewayError, GatewayResult};
use reqwest::RequestBuilder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const ERROR_BODY_LIMIT: usize = 512;

pub(crate) fn build_client(backend: &str, timeout: Duration) -> GatewayResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| {
            GatewayError::InvalidConfiguration(format!(
                "failed to build http client for `{backend}`: {err}"
            ))
        })
}

pub(crate) fn extra_header_map(extra_headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in extra_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| anyhow!("invalid header name: {key}"))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| anyhow!("invalid header value for {key}"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Sends `body` as JSON and decodes a JSON reply, racing the whole exchange
/// against `cancellation`. Every failure other than cancellation is reported
/// as a provider error for `backend`.
pub(crate) async fn post_json<B, T>(
    backend: &str,
    request: RequestBuilder,
    body: &B,
    cancellation: &CancellationToken,
) -> GatewayResult<T>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let exchange = async {
        let response = request
            .json(body)
            .send()
            .await
            .context("failed to reach provider")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("failed to read provider response")?;
        debug!(%backend, %status, bytes = text.len(), "provider responded");

        if !status.is_success() {
            bail!("request failed: {status} {}", truncate(&text, ERROR_BODY_LIMIT));
        }

        serde_json::from_str::<T>(&text).context("invalid provider response json")
    };

    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(GatewayError::Cancelled),
        result = exchange => result.map_err(|err| GatewayError::provider(backend, err)),
    }
}

/// A missing credential is a local configuration problem, not a backend
/// failure, so it is never reported as retryable.
pub(crate) fn require_api_key<'a>(
    backend: &str,
    api_key: Option<&'a str>,
) -> GatewayResult<&'a str> {
    api_key.ok_or_else(|| {
        GatewayError::InvalidConfiguration(format!("provider `{backend}` has no api key"))
    })
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

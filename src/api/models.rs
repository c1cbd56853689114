use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{ApiError, KeepAliveRequest, ModelsResponse, PullProgressLine, PullRequest};
use crate::core::chat_stream::{decode_stream, post_streaming};
use crate::utils::url::construct_api_url;

const LATEST_TAG: &str = ":latest";

/// Name shown to users; the implicit `:latest` tag is dropped.
pub fn display_name(name: &str) -> &str {
    name.strip_suffix(LATEST_TAG).unwrap_or(name)
}

/// Installed models, by display name, in server order.
pub async fn fetch_models(client: &reqwest::Client, api_base: &str) -> Result<Vec<String>, ApiError> {
    let url = construct_api_url(api_base, "api/tags");
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return Err(ApiError::Status { status, body });
    }

    let models = response
        .json::<ModelsResponse>()
        .await
        .map_err(ApiError::Decode)?;
    Ok(models
        .models
        .iter()
        .map(|model| display_name(&model.name).to_string())
        .collect())
}

/// Ask the server to keep `model` resident for `keep_alive_secs`; `0` evicts
/// it. No conversational turn is produced.
pub async fn set_keep_alive(
    client: &reqwest::Client,
    api_base: &str,
    model: &str,
    keep_alive_secs: u64,
) -> Result<(), ApiError> {
    let request = KeepAliveRequest {
        model: model.to_string(),
        messages: Vec::new(),
        keep_alive: keep_alive_secs,
    };
    let url = construct_api_url(api_base, "api/chat");
    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return Err(ApiError::Status { status, body });
    }
    // Drain so the connection can be reused.
    let _ = response.bytes().await;
    debug!(model, keep_alive_secs, "Keep-alive updated");
    Ok(())
}

pub async fn load_model(
    client: &reqwest::Client,
    api_base: &str,
    model: &str,
    keep_alive_secs: u64,
) -> Result<(), ApiError> {
    set_keep_alive(client, api_base, model, keep_alive_secs).await
}

pub async fn unload_model(client: &reqwest::Client, api_base: &str, model: &str) -> Result<(), ApiError> {
    set_keep_alive(client, api_base, model, 0).await
}

/// Download `name`, reporting every progress frame to `on_progress`.
///
/// Succeeds only when the server reports `success`. Stopping `cancel` aborts
/// the transfer and returns [`ApiError::Cancelled`].
pub async fn pull_model<F>(
    client: &reqwest::Client,
    api_base: &str,
    name: &str,
    cancel: CancellationToken,
    mut on_progress: F,
) -> Result<(), ApiError>
where
    F: FnMut(&PullProgressLine),
{
    let request = PullRequest {
        name: name.to_string(),
        stream: true,
    };
    let response = post_streaming(client, api_base, "api/pull", &request, &cancel).await?;
    let mut frames = Box::pin(decode_stream::<PullProgressLine, _, _, _>(
        Box::pin(response.bytes_stream()),
        cancel.clone(),
    ));

    let mut succeeded = false;
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        if let Some(error) = frame.error {
            return Err(ApiError::Server(error));
        }
        on_progress(&frame);
        if frame.status == "success" {
            succeeded = true;
        }
    }

    if cancel.is_cancelled() {
        return Err(ApiError::Cancelled);
    }
    if !succeeded {
        return Err(ApiError::Server(format!(
            "pull of {name} ended before the server reported success"
        )));
    }
    info!(model = name, "Model pulled");
    Ok(())
}

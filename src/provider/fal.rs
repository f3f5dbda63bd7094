// src/provider/fal.rs — fal.ai image generation over the queue API
//
// submit -> poll status until COMPLETED -> fetch result -> download the image.

use async_trait::async_trait;
use std::time::Duration;

use super::{error_for_status, error_for_transport, ImageArtifact, ImageService};
use crate::core::types::GenerationParams;
use crate::infra::errors::ServiceError;

const SERVICE: &str = "fal";

pub struct FalImageService {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

/// Handle returned by the queue on submission.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueHandle {
    pub request_id: String,
    pub status_url: String,
    pub response_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueStatus {
    Queued,
    InProgress,
    Completed,
    Failed(String),
}

impl FalImageService {
    pub fn new(api_key: String, poll_interval: Duration) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://queue.fal.run".into(),
            poll_interval,
        }
    }

    fn auth_header(&self) -> String {
        format!("Key {}", self.api_key)
    }

    fn build_request_body(params: &GenerationParams) -> serde_json::Value {
        serde_json::json!({
            "prompt": params.prompt,
            "negative_prompt": params.negative_prompt,
            "image_size": { "width": params.width, "height": params.height },
            "num_inference_steps": params.num_inference_steps,
            "guidance_scale": params.guidance_scale,
            "num_images": 1,
            "enable_safety_checker": true,
        })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, ServiceError> {
        let response = self
            .client
            .get(url)
            .header("authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| error_for_transport(SERVICE, &e))?;
        read_json(response).await
    }

    pub async fn submit(&self, params: &GenerationParams) -> Result<QueueHandle, ServiceError> {
        let url = format!("{}/{}", self.base_url, params.model);
        let response = self
            .client
            .post(&url)
            .header("authorization", self.auth_header())
            .header("content-type", "application/json")
            .json(&Self::build_request_body(params))
            .send()
            .await
            .map_err(|e| error_for_transport(SERVICE, &e))?;
        parse_handle(&read_json(response).await?)
    }

    pub async fn status(&self, handle: &QueueHandle) -> Result<QueueStatus, ServiceError> {
        let resp = self.get_json(&handle.status_url).await?;
        Ok(parse_status(&resp))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| error_for_transport(SERVICE, &e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(SERVICE, status, &body, None));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| error_for_transport(SERVICE, &e))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageService for FalImageService {
    fn id(&self) -> &str {
        SERVICE
    }

    async fn generate(&self, params: &GenerationParams) -> Result<ImageArtifact, ServiceError> {
        let handle = self.submit(params).await?;
        tracing::debug!(request_id = %handle.request_id, "Queued generation request");

        loop {
            match self.status(&handle).await? {
                QueueStatus::Completed => break,
                QueueStatus::Failed(reason) => {
                    return Err(ServiceError::Server {
                        service: SERVICE.into(),
                        message: reason,
                    })
                }
                QueueStatus::Queued | QueueStatus::InProgress => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        let result = self.get_json(&handle.response_url).await?;
        let image = first_image(&result, params)?;
        let bytes = self.download(&image.url).await?;
        Ok(ImageArtifact {
            bytes,
            width: image.width,
            height: image.height,
            content_type: image.content_type,
            source_url: Some(image.url),
        })
    }
}

async fn read_json(response: reqwest::Response) -> Result<serde_json::Value, ServiceError> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await.unwrap_or_default();
        return Err(error_for_status(SERVICE, status, &body, retry_after.as_deref()));
    }
    response
        .json()
        .await
        .map_err(|e| ServiceError::MalformedResponse {
            service: SERVICE.into(),
            message: format!("Failed to parse response: {e}"),
        })
}

fn malformed(message: impl Into<String>) -> ServiceError {
    ServiceError::MalformedResponse {
        service: SERVICE.into(),
        message: message.into(),
    }
}

fn parse_handle(resp: &serde_json::Value) -> Result<QueueHandle, ServiceError> {
    let field = |name: &str| {
        resp[name]
            .as_str()
            .map(String::from)
            .ok_or_else(|| malformed(format!("submit response missing '{name}'")))
    };
    Ok(QueueHandle {
        request_id: field("request_id")?,
        status_url: field("status_url")?,
        response_url: field("response_url")?,
    })
}

fn parse_status(resp: &serde_json::Value) -> QueueStatus {
    match resp["status"].as_str() {
        Some("COMPLETED") => QueueStatus::Completed,
        Some("IN_PROGRESS") => QueueStatus::InProgress,
        Some("IN_QUEUE") => QueueStatus::Queued,
        Some(other) => QueueStatus::Failed(
            resp["error"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| format!("job ended with status {other}")),
        ),
        None => QueueStatus::Failed("status missing from queue response".into()),
    }
}

struct ResultImage {
    url: String,
    width: u32,
    height: u32,
    content_type: String,
}

fn first_image(
    resp: &serde_json::Value,
    params: &GenerationParams,
) -> Result<ResultImage, ServiceError> {
    let image = resp["images"]
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| malformed("result contains no images"))?;
    let url = image["url"]
        .as_str()
        .ok_or_else(|| malformed("image entry has no url"))?;
    Ok(ResultImage {
        url: url.to_string(),
        width: image["width"]
            .as_u64()
            .map(|w| w as u32)
            .unwrap_or(params.width),
        height: image["height"]
            .as_u64()
            .map(|h| h as u32)
            .unwrap_or(params.height),
        content_type: image["content_type"]
            .as_str()
            .unwrap_or("image/jpeg")
            .to_string(),
    })
}

//! Remote availability endpoint.

use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::trace;

use crate::config::StatusConfig;
use crate::error::{CaptureError, Result};

/// What one status request said about an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusReport {
    Live {
        stream_name: String,
        media_url: String,
    },
    Offline,
    /// HTTP 404: the endpoint does not know the entity.
    Absent,
    /// Any other non-200 status.
    Unexpected(u16),
}

impl StatusReport {
    pub fn is_live(&self) -> bool {
        matches!(self, StatusReport::Live { .. })
    }
}

#[async_trait]
pub trait StatusClient: Send + Sync + 'static {
    async fn fetch(&self, entity: &str) -> Result<StatusReport>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusDocument {
    #[serde(default)]
    is_cam_available: bool,
    #[serde(default)]
    cam: Option<CamDocument>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CamDocument {
    #[serde(default)]
    stream_name: String,
}

pub struct HttpStatusClient {
    client: reqwest::Client,
    site_base: String,
    cdn_base: String,
}

impl fmt::Debug for HttpStatusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStatusClient")
            .field("site_base", &self.site_base)
            .field("cdn_base", &self.cdn_base)
            .finish()
    }
}

impl HttpStatusClient {
    pub fn new(config: &StatusConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| {
                CaptureError::InvalidConfig(format!("status http client: {err}"))
            })?;

        Ok(Self {
            client,
            site_base: config.site_base.clone(),
            cdn_base: config.cdn_base.clone(),
        })
    }

    pub fn status_url(&self, entity: &str) -> String {
        status_url(&self.site_base, entity)
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn fetch(&self, entity: &str) -> Result<StatusReport> {
        let url = self.status_url(entity);
        trace!(target: "streamkeep::poller", %entity, %url, "requesting status");

        let response = self.client.get(&url).send().await.map_err(|err| {
            CaptureError::TransientNetwork {
                entity: entity.to_string(),
                message: err.to_string(),
            }
        })?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await.map_err(|err| {
                    CaptureError::TransientNetwork {
                        entity: entity.to_string(),
                        message: err.to_string(),
                    }
                })?;
                interpret_body(entity, &body, &self.cdn_base)
            }
            StatusCode::NOT_FOUND => Ok(StatusReport::Absent),
            other => Ok(StatusReport::Unexpected(other.as_u16())),
        }
    }
}

/// `{site_base}/{entity}` with the entity form-encoded.
pub fn status_url(site_base: &str, entity: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(entity.as_bytes()).collect();
    format!("{}/{encoded}", site_base.trim_end_matches('/'))
}

pub fn media_url(cdn_base: &str, stream_name: &str) -> String {
    format!(
        "{}/{stream_name}/master/{stream_name}.m3u8",
        cdn_base.trim_end_matches('/')
    )
}

fn interpret_body(entity: &str, body: &[u8], cdn_base: &str) -> Result<StatusReport> {
    let document: StatusDocument =
        serde_json::from_slice(body).map_err(|err| CaptureError::MalformedStatus {
            entity: entity.to_string(),
            message: err.to_string(),
        })?;

    if !document.is_cam_available {
        return Ok(StatusReport::Offline);
    }

    let stream_name = document
        .cam
        .map(|cam| cam.stream_name)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| CaptureError::MalformedStatus {
            entity: entity.to_string(),
            message: "live without a stream name".to_string(),
        })?;

    Ok(StatusReport::Live {
        media_url: media_url(cdn_base, &stream_name),
        stream_name,
    })
}

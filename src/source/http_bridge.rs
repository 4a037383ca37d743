// Backend transport that reaches each shard through an HTTP bridge in front of the chat backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::location::ObjectLocation;
use super::traits::{BackendTransport, Credentials, ExportedAuthorization, ShardId, ShardLink};
use crate::config::BackendConfig;
use crate::error::BackendError;

const API_KEY_HEADER: &str = "x-bridge-key";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct OpenSessionRequest<'a> {
    credentials: &'a str,
}

#[derive(Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct ExportRequest {
    shard: ShardId,
}

#[derive(Serialize, Deserialize)]
struct AuthorizationBody {
    id: i64,
    bytes: String,
}

#[derive(Clone)]
struct Endpoints {
    client: Client,
    urls: Arc<HashMap<ShardId, String>>,
    api_key: Option<String>,
}

impl Endpoints {
    fn base(&self, shard: ShardId) -> Result<&str, BackendError> {
        self.urls
            .get(&shard)
            .map(|s| s.trim_end_matches('/'))
            .ok_or_else(|| BackendError::Transport(format!("no bridge endpoint for shard {}", shard)))
    }

    /// Attach the bridge key, if one is configured.
    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }
}

pub struct HttpBridgeTransport {
    home: ShardId,
    endpoints: Endpoints,
}

impl HttpBridgeTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let urls = config
            .shards
            .iter()
            .map(|s| (s.id, s.url.clone()))
            .collect::<HashMap<_, _>>();
        Ok(Self {
            home: config.home_shard,
            endpoints: Endpoints {
                client,
                urls: Arc::new(urls),
                api_key: config.api_key.clone(),
            },
        })
    }
}

fn transport_err(e: reqwest::Error) -> BackendError {
    BackendError::Transport(e.to_string())
}

fn retry_after(resp: &Response) -> Duration {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

#[async_trait]
impl BackendTransport for HttpBridgeTransport {
    fn home_shard(&self) -> ShardId {
        self.home
    }

    async fn connect(
        &self,
        shard: ShardId,
        credentials: Credentials,
    ) -> Result<Arc<dyn ShardLink>, BackendError> {
        let base = self.endpoints.base(shard)?.to_string();
        let credentials = match credentials {
            Credentials::Home => "home",
            Credentials::Fresh => "fresh",
        };
        let resp = self
            .endpoints
            .authorize(self.endpoints.client.post(format!("{}/sessions", base)))
            .json(&OpenSessionRequest { credentials })
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if !status.is_success() {
            warn!("bridge session open failed shard={} status={}", shard, status.as_u16());
            return Err(BackendError::Transport(format!(
                "session open failed: HTTP {}",
                status.as_u16()
            )));
        }
        let opened: OpenSessionResponse = resp.json().await.map_err(transport_err)?;
        debug!("bridge session opened shard={} id={}", shard, opened.session_id);

        Ok(Arc::new(BridgeLink {
            endpoints: self.endpoints.clone(),
            session_url: format!("{}/sessions/{}", base, opened.session_id),
        }))
    }

    async fn export_authorization(
        &self,
        target: ShardId,
    ) -> Result<ExportedAuthorization, BackendError> {
        let base = self.endpoints.base(self.home)?;
        let resp = self
            .endpoints
            .authorize(self.endpoints.client.post(format!("{}/auth/export", base)))
            .json(&ExportRequest { shard: target })
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Transport(format!(
                "authorization export failed: HTTP {}",
                status.as_u16()
            )));
        }
        let body: AuthorizationBody = resp.json().await.map_err(transport_err)?;
        let bytes = STANDARD
            .decode(body.bytes)
            .map_err(|e| BackendError::Transport(format!("bad exported authorization: {}", e)))?;
        Ok(ExportedAuthorization {
            id: body.id,
            bytes: Bytes::from(bytes),
        })
    }
}

struct BridgeLink {
    endpoints: Endpoints,
    session_url: String,
}

#[async_trait]
impl ShardLink for BridgeLink {
    async fn import_authorization(
        &self,
        auth: &ExportedAuthorization,
    ) -> Result<(), BackendError> {
        let resp = self
            .endpoints
            .authorize(
                self.endpoints
                    .client
                    .post(format!("{}/auth/import", self.session_url)),
            )
            .json(&AuthorizationBody {
                id: auth.id,
                bytes: STANDARD.encode(&auth.bytes),
            })
            .send()
            .await
            .map_err(transport_err)?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => {
                let body = resp.text().await.unwrap_or_default();
                if body.contains("AUTH_BYTES_INVALID") {
                    Err(BackendError::AuthKeyInvalid)
                } else {
                    Err(BackendError::Transport(format!("import rejected: {}", body)))
                }
            }
            StatusCode::GONE => Err(BackendError::SessionClosed),
            s => Err(BackendError::Transport(format!(
                "authorization import failed: HTTP {}",
                s.as_u16()
            ))),
        }
    }

    async fn fetch_chunk(
        &self,
        location: &ObjectLocation,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, BackendError> {
        let url = format!("{}/objects/{}", self.session_url, location.path_segment());
        let resp = self
            .endpoints
            .authorize(self.endpoints.client.get(&url))
            .query(&[("offset", offset), ("limit", limit)])
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        match status.as_u16() {
            200..=299 => resp.bytes().await.map_err(transport_err),
            // 420 is the backend's own flood-wait status.
            420 | 429 => Err(BackendError::RateLimited {
                retry_after: retry_after(&resp),
            }),
            404 => Err(BackendError::ObjectGone),
            410 => Err(BackendError::SessionClosed),
            code => {
                warn!("bridge fetch failed status={} offset={}", code, offset);
                Err(BackendError::Transport(format!("fetch failed: HTTP {}", code)))
            }
        }
    }

    async fn close(&self) {
        let req = self
            .endpoints
            .authorize(self.endpoints.client.delete(&self.session_url));
        if let Err(e) = req.send().await {
            debug!("bridge session close failed: {}", e);
        }
    }
}

//! HTTP implementation of the server API.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::api::{
    HeartbeatMetrics, HeartbeatResponse, JobAssignment, Registration, ServerApi, StatusUpdate,
    StepReport,
};
use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::execution::ExecutionStatus;
use crate::identity::AgentIdentity;

#[derive(Deserialize)]
struct RegistrationBody {
    agent_id: String,
    api_key: String,
}

#[derive(Deserialize)]
struct AssetBody {
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct ExecutionBody {
    status: ExecutionStatus,
}

/// Talks to the fleet server over its REST API.
pub struct HttpServerApi {
    base_url: Url,
    client: reqwest::Client,
    api_key: RwLock<Option<SecretString>>,
    agent_id: RwLock<Option<String>>,
}

impl HttpServerApi {
    pub fn new(config: &AgentConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("fleet-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Request {
                endpoint: config.server_url.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        let base_url = Url::parse(&config.server_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| TransportError::Request {
                endpoint: config.server_url.clone(),
                reason: "server URL is not a valid http(s) base URL".to_string(),
            })?;

        Ok(Self {
            base_url,
            client,
            api_key: RwLock::new(config.api_key.clone()),
            agent_id: RwLock::new(None),
        })
    }

    /// Use an agent id restored from the identity file.
    pub async fn set_agent_id(&self, agent_id: impl Into<String>) {
        *self.agent_id.write().await = Some(agent_id.into());
    }

    /// Server URL with `segments` appended, each percent-encoded as a
    /// single path segment.
    fn url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Request {
                endpoint: self.base_url.to_string(),
                reason: "server URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn agent_id(&self) -> Result<String, TransportError> {
        self.agent_id
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotRegistered)
    }

    async fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key.read().await.as_ref() {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    /// Send a request without interpreting the status code.
    async fn send_raw(
        &self,
        endpoint: &str,
        builder: RequestBuilder,
    ) -> Result<Response, TransportError> {
        self.authorized(builder)
            .await
            .send()
            .await
            .map_err(|e| TransportError::Request {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    async fn send(&self, endpoint: &str, builder: RequestBuilder) -> Result<Response, TransportError> {
        let resp = self.send_raw(endpoint, builder).await?;
        check_status(endpoint, resp).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        builder: RequestBuilder,
    ) -> Result<T, TransportError> {
        let resp = self.send(endpoint, builder).await?;
        resp.json::<T>().await.map_err(|e| TransportError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }
}

async fn check_status(endpoint: &str, resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TransportError::Status {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn register(&self, identity: &AgentIdentity) -> Result<Registration, TransportError> {
        let endpoint = "register";
        let body: RegistrationBody = self
            .send_json(
                endpoint,
                self.client
                    .post(self.url(&["api", "agents", "register"])?)
                    .json(identity),
            )
            .await?;

        *self.agent_id.write().await = Some(body.agent_id.clone());
        let api_key = SecretString::from(body.api_key);
        *self.api_key.write().await = Some(api_key.clone());

        tracing::info!(agent_id = %body.agent_id, "Registered with server");
        Ok(Registration {
            agent_id: body.agent_id,
            api_key,
        })
    }

    async fn heartbeat(
        &self,
        metrics: &HeartbeatMetrics,
    ) -> Result<HeartbeatResponse, TransportError> {
        let agent_id = self.agent_id().await?;
        let url = self.url(&["api", "agents", &agent_id, "heartbeat"])?;
        self.send_json("heartbeat", self.client.post(url).json(metrics))
            .await
    }

    async fn poll_jobs(&self) -> Result<Vec<JobAssignment>, TransportError> {
        let agent_id = self.agent_id().await?;
        let url = self.url(&["api", "agents", &agent_id, "jobs"])?;
        self.send_json("poll_jobs", self.client.get(url)).await
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<(), TransportError> {
        let url = self.url(&["api", "executions", &update.execution_id, "status"])?;
        self.send("update_status", self.client.put(url).json(update))
            .await?;
        Ok(())
    }

    async fn log_step(&self, step: &StepReport) -> Result<(), TransportError> {
        let endpoint = "log_step";
        let url = self.url(&["api", "executions", &step.execution_id, "steps"])?;

        let screenshot = match &step.screenshot {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => Some((path, bytes)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Screenshot unreadable, sending step without it");
                    None
                }
            },
            None => None,
        };

        let builder = match screenshot {
            Some((path, bytes)) => {
                let json = serde_json::to_string(step).map_err(|e| TransportError::Decode {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "screenshot.png".to_string());
                let part = Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("image/png")
                    .map_err(|e| TransportError::Request {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    })?;
                let form = Form::new().text("step", json).part("screenshot", part);
                self.client.post(url).multipart(form)
            }
            None => self.client.post(url).json(step),
        };

        self.send(endpoint, builder).await?;
        Ok(())
    }

    async fn get_asset(&self, asset_id: &str) -> Result<Option<SecretString>, TransportError> {
        let endpoint = "get_asset";
        let url = self.url(&["api", "assets", asset_id])?;
        let resp = self.send_raw(endpoint, self.client.get(url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(endpoint, resp).await?;
        let body: AssetBody = resp.json().await.map_err(|e| TransportError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let value = match body.value {
            serde_json::Value::Null => return Ok(None),
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(Some(SecretString::from(value)))
    }

    async fn download_package(
        &self,
        package_id: &str,
        version: Option<&str>,
    ) -> Result<Vec<u8>, TransportError> {
        let endpoint = "download_package";
        let mut builder = self
            .client
            .get(self.url(&["api", "packages", package_id, "download"])?);
        if let Some(version) = version {
            builder = builder.query(&[("version", version)]);
        }
        let resp = self.send(endpoint, builder).await?;
        let bytes = resp.bytes().await.map_err(|e| TransportError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionStatus>, TransportError> {
        let endpoint = "execution_status";
        let url = self.url(&["api", "executions", execution_id])?;
        let resp = self.send_raw(endpoint, self.client.get(url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(endpoint, resp).await?;
        let body: ExecutionBody = resp.json().await.map_err(|e| TransportError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(body.status))
    }
}

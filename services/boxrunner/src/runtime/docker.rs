//! Docker Engine HTTP API client.
//!
//! Talks to the daemon over its unix socket or a TCP endpoint.
//!
//! Reference: https://docs.docker.com/reference/api/engine/

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{ContainerRuntime, RuntimeError};

/// Where the Docker daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// Unix socket path.
    Unix(PathBuf),
    /// HTTP base URL, without trailing slash.
    Http(String),
}

impl FromStr for DockerEndpoint {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return Ok(Self::Http(format!("http://{}", addr.trim_end_matches('/'))));
        }
        if s.starts_with("http://") {
            return Ok(Self::Http(s.trim_end_matches('/').to_string()));
        }
        Err(RuntimeError::InvalidEndpoint(s.to_string()))
    }
}

enum Transport {
    Unix {
        socket: PathBuf,
        client: Client<UnixConnector>,
    },
    Http {
        base_url: String,
        client: Client<HttpConnector>,
    },
}

impl Transport {
    fn uri(&self, path: &str) -> Result<hyper::Uri, RuntimeError> {
        match self {
            Transport::Unix { socket, .. } => Ok(hyperlocal::Uri::new(socket, path).into()),
            Transport::Http { base_url, .. } => format!("{base_url}{path}")
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| {
                    RuntimeError::InvalidEndpoint(e.to_string())
                }),
        }
    }

    async fn request(&self, request: Request<Body>) -> Result<hyper::Response<Body>, hyper::Error> {
        match self {
            Transport::Unix { client, .. } => client.request(request).await,
            Transport::Http { client, .. } => client.request(request).await,
        }
    }
}

/// Docker Engine API client.
pub struct DockerClient {
    endpoint: DockerEndpoint,
    transport: Transport,
}

impl DockerClient {
    /// Create a client for the given endpoint.
    pub fn new(endpoint: DockerEndpoint) -> Self {
        let transport = match &endpoint {
            DockerEndpoint::Unix(socket) => Transport::Unix {
                socket: socket.clone(),
                client: Client::unix(),
            },
            DockerEndpoint::Http(base_url) => Transport::Http {
                base_url: base_url.clone(),
                client: Client::new(),
            },
        };
        Self {
            endpoint,
            transport,
        }
    }

    /// Create a client from a `DOCKER_HOST`-style string.
    pub fn from_host(host: &str) -> Result<Self, RuntimeError> {
        Ok(Self::new(host.parse()?))
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &DockerEndpoint {
        &self.endpoint
    }

    /// Perform a request and return status and body of a successful response.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), RuntimeError> {
        let uri = self.transport.uri(path)?;
        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| RuntimeError::Api {
            status: 0,
            message: e.to_string(),
        })?;

        let response = self.transport.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok((status, bytes));
        }

        let message = serde_json::from_slice::<ErrorBody>(&bytes)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        error!(status = %status, message = %message, "Docker API error");
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerRequest<'a> {
    image: &'a str,
    cmd: &'a [String],
}

#[derive(Deserialize)]
struct CreateContainerResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}

/// Split an image reference into repository and tag.
///
/// Digest references are passed through whole with no tag.
fn split_image(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.rfind(':') {
        Some(pos) => {
            let split = image.len() - last_segment.len() + pos;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, Some("latest")),
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.call(Method::GET, "/_ping", None).await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let path = match split_image(image) {
            (repo, Some(tag)) => format!("/images/create?fromImage={repo}&tag={tag}"),
            (repo, None) => format!("/images/create?fromImage={repo}"),
        };
        let (_, body) = self.call(Method::POST, &path, None).await?;

        // Pull failures arrive as an `error` entry inside a 200 progress stream.
        for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let progress = serde_json::from_slice::<PullProgress>(line);
            if let Ok(PullProgress {
                error: Some(message),
            }) = progress
            {
                error!(image = image, message = %message, "Image pull failed");
                return Err(RuntimeError::Pull(message));
            }
        }

        info!(image = image, "Image pulled");
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        cmd: &[String],
    ) -> Result<String, RuntimeError> {
        let body = serde_json::to_vec(&CreateContainerRequest { image, cmd })?;
        let path = format!("/containers/create?name={name}");
        let (_, bytes) = self.call(Method::POST, &path, Some(body)).await?;
        let created: CreateContainerResponse = serde_json::from_slice(&bytes)?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let path = format!("/containers/{id}/start");
        self.call(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let path = format!("/containers/{id}/wait");
        let (status, bytes) = self.call(Method::POST, &path, None).await?;
        let waited: WaitResponse = serde_json::from_slice(&bytes)?;

        if let Some(WaitError { message }) = waited.error {
            if !message.is_empty() {
                return Err(RuntimeError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
        }
        Ok(waited.status_code)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let path = format!("/containers/{id}?force=true");
        match self.call(Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::Api { status: 404, .. }) => {
                debug!(container = id, "Container already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

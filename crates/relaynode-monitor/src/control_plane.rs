use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use relaynode_core::node::NodeHeartbeat;

/// External control plane the node reports to.
///
/// Both calls are best-effort: callers log failures and carry on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Liveness probe.
    async fn probe(&self) -> Result<()>;

    /// Forward a heartbeat record.
    async fn send_heartbeat(&self, heartbeat: &NodeHeartbeat) -> Result<()>;
}

/// [`ControlPlane`] over HTTP with bearer-token auth.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relaynode/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_key)
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn probe(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("HTTP request failed: {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, url);
        }
        Ok(())
    }

    async fn send_heartbeat(&self, heartbeat: &NodeHeartbeat) -> Result<()> {
        let url = format!("{}/api/v1/nodes/heartbeat", self.base_url);
        let resp = self
            .authorized(self.client.post(&url))
            .json(heartbeat)
            .send()
            .await
            .with_context(|| format!("HTTP request failed: {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, url);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use relaynode_core::node::HealthState;
    use std::sync::{Arc, Mutex};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn heartbeat() -> NodeHeartbeat {
        NodeHeartbeat {
            id: "node-a".into(),
            region: "eu-west".into(),
            ip: "10.0.0.1".into(),
            port: 8080,
            status: HealthState::Healthy,
            last_heartbeat: 1,
        }
    }

    #[tokio::test]
    async fn test_probe_sends_bearer_token() {
        let seen = Arc::new(Mutex::new(None::<String>));
        let s = Arc::clone(&seen);
        let router = Router::new().route(
            "/health",
            get(move |headers: HeaderMap| {
                let s = Arc::clone(&s);
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *s.lock().unwrap() = auth;
                    StatusCode::OK
                }
            }),
        );
        let base = serve(router).await;

        let cp = HttpControlPlane::new(&base, "k3y", Duration::from_secs(2)).unwrap();
        cp.probe().await.unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("Bearer k3y"));
    }

    #[tokio::test]
    async fn test_probe_fails_on_error_status() {
        let router = Router::new().route("/health", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let base = serve(router).await;

        let cp = HttpControlPlane::new(&base, "", Duration::from_secs(2)).unwrap();
        let err = format!("{}", cp.probe().await.unwrap_err());
        assert!(err.contains("503"));
    }

    #[tokio::test]
    async fn test_heartbeat_posts_json_body() {
        let body = Arc::new(Mutex::new(None::<serde_json::Value>));
        let b = Arc::clone(&body);
        let router = Router::new().route(
            "/api/v1/nodes/heartbeat",
            post(move |axum::Json(value): axum::Json<serde_json::Value>| {
                let b = Arc::clone(&b);
                async move {
                    *b.lock().unwrap() = Some(value);
                    StatusCode::OK
                }
            }),
        );
        let base = serve(router).await;

        let cp = HttpControlPlane::new(&format!("{}/", base), "", Duration::from_secs(2)).unwrap();
        cp.send_heartbeat(&heartbeat()).await.unwrap();
        let value = body.lock().unwrap().clone().unwrap();
        assert_eq!(value["id"], "node-a");
        assert_eq!(value["lastHeartbeat"], 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cp = HttpControlPlane::new(&format!("http://{}", addr), "", Duration::from_secs(2)).unwrap();
        assert!(cp.probe().await.is_err());
    }
}

//! ---
//! luo_section: "05-networking-external-interfaces"
//! luo_subsection: "binary"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "HTTP client for the daemon admin API."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AdminClient {
    http: Client,
    base: String,
}

impl AdminClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base: endpoint.trim_end_matches('/').to_owned(),
        })
    }

    pub async fn status(&self) -> Result<Value> {
        self.send(Method::GET, "/status", None).await
    }

    pub async fn check(&self, module: Option<&str>) -> Result<Value> {
        let body = module.map(|name| json!({ "module": name }));
        self.send(Method::POST, "/check", body).await
    }

    pub async fn versions(&self) -> Result<Value> {
        self.send(Method::GET, "/versions", None).await
    }

    pub async fn reload(&self, name: &str) -> Result<Value> {
        self.send(Method::POST, &format!("/reload/{name}"), None).await
    }

    pub async fn reload_all(&self) -> Result<Value> {
        self.send(Method::POST, "/reload-all", None).await
    }

    pub async fn rollback(&self, name: &str, generation: Option<u64>) -> Result<Value> {
        let body = json!({ "module": name, "generation": generation });
        self.send(Method::POST, "/rollback", Some(body)).await
    }

    pub async fn worker_sync(&self) -> Result<Value> {
        self.send(Method::GET, "/worker-sync", None).await
    }

    pub async fn trigger_all_workers(&self) -> Result<Value> {
        self.send(Method::POST, "/trigger-all-workers", None).await
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        debug!(%method, %url, "admin request");
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .with_context(|| format!("invalid response body from {url}"))?;
        if status.is_success() {
            Ok(payload)
        } else {
            let kind = payload["kind"].as_str().unwrap_or("error");
            let message = payload["message"].as_str().unwrap_or("request failed");
            Err(anyhow!("{status} {kind}: {message}"))
        }
    }
}

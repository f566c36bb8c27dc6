//! Thin HTTP adapter for the code-execution sandbox service. Executions
//! can run for minutes; the request timeout is sized accordingly and the
//! call never blocks the runtime (plain async I/O).

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use courier_core::{config, CourierError, Result};

/// Upper bound on one sandbox execution.
const EXEC_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SandboxClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecResult {
    pub sandbox_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    /// Wall-clock execution time reported by the service, in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl SandboxClient {
    pub fn from_config(cfg: &courier_core::config::SandboxConfig) -> Result<Option<Self>> {
        let Some(base_url) = cfg.base_url.clone() else {
            return Ok(None);
        };
        let api_key = match &cfg.api_key_file {
            Some(path) => Some(config::read_secret_file(path)?),
            None => None,
        };
        Ok(Some(Self {
            client: reqwest::Client::builder()
                .timeout(EXEC_TIMEOUT)
                .build()
                .map_err(|e| CourierError::Config(e.to_string()))?,
            base_url,
            api_key,
        }))
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    /// Run code, reusing `sandbox_id` when it still exists server-side.
    /// The service allocates a fresh sandbox when the id is absent or
    /// expired and reports the effective id back.
    pub async fn run(&self, sandbox_id: Option<&str>, code: &str) -> Result<ExecResult> {
        let url = format!("{}/execute", self.base_url);
        let body = json!({
            "sandbox_id": sandbox_id,
            "language": "python",
            "code": code,
        });

        let resp = self
            .auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CourierError::ApiTimeout("sandbox execution".into())
                } else {
                    CourierError::ApiConnection(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(CourierError::Provider(format!(
                "sandbox returned status {}",
                resp.status().as_u16()
            )));
        }

        resp.json::<ExecResult>()
            .await
            .map_err(|e| CourierError::Provider(e.to_string()))
    }
}

//! HTTP client for the remote simulation service.
//!
//! The lifecycle and poller only talk to the [`SimulationService`] trait,
//! which keeps them testable against a scripted in-memory service.

use crate::model::{
    Ack, AnalysisResponse, PlotResponse, PlotType, SimulationConfig, SimulationHandle,
    StartResponse, StatusSnapshot,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Duration;

/// Boundary to the remote simulation engine.
#[async_trait]
pub trait SimulationService: Send + Sync {
    /// Submit a config; returns the handle for the new run.
    async fn submit(&self, config: &SimulationConfig) -> Result<SimulationHandle>;
    /// Poll one status snapshot for an active run.
    async fn status(&self, handle: &SimulationHandle) -> Result<StatusSnapshot>;
    /// Best-effort remote cancellation.
    async fn cancel(&self, handle: &SimulationHandle) -> Result<()>;
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("portfolio-sim-cli/{}", env!("CARGO_PKG_VERSION")))
            // Outer timeout for every request; a slow poll merely delays the
            // next tick instead of wedging the loop.
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// One advisor question. Without a handle the service answers from its
    /// most recent portfolio state.
    pub async fn ask_advisor(
        &self,
        question: &str,
        handle: Option<&SimulationHandle>,
    ) -> Result<String> {
        let mut body = serde_json::json!({ "question": question });
        if let Some(h) = handle {
            body["simulation_id"] = serde_json::Value::String(h.to_string());
        }
        let resp: AnalysisResponse = self
            .http
            .post(self.url("/ai_analysis"))
            .json(&body)
            .send()
            .await
            .context("advisor request failed")?
            .json()
            .await
            .context("invalid advisor response")?;
        if !resp.success {
            bail!(resp
                .error
                .unwrap_or_else(|| "advisor request rejected".to_string()));
        }
        resp.analysis
            .ok_or_else(|| anyhow!("advisor response carried no analysis"))
    }

    /// Reset the server-side advisor conversation context.
    pub async fn clear_chat(&self) -> Result<()> {
        let resp: Ack = self
            .http
            .post(self.url("/clear_chat"))
            .send()
            .await
            .context("chat reset request failed")?
            .json()
            .await
            .context("invalid chat reset response")?;
        if !resp.success {
            bail!(resp
                .error
                .unwrap_or_else(|| "chat reset rejected".to_string()));
        }
        Ok(())
    }

    /// Fetch a rendered chart for a completed run and return the PNG bytes.
    /// Without a handle the service renders from its current portfolio state.
    pub async fn fetch_plot(
        &self,
        handle: Option<&SimulationHandle>,
        plot_type: PlotType,
    ) -> Result<Vec<u8>> {
        let target = handle
            .map(|h| h.to_string())
            .unwrap_or_else(|| "current".to_string());
        let resp: PlotResponse = self
            .http
            .get(self.url(&format!("/plot/{target}/{}", plot_type.as_str())))
            .send()
            .await
            .context("plot request failed")?
            .json()
            .await
            .context("invalid plot response")?;
        if !resp.success {
            bail!(resp
                .error
                .unwrap_or_else(|| "plot request rejected".to_string()));
        }
        let image = resp
            .image
            .ok_or_else(|| anyhow!("plot response carried no image"))?;
        decode_image_data_url(&image)
    }
}

/// Decode a `data:image/png;base64,...` payload (or bare base64) to bytes.
fn decode_image_data_url(data: &str) -> Result<Vec<u8>> {
    let payload = data.rsplit("base64,").next().unwrap_or(data);
    BASE64
        .decode(payload.trim())
        .context("plot image was not valid base64")
}

#[async_trait]
impl SimulationService for ApiClient {
    async fn submit(&self, config: &SimulationConfig) -> Result<SimulationHandle> {
        let resp: StartResponse = self
            .http
            .post(self.url("/start_simulation"))
            .json(config)
            .send()
            .await
            .context("submission request failed")?
            .json()
            .await
            .context("invalid submission response")?;
        if !resp.success {
            bail!(resp
                .error
                .unwrap_or_else(|| "submission rejected".to_string()));
        }
        resp.simulation_id
            .map(SimulationHandle)
            .ok_or_else(|| anyhow!("submission succeeded without a simulation id"))
    }

    async fn status(&self, handle: &SimulationHandle) -> Result<StatusSnapshot> {
        self.http
            .get(self.url(&format!("/simulation_status/{handle}")))
            .send()
            .await
            .context("status request failed")?
            .error_for_status()
            .context("status request rejected")?
            .json()
            .await
            .context("invalid status payload")
    }

    async fn cancel(&self, handle: &SimulationHandle) -> Result<()> {
        let resp: Ack = self
            .http
            .post(self.url(&format!("/stop_simulation/{handle}")))
            .send()
            .await
            .context("cancel request failed")?
            .json()
            .await
            .context("invalid cancel response")?;
        if !resp.success {
            bail!(resp
                .error
                .unwrap_or_else(|| "cancel rejected".to_string()));
        }
        Ok(())
    }
}

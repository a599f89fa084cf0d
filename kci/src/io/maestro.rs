//! Maestro REST client.
//!
//! The [`MaestroApi`] trait decouples the watch and bisect loops from HTTP.
//! Tests use scripted implementations that replay canned node sets.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::types::Node;
use crate::io::config::Instance;

/// Body of `POST {pipeline}/api/checkout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutRequest {
    pub url: String,
    pub branch: String,
    pub commit: String,
    #[serde(rename = "jobfilter", skip_serializing_if = "Vec::is_empty")]
    pub job_filter: Vec<String>,
    #[serde(rename = "platformfilter", skip_serializing_if = "Vec::is_empty")]
    pub platform_filter: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutResponse {
    #[serde(default)]
    message: Option<String>,
    node: CheckoutNode,
}

#[derive(Debug, Deserialize)]
struct CheckoutNode {
    id: String,
    treeid: String,
}

/// Identity of a triggered checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggeredRun {
    pub treeid: String,
    pub node_id: String,
    pub message: Option<String>,
}

pub trait MaestroApi {
    /// Ask the pipeline to check out, build and test one commit.
    fn trigger_checkout(&self, request: &CheckoutRequest) -> Result<TriggeredRun>;
    /// Every node currently belonging to `treeid`.
    fn tree_nodes(&self, treeid: &str) -> Result<Vec<Node>>;
}

impl<T: MaestroApi + ?Sized> MaestroApi for &T {
    fn trigger_checkout(&self, request: &CheckoutRequest) -> Result<TriggeredRun> {
        (**self).trigger_checkout(request)
    }

    fn tree_nodes(&self, treeid: &str) -> Result<Vec<Node>> {
        (**self).tree_nodes(treeid)
    }
}

/// Blocking HTTP client for one Maestro instance.
#[derive(Debug, Clone)]
pub struct HttpMaestro {
    pipeline_url: String,
    api_url: String,
    token: Option<String>,
    client: Client,
}

impl HttpMaestro {
    pub fn new(instance: &Instance) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("kci/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            pipeline_url: instance.pipeline.trim_end_matches('/').to_string(),
            api_url: instance.api.trim_end_matches('/').to_string(),
            token: instance.token.clone(),
            client,
        })
    }
}

impl MaestroApi for HttpMaestro {
    #[instrument(skip_all, fields(commit = %request.commit))]
    fn trigger_checkout(&self, request: &CheckoutRequest) -> Result<TriggeredRun> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| anyhow!("no Maestro token configured for checkout"))?;
        let endpoint = format!("{}/api/checkout", self.pipeline_url);
        debug!(endpoint = %endpoint, "triggering checkout");
        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", token)
            .json(request)
            .send()
            .with_context(|| format!("POST {endpoint}"))?;

        let status = response.status();
        let body = response
            .text()
            .with_context(|| format!("read response of POST {endpoint}"))?;
        if !status.is_success() {
            return Err(anyhow!(
                "checkout rejected ({}): {}",
                status.as_u16(),
                body.trim()
            ));
        }
        let parsed: CheckoutResponse = serde_json::from_str(&body)
            .with_context(|| format!("parse checkout response: {}", body.trim()))?;
        info!(treeid = %parsed.node.treeid, node = %parsed.node.id, "checkout triggered");
        Ok(TriggeredRun {
            treeid: parsed.node.treeid,
            node_id: parsed.node.id,
            message: parsed.message,
        })
    }

    #[instrument(skip_all, fields(treeid = %treeid))]
    fn tree_nodes(&self, treeid: &str) -> Result<Vec<Node>> {
        let endpoint = format!("{}/latest/nodes/fast?treeid={treeid}", self.api_url);
        let response = self
            .client
            .get(&endpoint)
            .send()
            .with_context(|| format!("GET {endpoint}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {endpoint} returned {}", status.as_u16()));
        }
        let nodes: Vec<Node> = response
            .json()
            .with_context(|| format!("parse nodes of tree {treeid}"))?;
        debug!(count = nodes.len(), "tree nodes fetched");
        Ok(nodes)
    }
}

//! GraphQL client for campaign definitions stored in the CMS.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{Campaign, CampaignSource};
use crate::error::CampaignError;

const STREAMS_QUERY: &str = r#"
query Streams($name: String!) {
  streams(where: { name: $name }) {
    id
    stream_steps {
      id
      delay_seconds
      template {
        id
        subject
        sender
        html_body
        text_body
        images { name url width height }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<StreamsData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamsData {
    #[serde(default)]
    streams: Vec<Campaign>,
}

/// Resolves campaigns through the CMS GraphQL endpoint.
#[derive(Debug, Clone)]
pub struct CmsCampaignSource {
    client: reqwest::Client,
    endpoint: String,
}

impl CmsCampaignSource {
    /// `base_url` is the CMS root; queries go to `{base_url}/graphql`.
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/graphql", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl CampaignSource for CmsCampaignSource {
    async fn campaign(&self, name: &str) -> Result<Campaign, CampaignError> {
        let body = serde_json::json!({
            "query": STREAMS_QUERY,
            "variables": { "name": name },
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| CampaignError::Request(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CampaignError::Request(format!(
                "CMS returned {status}: {text}"
            )));
        }

        let parsed: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| CampaignError::InvalidResponse(e.to_string()))?;

        if !parsed.errors.is_empty() {
            let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
            return Err(CampaignError::Request(messages.join("; ")));
        }

        let data = parsed
            .data
            .ok_or_else(|| CampaignError::InvalidResponse("missing data".to_string()))?;

        let campaign = data
            .streams
            .into_iter()
            .next()
            .ok_or_else(|| CampaignError::UnknownCampaign {
                name: name.to_string(),
            })?;

        debug!(series = name, steps = campaign.steps.len(), "Campaign resolved");
        Ok(campaign)
    }
}

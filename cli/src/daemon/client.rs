// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for the `quota-sets` API of a running server

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use quotad_core::domain::quota::{QuotaDetail, QuotaSet};
use quotad_core::presentation::api::QuotaSetResponse;

#[derive(Debug, Clone)]
pub struct QuotaClient {
    client: Client,
    base_url: String,
    /// Project of the caller, used as the `/v2/{project_id}` prefix
    caller_project: String,
}

/// Optional scope selectors of a quota request
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub user_id: Option<String>,
    pub share_type: Option<String>,
}

impl Scope {
    fn query(&self) -> Vec<(&'static str, &str)> {
        let mut query = Vec::new();
        if let Some(user_id) = &self.user_id {
            query.push(("user_id", user_id.as_str()));
        }
        if let Some(share_type) = &self.share_type {
            query.push(("share_type", share_type.as_str()));
        }
        query
    }
}

impl QuotaClient {
    pub fn new(host: &str, port: u16, caller_project: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: format!("http://{}:{}", host, port),
            caller_project: caller_project.into(),
        })
    }

    fn url(&self, target: &str, suffix: &str) -> String {
        format!(
            "{}/v2/{}/quota-sets/{}{}",
            self.base_url, self.caller_project, target, suffix
        )
    }

    pub async fn show(&self, target: &str, scope: &Scope) -> Result<QuotaSetResponse<i64>> {
        let request = self.client.get(self.url(target, "")).query(&scope.query());
        send(request, "show quotas").await
    }

    pub async fn defaults(&self, target: &str) -> Result<QuotaSetResponse<i64>> {
        let request = self.client.get(self.url(target, "/defaults"));
        send(request, "show default quotas").await
    }

    pub async fn detail(&self, target: &str, scope: &Scope) -> Result<QuotaSetResponse<QuotaDetail>> {
        let request = self.client.get(self.url(target, "/detail")).query(&scope.query());
        send(request, "show quota detail").await
    }

    pub async fn update(
        &self,
        target: &str,
        limits: &QuotaSet,
        scope: &Scope,
        force: bool,
    ) -> Result<QuotaSetResponse<i64>> {
        let mut quota_set = Map::new();
        for (resource, limit) in limits {
            quota_set.insert(resource.to_string(), Value::from(*limit));
        }
        if force {
            quota_set.insert("force".to_string(), Value::Bool(true));
        }
        if let Some(share_type) = &scope.share_type {
            quota_set.insert("share_type".to_string(), Value::String(share_type.clone()));
        }

        let user_query: Vec<(&str, &str)> = scope
            .user_id
            .as_deref()
            .map(|user_id| vec![("user_id", user_id)])
            .unwrap_or_default();

        let request = self
            .client
            .put(self.url(target, ""))
            .query(&user_query)
            .json(&serde_json::json!({ "quota_set": quota_set }));
        send(request, "update quotas").await
    }

    pub async fn delete(&self, target: &str, scope: &Scope) -> Result<()> {
        let response = self
            .client
            .delete(self.url(target, ""))
            .query(&scope.query())
            .send()
            .await
            .context("Failed to delete quotas")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to delete quotas: {}", fault_message(response).await);
        }
        Ok(())
    }
}

async fn send<T: DeserializeOwned>(request: RequestBuilder, action: &str) -> Result<T> {
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to {}", action))?;
    parse(response, action).await
}

async fn parse<T: DeserializeOwned>(response: Response, action: &str) -> Result<T> {
    if !response.status().is_success() {
        anyhow::bail!("Failed to {}: {}", action, fault_message(response).await);
    }

    response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", action))
}

/// Pull the message out of an OpenStack style fault body, falling back to the raw text.
async fn fault_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|body| {
            body.as_object()
                .and_then(|faults| faults.values().next())
                .and_then(|fault| fault.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP {}: {}", status, text))
}

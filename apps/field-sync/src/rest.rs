//! HTTP client for the field data API. Replays queued CRUD writes and
//! resolves holder display names from volunteer profiles.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::identity::HolderDirectory;
use crate::queue::{
    ApplyError, EntityType, HandlerRegistry, MutationAction, PendingMutation, ReplayHandler,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    id: String,
    display_name: Option<String>,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Register this client as the replay handler for every entity type.
    pub fn register_all(&self, registry: &HandlerRegistry) {
        for entity_type in EntityType::ALL {
            registry.register_handler(entity_type, self.clone());
        }
    }

    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn mutation_request(&self, mutation: &PendingMutation) -> reqwest::RequestBuilder {
        let collection = format!("{}/{}", self.base_url, mutation.entity_type);
        let item = format!("{collection}/{}", mutation.entity_id);
        let builder = match mutation.action {
            MutationAction::Create => self.request(Method::POST, collection),
            MutationAction::Update => self.request(Method::PATCH, item),
            MutationAction::Delete => return self.request(Method::DELETE, item),
        };
        builder.json(&mutation.payload)
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl ReplayHandler for RestClient {
    async fn apply(&self, mutation: &PendingMutation) -> Result<serde_json::Value, ApplyError> {
        let res = self
            .mutation_request(mutation)
            .header("Idempotency-Key", mutation.id.to_string())
            .send()
            .await
            .map_err(|err| ApplyError::Transport(err.to_string()))?;

        let status = res.status();
        if status.is_success() {
            let body = res.bytes().await.unwrap_or_default();
            if body.is_empty() {
                return Ok(serde_json::Value::Null);
            }
            return Ok(serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null));
        }
        let body = res.text().await.unwrap_or_default();
        debug!(
            target = "field.rest",
            %status,
            entity_type = %mutation.entity_type,
            entity_id = %mutation.entity_id,
            "mutation not accepted"
        );
        let message = format!("unexpected status: {status} body={body}");
        if is_transient(status) {
            Err(ApplyError::Transport(message))
        } else {
            Err(ApplyError::Rejected(message))
        }
    }
}

#[async_trait]
impl HolderDirectory for RestClient {
    async fn display_names(&self, holder_ids: &[String]) -> HashMap<String, String> {
        if holder_ids.is_empty() {
            return HashMap::new();
        }
        let url = format!("{}/profiles", self.base_url);
        let ids = holder_ids.join(",");
        let res = self
            .request(Method::GET, url)
            .query(&[("ids", ids.as_str())])
            .send()
            .await;
        let profiles = match res {
            Ok(res) if res.status().is_success() => res.json::<Vec<Profile>>().await,
            Ok(res) => {
                warn!(target = "field.rest", status = %res.status(), "profile lookup refused");
                return HashMap::new();
            }
            Err(err) => Err(err),
        };
        match profiles {
            Ok(profiles) => profiles
                .into_iter()
                .filter_map(|p| p.display_name.map(|name| (p.id, name)))
                .collect(),
            Err(err) => {
                warn!(target = "field.rest", error = %err, "profile lookup failed");
                HashMap::new()
            }
        }
    }
}

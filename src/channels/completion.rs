//! Completion channel for async tasks that carry a `wait_id`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::error::ChannelError;
use crate::tasks::TaskResponse;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Delivers a finished task's result to whoever is waiting on `wait_id`.
#[async_trait]
pub trait CompletionChannel: Send + Sync {
    async fn complete(&self, wait_id: &str, response: &TaskResponse) -> Result<(), ChannelError>;
}

/// A delivered completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub wait_id: String,
    pub response: TaskResponse,
}

/// Keeps completions in memory and fans them out to subscribers.
pub struct MemoryCompletionChannel {
    delivered: RwLock<Vec<Completion>>,
    tx: broadcast::Sender<Completion>,
}

impl MemoryCompletionChannel {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            delivered: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.tx.subscribe()
    }

    pub async fn delivered(&self) -> Vec<Completion> {
        self.delivered.read().await.clone()
    }
}

impl Default for MemoryCompletionChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionChannel for MemoryCompletionChannel {
    async fn complete(&self, wait_id: &str, response: &TaskResponse) -> Result<(), ChannelError> {
        let completion = Completion {
            wait_id: wait_id.to_string(),
            response: response.clone(),
        };
        self.delivered.write().await.push(completion.clone());
        // Ok if no receivers are listening
        let _ = self.tx.send(completion);
        debug!(wait_id, "Completion recorded");
        Ok(())
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    wait_id: &'a str,
    response: &'a TaskResponse,
}

/// POSTs completions to a webhook.
pub struct HttpCompletionChannel {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpCompletionChannel {
    pub fn new(url: String, token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
        }
    }
}

#[async_trait]
impl CompletionChannel for HttpCompletionChannel {
    async fn complete(&self, wait_id: &str, response: &TaskResponse) -> Result<(), ChannelError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&CompletionBody { wait_id, response });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request.send().await.map_err(|e| ChannelError::SendFailed {
            name: "completion".to_string(),
            reason: e.to_string(),
        })?;

        if !resp.status().is_success() {
            return Err(ChannelError::Http(format!(
                "completion webhook returned {} for wait_id {wait_id}",
                resp.status()
            )));
        }
        debug!(wait_id, "Completion delivered");
        Ok(())
    }
}

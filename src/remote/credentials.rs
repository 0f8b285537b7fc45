use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SyncResult;

/// Identity the local mutation queue and overlays are partitioned by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Storage partition key for this user.
    pub fn key(&self) -> String {
        match &self.uid {
            Some(uid) => format!("uid:{uid}"),
            None => "anonymous".to_string(),
        }
    }
}

/// Tokens attached to a stream when it is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

/// Source of auth or app-attestation tokens for the streams.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> SyncResult<Option<String>>;

    /// Called after the server rejected the current token; the next `get_token`
    /// should fetch a fresh one.
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> SyncResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

/// Provider returning a fixed token and counting invalidations.
#[derive(Default)]
pub struct StaticCredentialsProvider {
    token: Mutex<Option<String>>,
    invalidations: AtomicUsize,
}

impl StaticCredentialsProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = token;
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> SyncResult<Option<String>> {
        Ok(self.token.lock().ok().and_then(|guard| guard.clone()))
    }

    fn invalidate_token(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_keys_are_distinct() {
        assert_eq!(User::unauthenticated().key(), "anonymous");
        assert_ne!(User::new("a").key(), User::new("b").key());
    }

    #[tokio::test]
    async fn static_provider_counts_invalidations() {
        let provider = StaticCredentialsProvider::new("token-1");
        assert_eq!(provider.get_token().await.unwrap().as_deref(), Some("token-1"));
        provider.invalidate_token();
        assert_eq!(provider.invalidation_count(), 1);
    }
}

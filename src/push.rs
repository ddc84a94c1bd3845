//! Push-messaging capability.
//!
//! The bundle-generation service pushes an "operation completed" message to
//! the token handed over with each GeneratePageBundle request. Inbound
//! messages reach the pipeline through
//! [`PrefetchDispatcher::operation_completed`](crate::dispatcher::PrefetchDispatcher::operation_completed).

use async_trait::async_trait;

/// Supplies the registration token the service pushes completions to.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Returns the current token, or `None` when push is unavailable.
    async fn get_token(&self) -> Option<String>;
}

/// Hands out a fixed token from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenHandler {
    token: Option<String>,
}

impl StaticTokenHandler {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[async_trait]
impl PushHandler for StaticTokenHandler {
    async fn get_token(&self) -> Option<String> {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_is_returned() {
        let handler = StaticTokenHandler::new(Some("tok".to_string()));
        assert_eq!(handler.get_token().await.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_blank_token_counts_as_missing() {
        assert_eq!(StaticTokenHandler::new(Some("  ".to_string())).get_token().await, None);
        assert_eq!(StaticTokenHandler::default().get_token().await, None);
    }
}

//! Per-conversation mutual exclusion.
//!
//! Processing for one conversation is serialized; different conversations
//! never contend. Waiting is bounded so a stuck unit of work surfaces as a
//! retryable busy error instead of a hang.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::RoutingError;

/// Held from reading history until the reply is dispatched and recorded.
pub struct ConversationGuard {
    _guard: OwnedMutexGuard<()>,
    conversation_id: String,
}

impl ConversationGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

/// Keyed async mutexes, created on demand.
#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `conversation_id`, waiting at most `timeout`.
    pub async fn acquire(
        &self,
        conversation_id: &str,
        timeout: Duration,
    ) -> Result<ConversationGuard, RoutingError> {
        let lock = self.entry(conversation_id);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(ConversationGuard {
                _guard: guard,
                conversation_id: conversation_id.to_string(),
            }),
            Err(_) => {
                debug!(conversation_id, ?timeout, "Conversation lock wait timed out");
                Err(RoutingError::Busy {
                    conversation_id: conversation_id.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    fn entry(&self, conversation_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Drop idle entries: nobody holds or waits on a lock whose only
        // reference is the map's.
        map.retain(|key, lock| key == conversation_id || Arc::strong_count(lock) > 1);
        map.entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Number of tracked conversations (for tests and diagnostics).
    pub fn tracked(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_conversation_is_exclusive() {
        let locks = ConversationLocks::new();
        let guard = locks
            .acquire("email:a@x.com", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(guard.conversation_id(), "email:a@x.com");

        let err = locks
            .acquire("email:a@x.com", Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());

        drop(guard);
        assert!(locks.acquire("email:a@x.com", Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn different_conversations_do_not_block() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire("email:a@x.com", Duration::from_millis(50)).await.unwrap();
        let b = locks.acquire("email:b@x.com", Duration::from_millis(50)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let locks = ConversationLocks::new();
        let guard = locks.acquire("chat:s1", Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("chat:s1", Duration::from_secs(2)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = ConversationLocks::new();
        for i in 0..10 {
            let _g = locks
                .acquire(&format!("chat:{i}"), Duration::from_millis(50))
                .await
                .unwrap();
        }
        let _g = locks.acquire("chat:last", Duration::from_millis(50)).await.unwrap();
        assert_eq!(locks.tracked(), 1);
    }
}

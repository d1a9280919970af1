//! Key-value control plane used during rendezvous.
//!
//! Only two operations are needed: publish a value under a key, and wait
//! until a key has a value. Keys are written once.

mod tcp;

pub use tcp::{ControlPlaneServer, TcpControlPlane};

use futures::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::{Mutex, Notify};

use crate::error::Result;

/// Shared key-value service reachable from every machine.
pub trait ControlPlane: Send + Sync {
    /// Publish `value` under `key`, overwriting any previous value.
    fn push_kv<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Wait until `key` holds a value and return it.
    fn pull_kv<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// In-process store. Also backs [`ControlPlaneServer`].
#[derive(Default)]
pub struct LocalControlPlane {
    store: Mutex<HashMap<String, Vec<u8>>>,
    pushed: Notify,
}

impl LocalControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value under `key` without waiting.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }
}

impl ControlPlane for LocalControlPlane {
    fn push_kv<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.store
                .lock()
                .await
                .insert(key.to_owned(), value.to_vec());
            tracing::debug!(key, len = value.len(), "control plane push");
            self.pushed.notify_waiters();
            Ok(())
        })
    }

    fn pull_kv<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            loop {
                // Register interest before checking so a concurrent push
                // between the check and the await is not missed.
                let pushed = self.pushed.notified();
                tokio::pin!(pushed);
                pushed.as_mut().enable();

                if let Some(value) = self.store.lock().await.get(key) {
                    return Ok(value.clone());
                }
                pushed.await;
            }
        })
    }
}

//! The fire-and-forget inter-server retry loops used by gossip and by
//! reshard coordination. No exponential backoff: attempts retry
//! immediately, relying on the 1s per-attempt timeout to pace itself.
//!
//! The success flag is owned by an `Arc`, not a stack reference, so a late
//! response arriving after the spawning task has moved on cannot touch
//! freed memory (see `DESIGN.md`, "sendUntilSuccess" entry).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use tracing::debug;

use crate::infrastructure::view::View;

const RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared stop flag handed to every retry loop spawned for one
/// reconfiguration round.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Repeatedly PATCHes `resource` at `addr` with `body` until `on_result`
/// reports success (returns `true`) or `stop` is signalled. Detached:
/// callers do not join this task.
pub fn send_until_success<F>(view: View, addr: String, resource: String, body: String, stop: StopFlag, on_result: F)
where
    F: Fn(reqwest::StatusCode, String) -> bool + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            if stop.is_set() {
                return;
            }
            match view.send_msg(&addr, &resource, body.clone(), RPC_TIMEOUT).await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if on_result(status, text) {
                        return;
                    }
                }
                Err(err) => {
                    debug!(%addr, %resource, error = %err, "inter-server RPC failed, retrying");
                }
            }
            if stop.is_set() {
                return;
            }
        }
    });
}

/// As [`send_until_success`], but each retry advances round-robin through
/// `addresses`, wrapping, instead of always targeting the same peer.
pub fn send_to_random_node_until_success<F>(
    view: View,
    addresses: Vec<String>,
    resource: String,
    body: String,
    stop: StopFlag,
    on_result: F,
) where
    F: Fn(String, reqwest::StatusCode, String) -> bool + Send + Sync + 'static,
{
    tokio::spawn(async move {
        if addresses.is_empty() {
            return;
        }
        let mut idx = addresses
            .iter()
            .enumerate()
            .choose(&mut rand::rng())
            .map(|(i, _)| i)
            .unwrap_or(0);
        loop {
            if stop.is_set() {
                return;
            }
            let addr = &addresses[idx % addresses.len()];
            match view.send_msg(addr, &resource, body.clone(), RPC_TIMEOUT).await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if on_result(addr.clone(), status, text) {
                        return;
                    }
                }
                Err(err) => {
                    debug!(addr = %addr, %resource, error = %err, "inter-server RPC failed, retrying next peer");
                }
            }
            idx = idx.wrapping_add(1);
            if stop.is_set() {
                return;
            }
        }
    });
}

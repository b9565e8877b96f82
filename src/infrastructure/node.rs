//! The node state machine: client operations, causal-read reconciliation,
//! anti-entropy gossip, and two-phase reshard coordination. Everything
//! mutable in the process lives here or behind a handle owned here.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::core::concurrency::{ReadGuard, SwitchPermit, ViewPermit};
use crate::core::shard_scheme::{self, hash_key, ShardScheme};
use crate::core::vector_clock::{CompareValue, VectorClock};
use crate::infrastructure::datastore::{Datastore, PutOutcome};
use crate::infrastructure::retry::{send_to_random_node_until_success, send_until_success, StopFlag};
use crate::infrastructure::view::View;
use crate::infrastructure::wire::{
    decode_data_version_with_scheme, decode_gossip_blob, encode_reshard_move, DataVersion,
};

/// How often the gossip task wakes to push a dataset snapshot to a random
/// shard-mate.
const SYNC_PERIOD: Duration = Duration::from_millis(150);
/// Extra sleep applied when gossip picks itself as the target, so the loop
/// does not spin hot while waiting for a more useful peer choice.
const GOSSIP_SALT: Duration = Duration::from_millis(7);
/// Total budget for a causal GET's replica fan-out.
const GET_FANOUT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Per-attempt timeout for any single inter-server RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(1);
/// How long PREPARE/SWITCH wait after kicking off retry loops before
/// checking whether at least one node per shard has acknowledged.
const GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Errors surfaced by the four client-facing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    KeyNotValid,
    WrongSchemeVersion(i32),
    BadRequest(String),
}

/// Errors surfaced by the reshard coordination handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReshardError {
    PrepareRefused,
    SwitchRefused,
    MoveRejected,
    TooFewNodesForShardCount,
}

/// The live view plus its datastore. Swapped as a unit on SWITCH so that
/// "current data" and "current view" can never observe each other
/// mid-transition.
struct ViewState {
    view: View,
    datastore: Arc<Datastore>,
    prepared: Option<PreparedState>,
}

struct PreparedState {
    version: i32,
    view: View,
    datastore: Arc<Datastore>,
}

pub struct Node {
    view_permit: Arc<ViewPermit>,
    view_state: Mutex<ViewState>,
    view_changed: Notify,
    switch_permit: SwitchPermit,
    /// Serialises the four client-facing operations against each other so
    /// the node-clock's own counter increments strictly monotonically.
    client_op_lock: Mutex<()>,
    node_clock: Mutex<VectorClock>,
}

impl Node {
    pub fn new(my_address: String, scheme: ShardScheme, http: reqwest::Client) -> Arc<Node> {
        let view = View::new(my_address, scheme, http);
        Arc::new(Node {
            view_permit: Arc::new(ViewPermit::new()),
            view_state: Mutex::new(ViewState {
                view,
                datastore: Arc::new(Datastore::new()),
                prepared: None,
            }),
            view_changed: Notify::new(),
            switch_permit: SwitchPermit::new(),
            client_op_lock: Mutex::new(()),
            node_clock: Mutex::new(VectorClock::new()),
        })
    }

    async fn read_view(&self) -> (ReadGuard, View, Arc<Datastore>) {
        let guard = self.view_permit.acquire_read().await;
        let state = self.view_state.lock().await;
        (guard, state.view.clone(), Arc::clone(&state.datastore))
    }

    async fn write_view<R>(&self, f: impl FnOnce(&mut ViewState) -> R) -> R {
        let _guard = self.view_permit.acquire_write().await;
        let mut state = self.view_state.lock().await;
        let result = f(&mut state);
        drop(state);
        self.view_changed.notify_waiters();
        result
    }

    async fn merge_and_increment(&self, view: &View, client_clock: VectorClock) -> VectorClock {
        let mut node_clock = self.node_clock.lock().await;
        let merged = VectorClock::merge(&node_clock, &client_clock);
        let incremented = VectorClock::add(&merged, view.my_address(), 1);
        *node_clock = incremented.clone();
        incremented
    }

    // ---- client-facing operations ---------------------------------

    pub async fn put(
        &self,
        key: String,
        value: String,
        client_clock: VectorClock,
    ) -> Result<(PutOutcome, VectorClock), NodeError> {
        if key.is_empty() {
            return Err(NodeError::KeyNotValid);
        }
        let (_read_guard, view, store) = self.read_view().await;
        let _op_lock = self.client_op_lock.lock().await;
        let node_clock = self.merge_and_increment(&view, client_clock).await;
        let outcome = store.put(key, DataVersion::new(value, node_clock.clone())).await;
        Ok((outcome, node_clock))
    }

    pub async fn delete(&self, key: String, client_clock: VectorClock) -> (bool, VectorClock) {
        let (_read_guard, view, store) = self.read_view().await;
        let _op_lock = self.client_op_lock.lock().await;
        let node_clock = self.merge_and_increment(&view, client_clock).await;
        let deleted = store.delete(&key, node_clock.clone()).await;
        (deleted, node_clock)
    }

    pub async fn has(&self, key: String, client_clock: VectorClock) -> (bool, VectorClock) {
        let (_read_guard, view, store) = self.read_view().await;
        let _op_lock = self.client_op_lock.lock().await;
        let node_clock = self.merge_and_increment(&view, client_clock).await;
        let exists = store.has_live(&key).await;
        (exists, node_clock)
    }

    /// The causal read. Waits for the whole shard fan-out (bounded by
    /// `GET_FANOUT_TIMEOUT`) before reconciling, not a quorum; a peer that
    /// errors or answers with nothing simply contributes nothing, the
    /// same as a peer that has no entry for the key. Only the fan-out
    /// deadline as a whole failing to complete turns into `BadRequest`.
    pub async fn get(
        &self,
        key: String,
        client_clock: VectorClock,
    ) -> Result<(Option<String>, VectorClock), NodeError> {
        let (_read_guard, view, store) = self.read_view().await;
        let _op_lock = self.client_op_lock.lock().await;

        let mut node_clock = self.merge_and_increment(&view, client_clock.clone()).await;

        let local = store.direct_get(&key).await;
        if let Some(local_version) = &local {
            if client_clock.compare(&local_version.clock) != CompareValue::GreaterThan {
                return Ok((present_value(local_version), node_clock));
            }
        }

        let peers: Vec<String> = view.other_members_of_my_shard().into_iter().collect();
        let my_scheme_version = view.scheme().version();

        let fan_out = async {
            let mut handles = Vec::with_capacity(peers.len());
            for addr in &peers {
                let view = view.clone();
                let addr = addr.clone();
                let key = key.clone();
                handles.push(tokio::spawn(async move {
                    remote_direct_get(&view, &addr, &key, GET_FANOUT_TIMEOUT).await
                }));
            }
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(handle.await);
            }
            results
        };

        let outcomes = match tokio::time::timeout(GET_FANOUT_TIMEOUT, fan_out).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                return Err(NodeError::BadRequest(
                    "timed out waiting for shard replicas".to_string(),
                ))
            }
        };

        let mut versions: Vec<DataVersion> = Vec::new();
        if let Some(local_version) = local {
            node_clock = VectorClock::merge(&node_clock, &local_version.clock);
            versions.push(local_version);
        }

        // A single unresponsive or failed replica does not fail the read:
        // only the overall fan-out timeout above does. A peer that errors,
        // times out on its own RPC, or returns no version contributes
        // nothing, same as one that genuinely has no entry for this key.
        for outcome in outcomes {
            match outcome {
                Ok(Ok(Some((remote_version, scheme_version)))) => {
                    if scheme_version > my_scheme_version {
                        return Err(NodeError::WrongSchemeVersion(scheme_version));
                    }
                    node_clock = VectorClock::merge(&node_clock, &remote_version.clock);
                    versions.push(remote_version);
                }
                Ok(Ok(None)) | Ok(Err(())) | Err(_) => {}
            }
        }

        if versions.is_empty() {
            return Ok((None, node_clock));
        }

        let winner = VectorClock::reconcile(&versions, |d| &d.clock).clone();
        store.insert_raw(key, winner.clone()).await;

        Ok((present_value(&winner), node_clock))
    }

    pub async fn count(&self) -> usize {
        let (_read_guard, _view, store) = self.read_view().await;
        store.count_live().await
    }

    // ---- per-key forwarding ------------------------------------------

    pub async fn forward_target(&self, key: &str) -> Option<String> {
        let (_read_guard, view, _store) = self.read_view().await;
        view.forward_target(key)
    }

    // ---- membership introspection for the transport layer ------------

    pub async fn my_address(&self) -> String {
        let (_g, view, _s) = self.read_view().await;
        view.my_address().to_string()
    }

    pub async fn all_addresses(&self) -> BTreeSet<String> {
        let (_g, view, _s) = self.read_view().await;
        view.all_addresses()
    }

    pub async fn my_shard_id(&self) -> Option<usize> {
        let (_g, view, _s) = self.read_view().await;
        view.my_shard_id()
    }

    pub async fn num_shards(&self) -> usize {
        let (_g, view, _s) = self.read_view().await;
        view.scheme().num_shards()
    }

    pub async fn shard_members(&self, shard_id: usize) -> Option<BTreeSet<String>> {
        let (_g, view, _s) = self.read_view().await;
        if shard_id >= view.scheme().num_shards() {
            return None;
        }
        Some(view.scheme().shard_info(shard_id).node_set().clone())
    }

    pub async fn scheme_version(&self) -> i32 {
        let (_g, view, _s) = self.read_view().await;
        view.scheme().version()
    }

    /// Clone of the outbound RPC client, for the transport layer's own
    /// request forwarding (it has no view of its own to borrow one from).
    pub async fn http_client(&self) -> reqwest::Client {
        let (_g, view, _s) = self.read_view().await;
        view.http_client().clone()
    }

    /// Blocks (up to `timeout`) until the local scheme reaches at least
    /// `version`, or returns `false` if it times out first. Used by the
    /// transport's `WrongSchemeVersion` retry loop, which waits for local
    /// convergence rather than guessing when to retry.
    pub async fn wait_for_scheme_version(&self, version: i32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.scheme_version().await >= version {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.view_changed.notified()).await;
        }
    }

    // ---- inter-server RPC handlers ------------------------------------

    pub async fn direct_get(&self, key: &str) -> (Option<DataVersion>, i32) {
        let (_g, view, store) = self.read_view().await;
        (store.direct_get(key).await, view.scheme().version())
    }

    pub async fn sync_data(&self, blob: &str) -> Result<(), NodeError> {
        let entries = decode_gossip_blob(blob);
        if !blob.is_empty() && entries.is_empty() {
            return Err(NodeError::BadRequest("malformed gossip blob".to_string()));
        }
        let (_g, _view, store) = self.read_view().await;
        store.merge_many(entries).await;
        Ok(())
    }

    // ---- anti-entropy gossip ------------------------------------------

    pub fn spawn_gossip(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SYNC_PERIOD).await;
                let (_read_guard, view, store) = node.read_view().await;

                let Some(_my_shard) = view.my_shard_id() else {
                    continue;
                };

                let members = view.addresses_in_my_shard();
                let Some(target) = members.iter().choose(&mut rand::rng()) else {
                    continue;
                };

                if target == view.my_address() {
                    drop(_read_guard);
                    tokio::time::sleep(GOSSIP_SALT).await;
                    continue;
                }

                let target = target.clone();
                let entries = store.snapshot().await;
                let blob = crate::infrastructure::wire::encode_gossip_blob(
                    &entries.iter().map(|(k, v)| (k, v)).collect::<Vec<_>>(),
                );
                drop(_read_guard);

                if let Err(err) = view.send_msg(&target, "dataSync/push", blob, RPC_TIMEOUT).await {
                    debug!(%target, error = %err, "gossip push failed, will retry next cycle");
                }
            }
        });
    }

    // ---- reshard: scheme computation entry points ---------------------

    pub async fn propose_add_node(&self, addr: String) -> ShardScheme {
        let (_g, view, _s) = self.read_view().await;
        shard_scheme::add_node(view.scheme(), &addr)
    }

    pub async fn propose_del_node(&self, addr: String) -> ShardScheme {
        let (_g, view, _s) = self.read_view().await;
        shard_scheme::del_node(view.scheme(), &addr)
    }

    /// Refuses (`TooFewNodesForShardCount`) when `2 * num_shards` exceeds
    /// the current node count — a fault-tolerance guard that belongs on
    /// the node's reshard proposal path rather than on `ShardScheme`
    /// itself.
    pub async fn propose_reshard(&self, num_shards: usize) -> Result<ShardScheme, ReshardError> {
        let (_g, view, _s) = self.read_view().await;
        let node_count = view.scheme().num_nodes();
        if 2 * num_shards > node_count {
            return Err(ReshardError::TooFewNodesForShardCount);
        }
        Ok(shard_scheme::reshard(view.scheme(), num_shards))
    }

    // ---- reshard coordination: PREPARE + SWITCH -----------------------

    /// Drives a full two-phase reconfiguration to `new_scheme`. Returns
    /// once at least one node per shard has acknowledged SWITCH (or the
    /// scheme has zero shards, which is vacuously complete). Stragglers
    /// are left to converge via their own retry loops plus gossip.
    pub async fn coordinate_reshard(self: &Arc<Self>, new_scheme: ShardScheme) {
        let num_shards = new_scheme.num_shards();
        if num_shards == 0 {
            return;
        }

        let (_g, view, _s) = self.read_view().await;
        let scheme_body = new_scheme.serialize("");
        drop(_g);

        let stop = StopFlag::new();
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<(usize, String)>();

        for shard_id in 0..num_shards {
            for addr in new_scheme.shard_info(shard_id).node_set().iter().cloned() {
                let tx = ready_tx.clone();
                send_until_success(
                    view.clone(),
                    addr.clone(),
                    "shards/prepare".to_string(),
                    scheme_body.clone(),
                    stop.clone(),
                    move |status, _body| {
                        if status.is_success() {
                            let _ = tx.send((shard_id, addr.clone()));
                            true
                        } else {
                            false
                        }
                    },
                );
            }
        }
        drop(ready_tx);

        tokio::time::sleep(GRACE_PERIOD).await;

        let mut acked_shards: HashSet<usize> = HashSet::new();
        let mut ready_nodes: Vec<(usize, String)> = Vec::new();
        while acked_shards.len() < num_shards {
            match ready_rx.recv().await {
                Some((shard_id, addr)) => {
                    acked_shards.insert(shard_id);
                    ready_nodes.push((shard_id, addr));
                }
                None => break,
            }
        }

        info!(
            version = new_scheme.version(),
            acked_shards = acked_shards.len(),
            "PREPARE acknowledged, beginning SWITCH"
        );

        let version_body = new_scheme.version().to_string();
        let (switch_tx, mut switch_rx) = mpsc::unbounded_channel::<usize>();

        for (shard_id, addr) in ready_nodes {
            let tx = switch_tx.clone();
            send_until_success(
                view.clone(),
                addr,
                "shards/switch".to_string(),
                version_body.clone(),
                stop.clone(),
                move |status, _body| {
                    if status.is_success() {
                        let _ = tx.send(shard_id);
                        true
                    } else {
                        false
                    }
                },
            );
        }
        drop(switch_tx);

        tokio::time::sleep(GRACE_PERIOD).await;

        let mut switched_shards: HashSet<usize> = HashSet::new();
        while switched_shards.len() < acked_shards.len() {
            match switch_rx.recv().await {
                Some(shard_id) => {
                    switched_shards.insert(shard_id);
                }
                None => break,
            }
        }

        stop.signal();
        info!(version = new_scheme.version(), "reshard coordination complete");
    }

    // ---- reshard coordination: node-side handlers ----------------------

    pub async fn reshard_prepare(self: &Arc<Self>, new_scheme: ShardScheme) -> Result<(), ReshardError> {
        let switch_guard = self.switch_permit.try_acquire().ok_or(ReshardError::PrepareRefused)?;

        let my_address = self.my_address().await;
        let http = {
            let (_g, view, _s) = self.read_view().await;
            view.http_client().clone()
        };
        let version = new_scheme.version();
        let prepared_view = View::new(my_address, new_scheme, http);

        self.write_view(|state| {
            state.prepared = Some(PreparedState {
                version,
                view: prepared_view,
                datastore: Arc::new(Datastore::new()),
            });
        })
        .await;

        drop(switch_guard);
        Ok(())
    }

    pub async fn reshard_switch(self: &Arc<Self>, version: i32) -> Result<(), ReshardError> {
        let (read_guard, current_view, current_store) = self.read_view().await;

        if current_view.scheme().version() == version {
            return Ok(());
        }

        let prepared = {
            let state = self.view_state.lock().await;
            match &state.prepared {
                Some(p) if p.version == version => Some((p.view.clone(), Arc::clone(&p.datastore))),
                _ => None,
            }
        };
        let Some((prepared_view, prepared_store)) = prepared else {
            return Err(ReshardError::SwitchRefused);
        };

        let switch_guard = match self.switch_permit.try_acquire() {
            Some(guard) => guard,
            None => {
                drop(read_guard);
                self.switch_permit.wait_for_release().await;
                return Ok(());
            }
        };

        let entries = current_store.drain().await;
        let move_stop = StopFlag::new();
        let (move_tx, mut move_rx) = mpsc::unbounded_channel::<()>();
        let mut pending_moves = 0usize;

        for (key, data) in entries {
            if prepared_view.is_responsible_for_key(&key) {
                prepared_store.insert_raw(key, data).await;
                continue;
            }

            let owner_shard = prepared_view.scheme().responsible_shard_info(hash_key(&key));
            let candidates: Vec<String> = owner_shard.node_set().iter().cloned().collect();
            if candidates.is_empty() {
                warn!(%key, "reshard move has no candidate owner, dropping key");
                continue;
            }
            let body = encode_reshard_move(version, &key, &data);
            let tx = move_tx.clone();
            pending_moves += 1;
            send_to_random_node_until_success(
                prepared_view.clone(),
                candidates,
                "shards/move".to_string(),
                body,
                move_stop.clone(),
                move |_addr, status, _body| {
                    if status.is_success() {
                        let _ = tx.send(());
                        true
                    } else {
                        false
                    }
                },
            );
        }
        drop(move_tx);

        // One semaphore-like signal per moved key; wait for all of them
        // before proceeding, per the reference's per-key move bookkeeping.
        for _ in 0..pending_moves {
            move_rx.recv().await;
        }
        move_stop.signal();

        drop(read_guard);

        self.write_view(|state| {
            state.view = prepared_view;
            state.datastore = prepared_store;
            state.prepared = None;
        })
        .await;

        drop(switch_guard);
        Ok(())
    }

    pub async fn reshard_move(&self, version: i32, key: String, data: DataVersion) -> Result<(), ReshardError> {
        let (_g, current_view, current_store) = self.read_view().await;
        if current_view.scheme().version() == version {
            current_store.insert_raw(key, data).await;
            return Ok(());
        }

        let prepared_store = {
            let state = self.view_state.lock().await;
            state
                .prepared
                .as_ref()
                .filter(|p| p.version == version)
                .map(|p| Arc::clone(&p.datastore))
        };
        match prepared_store {
            Some(store) => {
                store.insert_raw(key, data).await;
                Ok(())
            }
            None => Err(ReshardError::MoveRejected),
        }
    }
}

fn present_value(data: &DataVersion) -> Option<String> {
    if data.is_tombstone() {
        None
    } else {
        Some(data.value.clone())
    }
}

async fn remote_direct_get(
    view: &View,
    addr: &str,
    key: &str,
    timeout: Duration,
) -> Result<Option<(DataVersion, i32)>, ()> {
    let response = view
        .send_msg(addr, &format!("dataStore/{key}"), String::new(), timeout)
        .await
        .map_err(|_| ())?;

    if !response.status().is_success() {
        return Err(());
    }

    let body = response.text().await.map_err(|_| ())?;
    if body.is_empty() {
        return Ok(None);
    }

    decode_data_version_with_scheme(&body).map(Some).ok_or(())
}

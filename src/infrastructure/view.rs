//! A node's point of view on the cluster: "I am address `A` under scheme
//! `S`". Read-only and cheap to clone — swapped wholesale by
//! [`crate::infrastructure::node::Node`] on every reshard SWITCH, never
//! mutated in place.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::seq::IteratorRandom;

use crate::core::shard_scheme::{hash_key, ShardScheme};

/// Inter-server RPC path prefix, mirrored by the axum router nested in
/// `transport.rs`.
pub const INTER_SERVER_PREFIX: &str = "/inter_server";

#[derive(Clone)]
pub struct View {
    my_address: String,
    scheme: ShardScheme,
    my_shard_id: Option<usize>,
    http: reqwest::Client,
}

impl View {
    pub fn new(my_address: String, scheme: ShardScheme, http: reqwest::Client) -> Self {
        let my_shard_id = scheme.shard_id_for_address(&my_address);
        View {
            my_address,
            scheme,
            my_shard_id,
            http,
        }
    }

    pub fn my_address(&self) -> &str {
        &self.my_address
    }

    pub fn scheme(&self) -> &ShardScheme {
        &self.scheme
    }

    pub fn my_shard_id(&self) -> Option<usize> {
        self.my_shard_id
    }

    pub fn is_responsible_for(&self, key_hash: u64) -> bool {
        self.my_shard_id == Some(self.scheme.responsible_shard_id(key_hash))
    }

    pub fn is_responsible_for_key(&self, key: &str) -> bool {
        self.is_responsible_for(hash_key(key))
    }

    /// The set of addresses sharing my shard, *including* me. If I am not
    /// currently a member of any shard this degenerates to `{my_address}`.
    pub fn addresses_in_my_shard(&self) -> BTreeSet<String> {
        match self.my_shard_id {
            Some(id) => self.scheme.shard_info(id).node_set().clone(),
            None => BTreeSet::from([self.my_address.clone()]),
        }
    }

    /// Every other replica in my shard (i.e. the fan-out set for a causal
    /// GET and the gossip target pool), excluding myself.
    pub fn other_members_of_my_shard(&self) -> BTreeSet<String> {
        let mut set = self.addresses_in_my_shard();
        set.remove(&self.my_address);
        set
    }

    /// All addresses known anywhere in the current scheme.
    pub fn all_addresses(&self) -> BTreeSet<String> {
        let mut all = BTreeSet::new();
        for shard_id in 0..self.scheme.num_shards() {
            all.extend(self.scheme.shard_info(shard_id).node_set().iter().cloned());
        }
        all
    }

    /// Returns `None` if I own `key` (serve locally), else a uniformly
    /// random address belonging to the shard that does.
    pub fn forward_target(&self, key: &str) -> Option<String> {
        let key_hash = hash_key(key);
        if self.is_responsible_for(key_hash) {
            return None;
        }
        let owner = self.scheme.responsible_shard_info(key_hash);
        owner.node_set().iter().choose(&mut rand::rng()).cloned()
    }

    /// Fires an inter-server PATCH at `addr` under inter-server `resource`
    /// (e.g. `"dataStore/mykey"`), bounded by `timeout`.
    pub async fn send_msg(
        &self,
        addr: &str,
        resource: &str,
        body: String,
        timeout: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("http://{addr}{INTER_SERVER_PREFIX}/{resource}");
        self.http
            .patch(&url)
            .timeout(timeout)
            .body(body)
            .send()
            .await
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shard_scheme::initial;

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[test]
    fn degenerate_singleton_when_not_a_member() {
        let scheme = initial(2, vec!["a:1".into(), "b:2".into()]);
        let view = View::new("outsider:9".into(), scheme, client());
        assert_eq!(view.my_shard_id(), None);
        assert_eq!(
            view.addresses_in_my_shard(),
            BTreeSet::from(["outsider:9".to_string()])
        );
    }

    #[test]
    fn other_members_excludes_self() {
        let scheme = initial(1, vec!["a:1".into(), "b:2".into(), "c:3".into()]);
        let view = View::new("a:1".into(), scheme, client());
        assert!(!view.other_members_of_my_shard().contains("a:1"));
        assert_eq!(view.other_members_of_my_shard().len(), 2);
    }
}

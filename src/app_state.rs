//! Process-wide shared state: just the one [`Node`], built from
//! [`Config`] at startup and handed to the transport router via
//! `axum`'s `State` extractor.

use std::sync::Arc;

use crate::config::Config;
use crate::core::shard_scheme;
use crate::infrastructure::Node;

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let scheme = shard_scheme::initial(config.num_shards, config.view.clone());
        let http = reqwest::Client::new();
        let node = Node::new(config.ip_port.clone(), scheme, http);
        AppState { node }
    }
}

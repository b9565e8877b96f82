//! Process bootstrap configuration, read once at startup from environment
//! variables: `IP_PORT`, `VIEW`, and `S` control cluster bootstrap, plus
//! this codebase's own `ServerConfig` convention for the HTTP bind
//! address.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// This node's own address, as it should appear in `ShardScheme`
    /// addresses (`host:port`). Empty means "not yet a cluster member" —
    /// the node starts outside every shard until an operator `PUT`s it
    /// into `/view`.
    pub ip_port: String,
    /// Initial cluster membership, comma-separated. Empty yields a
    /// scheme with empty shards.
    pub view: Vec<String>,
    /// Initial shard count. Floored at 1 on invalid or zero input.
    pub num_shards: usize,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let ip_port = env::var("IP_PORT").unwrap_or_default();

        let view = env::var("VIEW").unwrap_or_default();
        let view = if view.is_empty() {
            Vec::new()
        } else {
            view.split(',').map(str::to_string).collect()
        };

        let num_shards = env::var("S")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(1);

        let server = ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
        };

        Ok(Config {
            ip_port,
            view,
            num_shards,
            server,
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

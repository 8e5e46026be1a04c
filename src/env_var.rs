use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_nodes() -> usize {
    1
}

fn default_backend() -> String {
    "local".to_owned()
}

fn default_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => usize::from(n).clamp(1, 4),
        Err(_) => 2,
    }
}

fn default_heap_size() -> usize {
    1 << 30
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds for blocking waits which may indicate a deadlock, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// Number of nodes in the topology when the builder does not set one, default: 1
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// The transport backend to use
    /// local -- every node lives in this process, messages are still serialized between nodes
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Worker threads per node, default: available parallelism clamped to 1..=4
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Per-node heap capacity in bytes backing the global address space, default: 1 GiB
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("AMGAS_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}

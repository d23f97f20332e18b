use quotaguard_common::UpstreamConfig;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks the upstream server an admitted request is forwarded to, using
/// weighted round-robin.
pub struct UpstreamSelector {
    pub name: String,
    servers: Vec<String>,
    counter: AtomicUsize,
    /// Server indices repeated by weight: weights [3, 1] expand to [0, 0, 0, 1].
    weighted_indices: Vec<usize>,
}

impl UpstreamSelector {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let servers: Vec<String> = config.servers.iter().map(|s| base_url(&s.addr)).collect();

        let mut weighted_indices: Vec<usize> = config
            .servers
            .iter()
            .enumerate()
            .flat_map(|(i, s)| std::iter::repeat(i).take(s.weight as usize))
            .collect();
        if weighted_indices.is_empty() {
            // all weights zero: fall back to plain round-robin
            weighted_indices = (0..servers.len()).collect();
        }

        Self {
            name: config.name.clone(),
            servers,
            counter: AtomicUsize::new(0),
            weighted_indices,
        }
    }

    /// Base URL of the next server, such as `http://127.0.0.1:3000`.
    pub fn select(&self) -> Option<&str> {
        if self.weighted_indices.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.weighted_indices.len();
        Some(&self.servers[self.weighted_indices[idx]])
    }
}

fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

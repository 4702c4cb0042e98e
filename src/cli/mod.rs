pub mod decay;
pub mod search;
pub mod stats;

use anyhow::{Context, Result};
use persona::config::PersonaConfig;
use persona::db::Store;

/// Open both stores for a one-shot command.
fn open_store(config: &PersonaConfig) -> Result<Store> {
    Store::open(config).with_context(|| {
        format!(
            "failed to open stores at {} and {}",
            config.resolved_db_path().display(),
            config.resolved_graph_path().display()
        )
    })
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

pub(crate) fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() > max_chars {
        let cut: String = content.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        content.to_string()
    }
}

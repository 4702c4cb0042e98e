use anyhow::Result;
use chrono::Utc;

use persona::config::PersonaConfig;
use persona::memory::retrieve::{AccessMode, HitTarget, Retriever};
use persona::memory::types::Scope;

use super::{open_store, preview};

/// Read-only keyword search from the terminal. Nothing is reinforced.
pub fn search(config: &PersonaConfig, keyword: &str, conversation: Option<&str>, limit: Option<usize>) -> Result<()> {
    let store = open_store(config)?;
    let graph = store.graph()?;
    let records = store.records()?;

    let scope = conversation.map(Scope::conversation).unwrap_or(Scope::Shared);
    let limit = limit.unwrap_or(config.retrieval.default_limit);
    let retriever = Retriever::new(config.retrieval.clone());

    let hits = retriever.retrieve_by_keyword(
        &graph,
        &records,
        &scope,
        keyword,
        limit,
        AccessMode::ReadOnly,
        Utc::now(),
    )?;

    if hits.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s) in {scope}\n", hits.len());

    for (i, hit) in hits.iter().enumerate() {
        match &hit.target {
            HitTarget::Node(node) => {
                println!(
                    "  {}. [node] {} (activation: {:.2}, score: {:.4}){}",
                    i + 1,
                    node.name,
                    node.activation,
                    hit.score,
                    if node.permanent { " permanent" } else { "" },
                );
                println!("     {}", node.id);
            }
            HitTarget::Memory(memory) => {
                println!(
                    "  {}. [memory] {} (weight: {:.2}, score: {:.4})",
                    i + 1,
                    memory.id,
                    memory.weight,
                    hit.score,
                );
                println!("     {}", preview(&memory.content, 120));
            }
        }
        println!();
    }

    Ok(())
}

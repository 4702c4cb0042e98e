use anyhow::Result;

use persona::config::PersonaConfig;
use persona::memory::stats::memory_stats;

use super::{format_bytes, open_store};

/// Display memory statistics in the terminal.
pub fn stats(config: &PersonaConfig, conversation: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let graph = store.graph()?;
    let records = store.records()?;

    let response = memory_stats(&graph, &records, conversation, store.paths())?;

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    if let Some(conversation) = conversation {
        println!("  Conversation:        {conversation}");
    }
    println!("  Nodes:               {} ({} permanent)", response.nodes, response.permanent_nodes);
    println!("  Associations:        {}", response.associations);
    println!("  Memories:            {} ({} permanent)", response.memories, response.permanent_memories);
    println!("  Mean activation:     {:.3}", response.mean_activation);
    println!("  Mean weight:         {:.3}", response.mean_weight);
    println!();

    println!("Queue:");
    println!("  {:<12} {}", "pending", response.queue.pending);
    println!("  {:<12} {}", "in_flight", response.queue.in_flight);
    println!("  {:<12} {}", "processed", response.queue.processed);
    println!("  {:<12} {}", "dropped", response.queue.dropped);
    println!();

    println!("Records db size:       {}", format_bytes(response.records_db_bytes));
    println!("Graph db size:         {}", format_bytes(response.graph_db_bytes));

    if let Some(ref oldest) = response.oldest_memory {
        println!("Oldest memory:         {oldest}");
    }
    if let Some(ref newest) = response.newest_memory {
        println!("Newest memory:         {newest}");
    }

    Ok(())
}

//! CLI `decay` and `repair` commands.

use anyhow::{Context, Result};
use chrono::Utc;

use persona::config::PersonaConfig;
use persona::memory::decay::run_pass_blocking;
use persona::memory::repair;

use super::open_store;

/// Run one decay pass and print the report.
pub fn decay(config: &PersonaConfig) -> Result<()> {
    let store = open_store(config)?;
    let mut graph = store.graph()?;
    let mut records = store.records()?;

    println!("Running decay pass...");
    let report = run_pass_blocking(&mut graph, &mut records, &config.decay, Utc::now())
        .context("decay pass failed")?;

    println!(
        "  Decayed:  {} nodes, {} associations, {} memories",
        report.nodes_decayed, report.associations_decayed, report.memories_decayed
    );
    println!(
        "  Pruned:   {} nodes, {} associations, {} memories",
        report.nodes_pruned, report.associations_pruned, report.memories_pruned
    );
    if report.nodes_over_capacity > 0 || report.memories_over_capacity > 0 {
        println!(
            "  Over capacity: {} nodes, {} memories",
            report.nodes_over_capacity, report.memories_over_capacity
        );
    }
    if !report.repair.is_clean() {
        println!(
            "  Repaired: {} merged nodes, {} relinked memories, {} dangling associations, {} orphan links",
            report.repair.merged_nodes,
            report.repair.relinked,
            report.repair.dangling_associations,
            report.repair.orphan_links
        );
    }
    println!("Decay complete in {} ms.", report.duration_ms);
    Ok(())
}

/// Repair cross-store integrity without decaying anything.
pub fn repair(config: &PersonaConfig) -> Result<()> {
    let store = open_store(config)?;
    let graph = store.graph()?;
    let records = store.records()?;

    let report = repair::repair(&graph, &records).context("repair failed")?;
    if report.is_clean() {
        println!("No integrity problems found.");
    } else {
        println!("Merged duplicate nodes:     {}", report.merged_nodes);
        println!("Relinked memory links:      {}", report.relinked);
        println!("Dangling associations:      {}", report.dangling_associations);
        println!("Orphaned memory links:      {}", report.orphan_links);
    }
    Ok(())
}

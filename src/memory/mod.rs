pub mod decay;
pub mod graph;
pub mod queue;
pub mod records;
pub mod repair;
pub mod retrieve;
pub mod stats;
pub mod types;

pub mod admission;
pub mod cache;
pub mod events;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod reader;
pub mod scanner;
pub mod top_k;

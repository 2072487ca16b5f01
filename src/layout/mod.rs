pub mod engine;
pub mod treemap;

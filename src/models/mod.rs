pub mod node;
pub mod snapshot;
pub mod tree_store;

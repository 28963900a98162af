pub mod tree_builder;

pub use tree_builder::{build_forest, CommentForest, CommentNode, NestedComment};

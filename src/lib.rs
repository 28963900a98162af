// Forum Core - Threaded comments, votes and saves over a closure-table store

// Core types and primitives
pub mod core;

// Row models
pub mod models;

// Store, transactions and background work
pub mod infrastructure;

// Comment tree reconstruction
pub mod domains;

// Transactional operations
pub mod services;

// Common utilities
pub mod app_state;
pub mod config;
pub mod error;

// Re-exports for convenience
pub use error::{AppError, AppResult};

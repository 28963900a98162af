// Storage and runtime infrastructure
pub mod background;     // Post-commit background work
pub mod database;       // Store interface and transaction wrapper
pub mod sqlite_database; // SQLite implementation

pub use background::{BackgroundTasks, CommentCreated, CommentNotifier, LogNotifier};
pub use database::{within_deadline, DatabaseTransaction, ForumDatabase};
pub use sqlite_database::SqliteDatabase;

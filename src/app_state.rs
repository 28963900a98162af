use std::sync::Arc;
use tracing::info;

use crate::{
    config::Config,
    infrastructure::{BackgroundTasks, ForumDatabase, LogNotifier, SqliteDatabase},
    services::{CommentService, PostService, SaveToggle, UserActivity, VoteLedger},
};

/// Every forum service wired to one shared store
#[derive(Clone)]
pub struct AppState {
    pub database: Arc<SqliteDatabase>,
    pub comments: CommentService,
    pub votes: VoteLedger,
    pub saves: SaveToggle,
    pub posts: PostService,
    pub activity: UserActivity,
    pub background: BackgroundTasks,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        // Initialize database
        let database = SqliteDatabase::connect(&config.database).await?;
        database.initialize().await?;

        Ok(Self::with_database(Arc::new(database), config))
    }

    pub fn with_database(database: Arc<SqliteDatabase>, config: Config) -> Self {
        let db: Arc<dyn ForumDatabase> = database.clone();
        let background = BackgroundTasks::new();

        Self {
            comments: CommentService::new(db.clone(), background.clone())
                .with_notifier(Arc::new(LogNotifier)),
            votes: VoteLedger::new(db.clone()),
            saves: SaveToggle::new(db.clone()),
            posts: PostService::new(db.clone()),
            activity: UserActivity::new(db),
            database,
            background,
            config,
        }
    }

    /// Drain background work, then close the pool
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
        self.database.close().await;
        info!("forum core shut down");
    }
}

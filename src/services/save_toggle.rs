use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::{Target, UserId};
use crate::error::AppResult;
use crate::infrastructure::database::ForumDatabase;

/// Per-user bookmarks on posts and comments
#[derive(Clone)]
pub struct SaveToggle {
    db: Arc<dyn ForumDatabase>,
}

impl SaveToggle {
    pub fn new(db: Arc<dyn ForumDatabase>) -> Self {
        Self { db }
    }

    /// Bookmark `target`. Returns whether a bookmark was added.
    #[instrument(skip(self))]
    pub async fn save(&self, user_id: UserId, target: Target) -> AppResult<bool> {
        let mut tx = self.db.begin_transaction().await?;
        self.db.lock_target_tx(&mut tx, target).await?;

        let already_saved = self.db.fetch_save_exists_tx(&mut tx, user_id, target).await?;
        if !already_saved {
            self.db.insert_save_tx(&mut tx, user_id, target).await?;
        }

        tx.commit().await?;
        debug!(changed = !already_saved, "save applied");
        Ok(!already_saved)
    }

    /// Drop the bookmark on `target`. Returns whether one was removed.
    #[instrument(skip(self))]
    pub async fn unsave(&self, user_id: UserId, target: Target) -> AppResult<bool> {
        let mut tx = self.db.begin_transaction().await?;
        self.db.lock_target_tx(&mut tx, target).await?;

        let saved = self.db.fetch_save_exists_tx(&mut tx, user_id, target).await?;
        if saved {
            self.db.delete_save_tx(&mut tx, user_id, target).await?;
        }

        tx.commit().await?;
        debug!(changed = saved, "unsave applied");
        Ok(saved)
    }

    pub async fn is_saved(&self, user_id: UserId, target: Target) -> AppResult<bool> {
        let mut tx = self.db.begin_transaction().await?;
        let saved = self.db.fetch_save_exists_tx(&mut tx, user_id, target).await?;
        tx.commit().await?;
        Ok(saved)
    }
}

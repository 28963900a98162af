use std::sync::Arc;

use crate::core::UserId;
use crate::error::AppResult;
use crate::infrastructure::database::ForumDatabase;
use crate::models::{Comment, Post};

/// A user's bookmarks and positive votes, joined back to their targets.
/// Empty lists are returned as-is.
#[derive(Clone)]
pub struct UserActivity {
    db: Arc<dyn ForumDatabase>,
}

impl UserActivity {
    pub fn new(db: Arc<dyn ForumDatabase>) -> Self {
        Self { db }
    }

    pub async fn saved_comments(&self, user_id: UserId) -> AppResult<Vec<Comment>> {
        let mut tx = self.db.begin_transaction().await?;
        let comments = self.db.saved_comments_tx(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(comments)
    }

    pub async fn saved_posts(&self, user_id: UserId) -> AppResult<Vec<Post>> {
        let mut tx = self.db.begin_transaction().await?;
        let posts = self.db.saved_posts_tx(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(posts)
    }

    pub async fn liked_comments(&self, user_id: UserId) -> AppResult<Vec<Comment>> {
        let mut tx = self.db.begin_transaction().await?;
        let comments = self.db.liked_comments_tx(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(comments)
    }

    pub async fn liked_posts(&self, user_id: UserId) -> AppResult<Vec<Post>> {
        let mut tx = self.db.begin_transaction().await?;
        let posts = self.db.liked_posts_tx(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(posts)
    }
}

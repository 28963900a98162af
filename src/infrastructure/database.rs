// Database Interface - Closure store operations for the forum core
// Every operation runs inside a DatabaseTransaction and is bounded by its deadline

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::future::Future;
use tokio::time::Instant;

use crate::core::{CommentId, PostId, Score, Target, TopicId, UserId};
use crate::error::{AppError, AppResult};
use crate::models::{Comment, NewComment, NewPost, Post, SubtreeRow, Topic};

/// Transaction wrapper carrying the deadline shared by every statement in it.
/// Dropping it without `commit` rolls the transaction back.
pub struct DatabaseTransaction {
    tx: Transaction<'static, Sqlite>,
    deadline: Instant,
}

impl DatabaseTransaction {
    pub fn new(tx: Transaction<'static, Sqlite>, deadline: Instant) -> Self {
        Self { tx, deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Connection the transaction is running on
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Commit the transaction
    pub async fn commit(self) -> AppResult<()> {
        match tokio::time::timeout_at(self.deadline, self.tx.commit()).await {
            Ok(result) => result.map_err(|e| AppError::transaction("Failed to commit transaction", e)),
            Err(_) => Err(AppError::Timeout(
                "deadline exceeded while committing transaction".to_string(),
            )),
        }
    }
}

/// Run one store call against the transaction deadline, classifying failures.
pub async fn within_deadline<F, T>(deadline: Instant, context: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result.map_err(|e| AppError::from_sqlx(context, e)),
        Err(_) => Err(AppError::Timeout(format!("{}: deadline exceeded", context))),
    }
}

/// Closure-store interface consumed by the forum services.
/// Implementations translate each call directly into SQL.
#[async_trait]
pub trait ForumDatabase: Send + Sync {
    /// Open a transaction whose deadline is the configured operation timeout
    async fn begin_transaction(&self) -> AppResult<DatabaseTransaction>;

    /// Take the write lock on a vote/save target before reading its state.
    /// Fails with `NotFound` if the target does not exist.
    async fn lock_target_tx(&self, tx: &mut DatabaseTransaction, target: Target) -> AppResult<()>;

    // Comment tree reads
    async fn fetch_top_level_ids_tx(
        &self,
        tx: &mut DatabaseTransaction,
        post_id: PostId,
    ) -> AppResult<Vec<CommentId>>;
    /// Rows for every comment under the given top-level comments, in
    /// breadcrumb (preorder) order
    async fn fetch_subtree_rows_tx(
        &self,
        tx: &mut DatabaseTransaction,
        top_level_ids: &[CommentId],
    ) -> AppResult<Vec<SubtreeRow>>;
    async fn get_comment_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: CommentId,
    ) -> AppResult<Option<Comment>>;
    async fn list_comments_for_user_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
    ) -> AppResult<Vec<Comment>>;

    // Comment mutations
    async fn insert_comment_tx(
        &self,
        tx: &mut DatabaseTransaction,
        comment: &NewComment,
        now: DateTime<Utc>,
    ) -> AppResult<CommentId>;
    /// Copy the parent's ancestor edges one level deeper and add the self
    /// edge. Returns the number of edges written.
    async fn insert_closure_edges_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: CommentId,
        parent: Option<CommentId>,
    ) -> AppResult<u64>;
    /// The comment and every descendant, shallowest first
    async fn fetch_subtree_ids_tx(
        &self,
        tx: &mut DatabaseTransaction,
        root: CommentId,
    ) -> AppResult<Vec<CommentId>>;
    /// Remove the closure edges, votes, saves and rows of the given comments.
    /// Returns the number of comments removed.
    async fn delete_subtree_tx(
        &self,
        tx: &mut DatabaseTransaction,
        ids: &[CommentId],
    ) -> AppResult<u64>;
    async fn update_comment_content_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: CommentId,
        content: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    // Vote ledger
    async fn fetch_vote_score_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
    ) -> AppResult<Option<Score>>;
    async fn insert_vote_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
        score: Score,
    ) -> AppResult<()>;
    async fn update_vote_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
        score: Score,
    ) -> AppResult<()>;
    async fn adjust_likes_tx(
        &self,
        tx: &mut DatabaseTransaction,
        target: Target,
        delta: i64,
    ) -> AppResult<()>;

    // Save toggle
    async fn fetch_save_exists_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
    ) -> AppResult<bool>;
    async fn insert_save_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
    ) -> AppResult<()>;
    async fn delete_save_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
    ) -> AppResult<()>;

    // Posts and topics
    async fn create_topic_tx(&self, tx: &mut DatabaseTransaction, name: &str) -> AppResult<TopicId>;
    async fn get_topic_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: TopicId,
    ) -> AppResult<Option<Topic>>;
    async fn adjust_num_posts_tx(
        &self,
        tx: &mut DatabaseTransaction,
        topic_id: TopicId,
        delta: i64,
    ) -> AppResult<()>;
    async fn insert_post_tx(
        &self,
        tx: &mut DatabaseTransaction,
        post: &NewPost,
        now: DateTime<Utc>,
    ) -> AppResult<PostId>;
    async fn get_post_tx(&self, tx: &mut DatabaseTransaction, id: PostId) -> AppResult<Option<Post>>;
    async fn update_post_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: PostId,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;
    /// Remove a post with all of its comments, their closure edges, votes and
    /// saves. Returns the number of comments removed.
    async fn delete_post_tx(&self, tx: &mut DatabaseTransaction, id: PostId) -> AppResult<u64>;
    async fn list_posts_for_topic_tx(
        &self,
        tx: &mut DatabaseTransaction,
        topic_id: TopicId,
    ) -> AppResult<Vec<Post>>;
    async fn list_posts_tx(&self, tx: &mut DatabaseTransaction, limit: i64) -> AppResult<Vec<Post>>;
    async fn list_topics_tx(&self, tx: &mut DatabaseTransaction, limit: i64) -> AppResult<Vec<Topic>>;
    async fn adjust_num_comments_tx(
        &self,
        tx: &mut DatabaseTransaction,
        post_id: PostId,
        delta: i64,
    ) -> AppResult<()>;

    // User activity
    async fn saved_comments_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
    ) -> AppResult<Vec<Comment>>;
    async fn saved_posts_tx(&self, tx: &mut DatabaseTransaction, user_id: UserId) -> AppResult<Vec<Post>>;
    async fn liked_comments_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
    ) -> AppResult<Vec<Comment>>;
    async fn liked_posts_tx(&self, tx: &mut DatabaseTransaction, user_id: UserId) -> AppResult<Vec<Post>>;
}

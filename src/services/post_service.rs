use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::core::{PostId, Score, Target, TopicId};
use crate::error::{AppError, AppResult};
use crate::infrastructure::database::ForumDatabase;
use crate::models::{NewPost, Post, Topic};
use crate::services::vote_ledger::{apply_vote_change_tx, VoteState};

/// Listings never ask for fewer rows than this
const MIN_PAGE_SIZE: u32 = 10;

fn validate_post(title: &str, content: &str) -> AppResult<()> {
    if title.trim().is_empty() || content.trim().is_empty() {
        return Err(AppError::Validation(
            "post title and content cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Topics and the posts inside them
#[derive(Clone)]
pub struct PostService {
    db: Arc<dyn ForumDatabase>,
}

impl PostService {
    pub fn new(db: Arc<dyn ForumDatabase>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn create_topic(&self, name: &str) -> AppResult<TopicId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("topic name cannot be empty".to_string()));
        }
        let mut tx = self.db.begin_transaction().await?;
        let id = self.db.create_topic_tx(&mut tx, name).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Topics in creation order
    pub async fn list_topics(&self, limit: u32) -> AppResult<Vec<Topic>> {
        let mut tx = self.db.begin_transaction().await?;
        let topics = self
            .db
            .list_topics_tx(&mut tx, i64::from(limit.max(MIN_PAGE_SIZE)))
            .await?;
        tx.commit().await?;
        Ok(topics)
    }

    pub async fn get_topic(&self, id: TopicId) -> AppResult<Topic> {
        let mut tx = self.db.begin_transaction().await?;
        let topic = self.db.get_topic_tx(&mut tx, id).await?;
        tx.commit().await?;
        topic.ok_or_else(|| AppError::NotFound(format!("topic {} not found", id)))
    }

    /// Insert a post, count it on its topic and record the author's own like,
    /// all in one transaction.
    #[instrument(skip(self, post), fields(topic_id = %post.topic_id))]
    pub async fn create_post(&self, post: NewPost) -> AppResult<PostId> {
        validate_post(&post.title, &post.content)?;

        let mut tx = self.db.begin_transaction().await?;
        // Bumping the topic counter first takes the write lock and rejects an
        // unknown topic with NotFound.
        self.db.adjust_num_posts_tx(&mut tx, post.topic_id, 1).await?;
        let id = self.db.insert_post_tx(&mut tx, &post, Utc::now()).await?;
        apply_vote_change_tx(
            self.db.as_ref(),
            &mut tx,
            post.user_id,
            Target::post(id),
            VoteState::Unset.apply(Score::Like),
        )
        .await?;
        tx.commit().await?;

        info!(post_id = %id, "post created");
        Ok(id)
    }

    pub async fn get_post(&self, id: PostId) -> AppResult<Post> {
        let mut tx = self.db.begin_transaction().await?;
        let post = self.db.get_post_tx(&mut tx, id).await?;
        tx.commit().await?;
        post.ok_or_else(|| AppError::NotFound(format!("post {} not found", id)))
    }

    /// Replace a post's title and content and bump its `updated_at`
    #[instrument(skip(self, title, content))]
    pub async fn update_post(&self, id: PostId, title: &str, content: &str) -> AppResult<()> {
        validate_post(title, content)?;

        let mut tx = self.db.begin_transaction().await?;
        let updated = self
            .db
            .update_post_tx(&mut tx, id, title, content, Utc::now())
            .await?;
        if !updated {
            return Err(AppError::NotFound(format!("post {} not found", id)));
        }
        tx.commit().await
    }

    /// Delete a post with its whole comment forest and uncount it from its
    /// topic. Returns the number of comments removed.
    #[instrument(skip(self))]
    pub async fn delete_post(&self, id: PostId) -> AppResult<u64> {
        let mut tx = self.db.begin_transaction().await?;
        self.db.lock_target_tx(&mut tx, Target::post(id)).await?;

        let post = self
            .db
            .get_post_tx(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("post {} not found", id)))?;
        let removed = self.db.delete_post_tx(&mut tx, id).await?;
        self.db.adjust_num_posts_tx(&mut tx, post.topic_id, -1).await?;

        tx.commit().await?;
        info!(post_id = %id, topic_id = %post.topic_id, comments = removed, "post deleted");
        Ok(removed)
    }

    /// Posts of a topic, newest first
    pub async fn list_posts_for_topic(&self, topic_id: TopicId) -> AppResult<Vec<Post>> {
        let mut tx = self.db.begin_transaction().await?;
        if self.db.get_topic_tx(&mut tx, topic_id).await?.is_none() {
            return Err(AppError::NotFound(format!("topic {} not found", topic_id)));
        }
        let posts = self.db.list_posts_for_topic_tx(&mut tx, topic_id).await?;
        tx.commit().await?;
        Ok(posts)
    }

    /// Most recent posts across every topic
    pub async fn list_posts(&self, limit: u32) -> AppResult<Vec<Post>> {
        let mut tx = self.db.begin_transaction().await?;
        let posts = self
            .db
            .list_posts_tx(&mut tx, i64::from(limit.max(MIN_PAGE_SIZE)))
            .await?;
        tx.commit().await?;
        Ok(posts)
    }
}

// CommentService - Threaded comments over the closure store
// Builds a post's forest and runs comment creation/deletion as single transactions

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::core::{CommentId, PostId, Score, Target, UserId};
use crate::domains::comments::{build_forest, CommentForest};
use crate::error::{AppError, AppResult, MutationStep};
use crate::infrastructure::background::{BackgroundTasks, CommentCreated, CommentNotifier};
use crate::infrastructure::database::ForumDatabase;
use crate::models::{Comment, NewComment};
use crate::services::vote_ledger::{apply_vote_change_tx, VoteState};

#[derive(Clone)]
pub struct CommentService {
    db: Arc<dyn ForumDatabase>,
    background: BackgroundTasks,
    notifier: Option<Arc<dyn CommentNotifier>>,
}

fn step<T>(step: MutationStep, result: AppResult<T>) -> AppResult<T> {
    result.map_err(|source| AppError::StepFailed {
        step,
        source: Box::new(source),
    })
}

fn validate_content(content: &str) -> AppResult<()> {
    if content.trim().is_empty() {
        return Err(AppError::Validation("comment content cannot be empty".to_string()));
    }
    Ok(())
}

impl CommentService {
    pub fn new(db: Arc<dyn ForumDatabase>, background: BackgroundTasks) -> Self {
        Self {
            db,
            background,
            notifier: None,
        }
    }

    /// Notify `notifier` after every committed comment creation
    pub fn with_notifier(mut self, notifier: Arc<dyn CommentNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Threaded comments of a post. A post without comments yields
    /// `NoCommentsForPost`; a missing post yields `NotFound`.
    #[instrument(skip(self))]
    pub async fn build_for_post(&self, post_id: PostId) -> AppResult<CommentForest> {
        let mut tx = self.db.begin_transaction().await?;
        if self.db.get_post_tx(&mut tx, post_id).await?.is_none() {
            return Err(AppError::NotFound(format!("post {} not found", post_id)));
        }

        let top_level_ids = self.db.fetch_top_level_ids_tx(&mut tx, post_id).await?;
        if top_level_ids.is_empty() {
            return Err(AppError::NoCommentsForPost(post_id));
        }
        let rows = self.db.fetch_subtree_rows_tx(&mut tx, &top_level_ids).await?;
        tx.commit().await?;

        build_forest(post_id, rows)
    }

    /// Insert a comment with its closure edges, the author's self-like and the
    /// post's comment count in one transaction.
    #[instrument(skip(self, comment), fields(post_id = %comment.post_id, parent = ?comment.parent))]
    pub async fn create_comment(&self, comment: NewComment) -> AppResult<CommentId> {
        validate_content(&comment.content)?;

        let mut tx = self.db.begin_transaction().await?;
        // Locking the post first serializes writers on it and
        // confirms the post exists.
        self.db.lock_target_tx(&mut tx, Target::post(comment.post_id)).await?;

        if let Some(parent_id) = comment.parent {
            let parent = self
                .db
                .get_comment_tx(&mut tx, parent_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("parent comment {} not found", parent_id)))?;
            if parent.post_id != comment.post_id {
                return Err(AppError::Validation(format!(
                    "parent comment {} belongs to post {}, not {}",
                    parent_id, parent.post_id, comment.post_id
                )));
            }
        }

        let id = step(
            MutationStep::InsertComment,
            self.db.insert_comment_tx(&mut tx, &comment, Utc::now()).await,
        )?;

        let edges = step(
            MutationStep::InsertClosureEdges,
            self.db.insert_closure_edges_tx(&mut tx, id, comment.parent).await,
        )?;
        if comment.parent.is_some() && edges < 2 {
            return Err(AppError::StepFailed {
                step: MutationStep::InsertClosureEdges,
                source: Box::new(AppError::InconsistentData(format!(
                    "parent of comment {} has no closure edges",
                    id
                ))),
            });
        }

        let self_like = VoteState::Unset.apply(Score::Like);
        step(
            MutationStep::InsertSelfLike,
            apply_vote_change_tx(
                self.db.as_ref(),
                &mut tx,
                comment.user_id,
                Target::comment(id),
                self_like,
            )
            .await,
        )?;

        step(
            MutationStep::UpdatePostCounter,
            self.db.adjust_num_comments_tx(&mut tx, comment.post_id, 1).await,
        )?;

        tx.commit().await?;
        info!(comment_id = %id, depth = edges.saturating_sub(1), "comment created");

        if let Some(notifier) = &self.notifier {
            let notifier = notifier.clone();
            let event = CommentCreated {
                comment_id: id,
                post_id: comment.post_id,
                parent: comment.parent,
                author: comment.user_id,
            };
            self.background.spawn("comment notification", async move {
                notifier.comment_created(&event).await
            });
        }

        Ok(id)
    }

    /// Delete a comment together with its whole subtree. The post's comment
    /// count drops by the number of comments removed, which is returned.
    #[instrument(skip(self))]
    pub async fn delete_comment(&self, id: CommentId) -> AppResult<u64> {
        let mut tx = self.db.begin_transaction().await?;
        self.db
            .lock_target_tx(&mut tx, Target::comment(id))
            .await
            .map_err(|e| match e {
                AppError::NotFound(_) => AppError::NotFound(format!("comment {} not found", id)),
                other => other,
            })?;

        let comment = self
            .db
            .get_comment_tx(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("comment {} not found", id)))?;

        let subtree = self.db.fetch_subtree_ids_tx(&mut tx, id).await?;
        if subtree.first() != Some(&id) {
            return Err(AppError::InconsistentData(format!(
                "comment {} has no self edge",
                id
            )));
        }

        let removed = self.db.delete_subtree_tx(&mut tx, &subtree).await?;
        if removed != subtree.len() as u64 {
            warn!(
                expected = subtree.len(),
                removed,
                "subtree size differs from removed comment count"
            );
        }
        self.db
            .adjust_num_comments_tx(&mut tx, comment.post_id, -(removed as i64))
            .await?;

        tx.commit().await?;
        info!(post_id = %comment.post_id, removed, "comment subtree deleted");
        Ok(removed)
    }

    pub async fn get_comment(&self, id: CommentId) -> AppResult<Comment> {
        let mut tx = self.db.begin_transaction().await?;
        let comment = self.db.get_comment_tx(&mut tx, id).await?;
        tx.commit().await?;
        comment.ok_or_else(|| AppError::NotFound(format!("comment {} not found", id)))
    }

    /// Replace a comment's content and bump its `updated_at`
    #[instrument(skip(self, content))]
    pub async fn update_content(&self, id: CommentId, content: &str) -> AppResult<()> {
        validate_content(content)?;

        let mut tx = self.db.begin_transaction().await?;
        let updated = self
            .db
            .update_comment_content_tx(&mut tx, id, content, Utc::now())
            .await?;
        if !updated {
            return Err(AppError::NotFound(format!("comment {} not found", id)));
        }
        tx.commit().await
    }

    /// Every comment written by `user_id`, newest first
    pub async fn list_for_user(&self, user_id: UserId) -> AppResult<Vec<Comment>> {
        let mut tx = self.db.begin_transaction().await?;
        let comments = self.db.list_comments_for_user_tx(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(comments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_content_is_rejected() {
        assert!(matches!(validate_content("  \n"), Err(AppError::Validation(_))));
        assert!(validate_content("first!").is_ok());
    }

    #[test]
    fn test_step_wraps_source() {
        let err = step::<()>(
            MutationStep::InsertClosureEdges,
            Err(AppError::Timeout("slow".into())),
        )
        .unwrap_err();
        match err {
            AppError::StepFailed { step, source } => {
                assert_eq!(step, MutationStep::InsertClosureEdges);
                assert!(matches!(*source, AppError::Timeout(_)));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{CommentId, PostId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub user_id: UserId,
    pub username: String,
    pub likes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content: String,
}

/// Input for comment creation. `parent` is `None` for a top-level comment
/// replying to the post itself.
#[derive(Debug, Clone)]
pub struct NewComment {
    pub user_id: UserId,
    pub username: String,
    pub post_id: PostId,
    pub parent: Option<CommentId>,
    pub content: String,
}

/// Flattened subtree row: the comment plus the edge from its top-level
/// ancestor and the breadcrumb used to order rows into a preorder walk.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtreeRow {
    pub comment: Comment,
    pub path_length: i64,
    pub ancestor: CommentId,
    pub descendant: CommentId,
    pub breadcrumb: String,
}

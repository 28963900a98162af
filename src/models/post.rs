use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{PostId, TopicId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub num_posts: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub topic_id: TopicId,
    pub user_id: UserId,
    pub username: String,
    pub likes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub content: String,
    pub num_comments: i64,
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub user_id: UserId,
    pub username: String,
    pub topic_id: TopicId,
    pub title: String,
    pub content: String,
}

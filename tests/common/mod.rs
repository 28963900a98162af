#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use forum_core::{
    app_state::AppState,
    config::{Config, DatabaseConfig},
    core::{CommentId, PostId, UserId},
    infrastructure::SqliteDatabase,
    models::{NewComment, NewPost},
};

/// File-backed forum living in a temp directory for the length of a test
pub struct TestForum {
    pub state: AppState,
    pub url: String,
    _dir: TempDir,
}

pub async fn setup() -> TestForum {
    setup_with(|_| {}).await
}

/// Like `setup`, with a chance to tune the database config first
pub async fn setup_with(configure: impl FnOnce(&mut DatabaseConfig)) -> TestForum {
    let dir = tempfile::tempdir().expect("create temp dir");
    let url = format!("sqlite:{}", dir.path().join("forum.db").display());

    let mut database = DatabaseConfig::new(url.clone());
    database.max_connections = 8;
    configure(&mut database);
    let config = Config { database };

    let db = SqliteDatabase::connect(&config.database)
        .await
        .expect("connect to test database");
    db.initialize().await.expect("create schema");

    TestForum {
        state: AppState::with_database(Arc::new(db), config),
        url,
        _dir: dir,
    }
}

pub fn user(id: i64) -> (UserId, String) {
    (UserId(id), format!("user{}", id))
}

static TOPICS: AtomicUsize = AtomicUsize::new(0);

pub async fn seed_post(state: &AppState, author: i64) -> PostId {
    let n = TOPICS.fetch_add(1, Ordering::Relaxed);
    let topic = state
        .posts
        .create_topic(&format!("topic-{}", n))
        .await
        .expect("create topic");
    let (user_id, username) = user(author);
    state
        .posts
        .create_post(NewPost {
            user_id,
            username,
            topic_id: topic,
            title: "Closure tables".to_string(),
            content: "How do you store threaded comments?".to_string(),
        })
        .await
        .expect("create post")
}

pub fn new_comment(post_id: PostId, author: i64, parent: Option<CommentId>, content: &str) -> NewComment {
    let (user_id, username) = user(author);
    NewComment {
        user_id,
        username,
        post_id,
        parent,
        content: content.to_string(),
    }
}

pub async fn reply(
    state: &AppState,
    post_id: PostId,
    author: i64,
    parent: Option<CommentId>,
    content: &str,
) -> CommentId {
    state
        .comments
        .create_comment(new_comment(post_id, author, parent, content))
        .await
        .expect("create comment")
}

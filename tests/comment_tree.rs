mod common;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use common::{new_comment, reply, seed_post, setup, setup_with};
use sqlx::{Connection, SqliteConnection};
use forum_core::{
    core::{CommentId, PostId, Target, UserId},
    error::{AppError, MutationStep},
    infrastructure::{BackgroundTasks, CommentCreated, CommentNotifier, ForumDatabase},
    services::CommentService,
};

fn ids(forest: &forum_core::domains::comments::CommentForest, parent: usize) -> Vec<CommentId> {
    forest.children(parent).map(|node| node.comment.id).collect()
}

#[tokio::test]
async fn test_forest_follows_reply_structure() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let a = reply(state, post, 1, None, "A").await;
    let b = reply(state, post, 2, Some(a), "B").await;
    let c = reply(state, post, 3, Some(b), "C").await;
    let d = reply(state, post, 4, Some(a), "D").await;

    let forest = state.comments.build_for_post(post).await.unwrap();
    assert_eq!(forest.len(), 4);
    assert_eq!(forest.roots().len(), 1);

    let root = forest.roots()[0];
    assert_eq!(forest.node(root).comment.id, a);
    assert_eq!(forest.node(root).depth, 0);
    assert_eq!(ids(&forest, root), vec![b, d]);

    let b_index = forest.find(b).unwrap();
    assert_eq!(forest.node(b_index).depth, 1);
    assert_eq!(ids(&forest, b_index), vec![c]);
    assert_eq!(forest.node(forest.find(c).unwrap()).depth, 2);
    assert!(ids(&forest, forest.find(d).unwrap()).is_empty());

    // Every comment starts with its author's like
    assert!(forest.iter().all(|node| node.comment.likes == 1));

    let post = state.posts.get_post(post).await.unwrap();
    assert_eq!(post.num_comments, 4);
}

#[tokio::test]
async fn test_several_threads_on_one_post() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let first = reply(state, post, 1, None, "first thread").await;
    let deep = reply(state, post, 2, Some(first), "reply").await;
    let deeper = reply(state, post, 3, Some(deep), "reply to reply").await;
    let second = reply(state, post, 4, None, "second thread").await;
    let under_second = reply(state, post, 5, Some(second), "reply on second").await;

    let forest = state.comments.build_for_post(post).await.unwrap();
    let roots: Vec<_> = forest.roots().iter().map(|&i| forest.node(i).comment.id).collect();
    assert_eq!(roots, vec![first, second]);
    assert_eq!(ids(&forest, forest.find(deep).unwrap()), vec![deeper]);
    assert_eq!(ids(&forest, forest.find(second).unwrap()), vec![under_second]);

    let json = serde_json::to_value(forest.nested()).unwrap();
    assert_eq!(json[0]["children"][0]["children"][0]["content"], "reply to reply");
    assert_eq!(json[1]["children"][0]["depth"], 1);
}

#[tokio::test]
async fn test_empty_and_missing_posts_are_distinguished() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let err = state.comments.build_for_post(post).await.unwrap_err();
    assert!(matches!(err, AppError::NoCommentsForPost(id) if id == post));

    let err = state.comments.build_for_post(PostId(9_999)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_create_comment_rejects_bad_input() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;
    let other_post = seed_post(state, 2).await;
    let foreign_parent = reply(state, other_post, 2, None, "elsewhere").await;

    let err = state
        .comments
        .create_comment(new_comment(post, 1, Some(foreign_parent), "wrong thread"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = state
        .comments
        .create_comment(new_comment(post, 1, Some(CommentId(9_999)), "no parent"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = state
        .comments
        .create_comment(new_comment(PostId(9_999), 1, None, "no post"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = state
        .comments
        .create_comment(new_comment(post, 1, None, "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // Nothing from the failed attempts is visible
    let post = state.posts.get_post(post).await.unwrap();
    assert_eq!(post.num_comments, 0);
}

#[tokio::test]
async fn test_delete_removes_whole_subtree() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let a = reply(state, post, 1, None, "A").await;
    let b = reply(state, post, 2, Some(a), "B").await;
    let c = reply(state, post, 3, Some(b), "C").await;
    let d = reply(state, post, 4, Some(a), "D").await;
    let other = reply(state, post, 5, None, "unrelated").await;

    state.votes.like(UserId(7), Target::comment(c)).await.unwrap();
    state.saves.save(UserId(7), Target::comment(c)).await.unwrap();

    let removed = state.comments.delete_comment(b).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(state.posts.get_post(post).await.unwrap().num_comments, 3);

    let forest = state.comments.build_for_post(post).await.unwrap();
    assert_eq!(forest.len(), 3);
    assert!(forest.find(b).is_none());
    assert!(forest.find(c).is_none());
    assert_eq!(ids(&forest, forest.find(a).unwrap()), vec![d]);
    assert!(forest.find(other).is_some());

    assert!(matches!(
        state.comments.get_comment(c).await,
        Err(AppError::NotFound(_))
    ));

    let pool = sqlx::SqlitePool::connect(&forum.url).await.unwrap();
    let (edges,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM comment_paths WHERE ancestor IN (?, ?) OR descendant IN (?, ?)",
    )
    .bind(b.0)
    .bind(c.0)
    .bind(b.0)
    .bind(c.0)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(edges, 0);

    let (dangling,): (i64,) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM votes WHERE target_kind = 'comment' AND target_id = ?) \
         + (SELECT COUNT(*) FROM saves WHERE target_kind = 'comment' AND target_id = ?)",
    )
    .bind(c.0)
    .bind(c.0)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(dangling, 0);
    pool.close().await;

    let err = state.comments.delete_comment(b).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

async fn count(url: &str, sql: &str, id: i64) -> i64 {
    let mut conn = SqliteConnection::connect(url).await.unwrap();
    let (n,): (i64,) = sqlx::query_as(sql).bind(id).fetch_one(&mut conn).await.unwrap();
    n
}

#[tokio::test]
async fn test_failed_counter_update_rolls_back_comment() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;
    let parent = reply(state, post, 1, None, "kept").await;

    let mut admin = SqliteConnection::connect(&forum.url).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER freeze_comment_count BEFORE UPDATE OF num_comments ON posts \
         BEGIN SELECT RAISE(ABORT, 'comment count frozen'); END",
    )
    .execute(&mut admin)
    .await
    .unwrap();

    let err = state
        .comments
        .create_comment(new_comment(post, 2, Some(parent), "lost"))
        .await
        .unwrap_err();
    match err {
        AppError::StepFailed { step, .. } => assert_eq!(step, MutationStep::UpdatePostCounter),
        other => panic!("unexpected error {:?}", other),
    }

    // Only the parent's rows survive: no comment, edge or self-like of the reply
    assert_eq!(count(&forum.url, "SELECT COUNT(*) FROM comments WHERE post_id = ?", post.0).await, 1);
    assert_eq!(
        count(&forum.url, "SELECT COUNT(*) FROM comment_paths WHERE ancestor = ?", parent.0).await,
        1
    );
    assert_eq!(
        count(&forum.url, "SELECT COUNT(*) FROM votes WHERE target_kind = 'comment' AND user_id = ?", 2).await,
        0
    );

    sqlx::query("DROP TRIGGER freeze_comment_count")
        .execute(&mut admin)
        .await
        .unwrap();
    admin.close().await.unwrap();

    assert_eq!(state.posts.get_post(post).await.unwrap().num_comments, 1);
    let forest = state.comments.build_for_post(post).await.unwrap();
    assert_eq!(forest.len(), 1);
}

#[tokio::test]
async fn test_expired_deadline_leaves_no_partial_write() {
    let forum = setup_with(|db| {
        db.operation_timeout_ms = 300;
        db.busy_timeout_ms = 2_000;
    })
    .await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let mut writer = SqliteConnection::connect(&forum.url).await.unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut writer).await.unwrap();

    let err = state.votes.like(UserId(2), Target::post(post)).await.unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)), "{:?}", err);
    assert!(err.is_retryable());
    let err = state
        .comments
        .create_comment(new_comment(post, 2, None, "too late"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)), "{:?}", err);

    sqlx::query("ROLLBACK").execute(&mut writer).await.unwrap();
    writer.close().await.unwrap();

    let stored = state.posts.get_post(post).await.unwrap();
    assert_eq!(stored.likes, 1);
    assert_eq!(stored.num_comments, 0);
    assert_eq!(state.votes.score(UserId(2), Target::post(post)).await.unwrap(), None);
    assert!(matches!(
        state.comments.build_for_post(post).await,
        Err(AppError::NoCommentsForPost(_))
    ));
}

#[tokio::test]
async fn test_deleting_last_thread_leaves_no_comments() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let only = reply(state, post, 1, None, "lonely").await;
    reply(state, post, 2, Some(only), "reply").await;

    assert_eq!(state.comments.delete_comment(only).await.unwrap(), 2);
    assert_eq!(state.posts.get_post(post).await.unwrap().num_comments, 0);
    assert!(matches!(
        state.comments.build_for_post(post).await,
        Err(AppError::NoCommentsForPost(_))
    ));
}

#[tokio::test]
async fn test_update_and_list_for_user() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let first = reply(state, post, 3, None, "draft").await;
    let second = reply(state, post, 3, Some(first), "follow-up").await;
    reply(state, post, 4, None, "someone else").await;

    state.comments.update_content(first, "edited").await.unwrap();
    let edited = state.comments.get_comment(first).await.unwrap();
    assert_eq!(edited.content, "edited");
    assert!(edited.updated_at >= edited.created_at);

    assert!(matches!(
        state.comments.update_content(CommentId(9_999), "ghost").await,
        Err(AppError::NotFound(_))
    ));

    let mine: Vec<_> = state
        .comments
        .list_for_user(UserId(3))
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(mine.len(), 2);
    assert!(mine.contains(&first) && mine.contains(&second));
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<CommentCreated>>,
}

#[async_trait]
impl CommentNotifier for RecordingNotifier {
    async fn comment_created(&self, event: &CommentCreated) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct FailingNotifier;

#[async_trait]
impl CommentNotifier for FailingNotifier {
    async fn comment_created(&self, _event: &CommentCreated) -> anyhow::Result<()> {
        anyhow::bail!("mail relay down")
    }
}

#[tokio::test]
async fn test_notifier_runs_after_commit() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let db: Arc<dyn ForumDatabase> = state.database.clone();
    let background = BackgroundTasks::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let comments = CommentService::new(db, background.clone()).with_notifier(notifier.clone());

    let parent = comments.create_comment(new_comment(post, 1, None, "hi")).await.unwrap();
    let child = comments
        .create_comment(new_comment(post, 2, Some(parent), "hello"))
        .await
        .unwrap();
    background.shutdown().await;

    let events = notifier.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[1],
        CommentCreated {
            comment_id: child,
            post_id: post,
            parent: Some(parent),
            author: UserId(2),
        }
    );
}

#[tokio::test]
async fn test_notifier_failure_does_not_undo_comment() {
    let forum = setup().await;
    let state = &forum.state;
    let post = seed_post(state, 1).await;

    let db: Arc<dyn ForumDatabase> = state.database.clone();
    let background = BackgroundTasks::new();
    let comments = CommentService::new(db, background.clone()).with_notifier(Arc::new(FailingNotifier));

    let id = comments.create_comment(new_comment(post, 1, None, "still here")).await.unwrap();
    background.shutdown().await;

    assert_eq!(comments.get_comment(id).await.unwrap().content, "still here");
}

#[test]
fn test_step_names_are_readable() {
    assert_eq!(MutationStep::InsertClosureEdges.to_string(), "insert comment path");
}

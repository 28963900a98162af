use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::core::{CommentId, PostId, Score, Target, TopicId, UserId};
use crate::error::{AppError, AppResult};
use crate::infrastructure::database::{within_deadline, DatabaseTransaction, ForumDatabase};
use crate::models::{Comment, NewComment, NewPost, Post, SubtreeRow, Topic};

const COMMENT_COLUMNS: &str =
    "c.id, c.post_id, c.user_id, c.username, c.likes, c.created_at, c.updated_at, c.content";
const POST_COLUMNS: &str = "p.id, p.topic_id, p.user_id, p.username, p.likes, p.created_at, \
     p.updated_at, p.title, p.content, p.num_comments";

// Stays well under SQLITE_MAX_VARIABLE_NUMBER on every SQLite build.
const MAX_BOUND_IDS: usize = 500;

const SCHEMA: &[(&str, &str)] = &[
    (
        "topics table",
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            num_posts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "posts table",
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id INTEGER NOT NULL REFERENCES topics(id),
            user_id INTEGER NOT NULL,
            username TEXT NOT NULL,
            likes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            num_comments INTEGER NOT NULL DEFAULT 0 CHECK (num_comments >= 0)
        )
        "#,
    ),
    (
        "comments table",
        r#"
        CREATE TABLE IF NOT EXISTS comments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id INTEGER NOT NULL REFERENCES posts(id),
            user_id INTEGER NOT NULL,
            username TEXT NOT NULL,
            likes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            content TEXT NOT NULL
        )
        "#,
    ),
    (
        "comment paths table",
        r#"
        CREATE TABLE IF NOT EXISTS comment_paths (
            ancestor INTEGER NOT NULL REFERENCES comments(id),
            descendant INTEGER NOT NULL REFERENCES comments(id),
            path_length INTEGER NOT NULL CHECK (path_length >= 0),
            PRIMARY KEY (ancestor, descendant)
        )
        "#,
    ),
    (
        "votes table",
        r#"
        CREATE TABLE IF NOT EXISTS votes (
            user_id INTEGER NOT NULL,
            target_kind TEXT NOT NULL CHECK (target_kind IN ('post', 'comment')),
            target_id INTEGER NOT NULL,
            score INTEGER NOT NULL CHECK (score IN (1, -1)),
            PRIMARY KEY (user_id, target_kind, target_id)
        )
        "#,
    ),
    (
        "saves table",
        r#"
        CREATE TABLE IF NOT EXISTS saves (
            user_id INTEGER NOT NULL,
            target_kind TEXT NOT NULL CHECK (target_kind IN ('post', 'comment')),
            target_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, target_kind, target_id)
        )
        "#,
    ),
    (
        "comments post index",
        "CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id)",
    ),
    (
        "comments user index",
        "CREATE INDEX IF NOT EXISTS idx_comments_user ON comments(user_id)",
    ),
    (
        "comment paths descendant index",
        "CREATE INDEX IF NOT EXISTS idx_comment_paths_descendant ON comment_paths(descendant, path_length)",
    ),
    (
        "votes target index",
        "CREATE INDEX IF NOT EXISTS idx_votes_target ON votes(target_kind, target_id)",
    ),
    (
        "saves target index",
        "CREATE INDEX IF NOT EXISTS idx_saves_target ON saves(target_kind, target_id)",
    ),
];

/// SQLite implementation of the closure store
pub struct SqliteDatabase {
    pool: SqlitePool,
    operation_timeout: Duration,
}

impl SqliteDatabase {
    /// Open a pooled, file-backed database. WAL mode plus the busy timeout
    /// lets concurrent writers queue on the write lock instead of failing.
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| {
                AppError::Configuration(format!("Invalid database url {}: {}", config.url, e))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .idle_timeout(Some(config.idle_timeout()))
            .acquire_timeout(config.operation_timeout())
            .connect_with(options)
            .await
            .map_err(|e| AppError::from_sqlx(format!("Failed to connect to {}", config.url), e))?;

        info!(url = %config.url, max_connections = config.max_connections, "connected to forum database");
        Ok(Self {
            pool,
            operation_timeout: config.operation_timeout(),
        })
    }

    /// Single-connection in-memory database for tests
    pub async fn new_in_memory() -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AppError::Configuration(format!("Invalid in-memory url: {}", e)))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| AppError::from_sqlx("Failed to connect to in-memory SQLite", e))?;

        let db = Self {
            pool,
            operation_timeout: DatabaseConfig::default().operation_timeout(),
        };
        db.initialize().await?;
        Ok(db)
    }

    /// Create the forum tables and indexes if they are missing
    pub async fn initialize(&self) -> AppResult<()> {
        for (name, ddl) in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::from_sqlx(format!("Failed to create {}", name), e))?;
        }
        debug!(statements = SCHEMA.len(), "forum schema initialized");
        Ok(())
    }

    /// Health check to verify database connectivity
    pub async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::from_sqlx("Database health check failed", e))?;
        Ok(())
    }

    /// Get connection pool statistics (idle, total)
    pub fn pool_stats(&self) -> (u32, u32) {
        (self.pool.num_idle() as u32, self.pool.size())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn comment_from_row(row: &SqliteRow) -> Result<Comment, sqlx::Error> {
    Ok(Comment {
        id: CommentId(row.try_get("id")?),
        post_id: PostId(row.try_get("post_id")?),
        user_id: UserId(row.try_get("user_id")?),
        username: row.try_get("username")?,
        likes: row.try_get("likes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        content: row.try_get("content")?,
    })
}

fn post_from_row(row: &SqliteRow) -> Result<Post, sqlx::Error> {
    Ok(Post {
        id: PostId(row.try_get("id")?),
        topic_id: TopicId(row.try_get("topic_id")?),
        user_id: UserId(row.try_get("user_id")?),
        username: row.try_get("username")?,
        likes: row.try_get("likes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        num_comments: row.try_get("num_comments")?,
    })
}

fn topic_from_row(row: &SqliteRow) -> Result<Topic, sqlx::Error> {
    Ok(Topic {
        id: TopicId(row.try_get("id")?),
        name: row.try_get("name")?,
        num_posts: row.try_get("num_posts")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Turn the aggregated "path_length:ancestor" pairs of one comment into its
/// root-first ancestor chain.
fn parse_breadcrumb(descendant: i64, raw: &str) -> AppResult<Vec<i64>> {
    let mut crumbs = raw
        .split(',')
        .map(|pair| {
            let parsed = pair
                .split_once(':')
                .and_then(|(len, id)| Some((len.parse::<i64>().ok()?, id.parse::<i64>().ok()?)));
            parsed.ok_or_else(|| {
                AppError::InconsistentData(format!(
                    "malformed breadcrumb {:?} for comment {}",
                    raw, descendant
                ))
            })
        })
        .collect::<AppResult<Vec<(i64, i64)>>>()?;
    crumbs.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(crumbs.into_iter().map(|(_, ancestor)| ancestor).collect())
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl ForumDatabase for SqliteDatabase {
    async fn begin_transaction(&self) -> AppResult<DatabaseTransaction> {
        let deadline = Instant::now() + self.operation_timeout;
        let tx = match tokio::time::timeout_at(deadline, self.pool.begin()).await {
            Ok(result) => {
                result.map_err(|e| AppError::transaction("Failed to begin transaction", e))?
            }
            Err(_) => {
                return Err(AppError::Timeout(
                    "deadline exceeded while beginning transaction".to_string(),
                ))
            }
        };
        Ok(DatabaseTransaction::new(tx, deadline))
    }

    async fn lock_target_tx(&self, tx: &mut DatabaseTransaction, target: Target) -> AppResult<()> {
        // A no-op write as the first statement acquires the write lock,
        // so reads that follow cannot be invalidated by a concurrent writer.
        let sql = format!("UPDATE {} SET likes = likes WHERE id = ?", target.kind.table());
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to lock target",
            sqlx::query(&sql).bind(target.id).execute(tx.conn()),
        )
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("{} not found", target)));
        }
        Ok(())
    }

    async fn fetch_top_level_ids_tx(
        &self,
        tx: &mut DatabaseTransaction,
        post_id: PostId,
    ) -> AppResult<Vec<CommentId>> {
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to fetch top-level comments",
            sqlx::query(
                r#"
                SELECT c.id
                FROM comments AS c
                WHERE c.post_id = ? AND NOT EXISTS (
                    SELECT 1 FROM comment_paths AS p
                    WHERE p.descendant = c.id AND p.path_length > 0
                )
                ORDER BY c.id
                "#,
            )
            .bind(post_id.value())
            .fetch_all(tx.conn()),
        )
        .await?;

        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map(CommentId))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode top-level comment id", e))
    }

    async fn fetch_subtree_rows_tx(
        &self,
        tx: &mut DatabaseTransaction,
        top_level_ids: &[CommentId],
    ) -> AppResult<Vec<SubtreeRow>> {
        if top_level_ids.is_empty() {
            return Ok(Vec::new());
        }

        let select = format!(
            "SELECT {}, p.path_length, p.ancestor, p.descendant, \
             group_concat(crumbs.path_length || ':' || crumbs.ancestor, ',') AS crumbs \
             FROM comments AS c \
             JOIN comment_paths AS p ON c.id = p.descendant \
             JOIN comment_paths AS crumbs ON crumbs.descendant = p.descendant \
             WHERE p.ancestor IN (",
            COMMENT_COLUMNS
        );
        let deadline = tx.deadline();
        let mut rows = Vec::new();
        // Threads never overlap, so batches can be fetched apart and
        // ordered together below.
        for batch in top_level_ids.chunks(MAX_BOUND_IDS) {
            let mut qb = QueryBuilder::<Sqlite>::new(&select);
            let mut separated = qb.separated(",");
            for id in batch {
                separated.push_bind(id.value());
            }
            qb.push(") GROUP BY c.id, p.path_length, p.ancestor, p.descendant");

            let fetched = within_deadline(
                deadline,
                "Failed to fetch comment subtrees",
                qb.build().fetch_all(tx.conn()),
            )
            .await?;
            rows.extend(fetched);
        }

        let mut keyed = Vec::with_capacity(rows.len());
        for row in &rows {
            let decode = |e| AppError::from_sqlx("Failed to decode comment row", e);
            let comment = comment_from_row(row).map_err(decode)?;
            let raw: String = row.try_get("crumbs").map_err(decode)?;
            let chain = parse_breadcrumb(comment.id.value(), &raw)?;
            let subtree_row = SubtreeRow {
                path_length: row.try_get("path_length").map_err(decode)?,
                ancestor: CommentId(row.try_get("ancestor").map_err(decode)?),
                descendant: CommentId(row.try_get("descendant").map_err(decode)?),
                breadcrumb: join_ids(&chain),
                comment,
            };
            keyed.push((chain, subtree_row));
        }

        // Root-first id chains compare as a preorder walk: a node sorts
        // before its descendants, siblings by creation order.
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }

    async fn get_comment_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: CommentId,
    ) -> AppResult<Option<Comment>> {
        let sql = format!("SELECT {} FROM comments AS c WHERE c.id = ?", COMMENT_COLUMNS);
        let context = format!("Failed to get comment {}", id);
        let deadline = tx.deadline();
        let row = within_deadline(
            deadline,
            &context,
            sqlx::query(&sql).bind(id.value()).fetch_optional(tx.conn()),
        )
        .await?;
        row.as_ref()
            .map(comment_from_row)
            .transpose()
            .map_err(|e| AppError::from_sqlx(&context, e))
    }

    async fn list_comments_for_user_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
    ) -> AppResult<Vec<Comment>> {
        let sql = format!(
            "SELECT {} FROM comments AS c WHERE c.user_id = ? ORDER BY c.id DESC",
            COMMENT_COLUMNS
        );
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to list comments for user",
            sqlx::query(&sql).bind(user_id.value()).fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(comment_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode comment row", e))
    }

    async fn insert_comment_tx(
        &self,
        tx: &mut DatabaseTransaction,
        comment: &NewComment,
        now: DateTime<Utc>,
    ) -> AppResult<CommentId> {
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to insert comment",
            sqlx::query(
                "INSERT INTO comments (post_id, user_id, username, likes, created_at, updated_at, content) \
                 VALUES (?, ?, ?, 0, ?, ?, ?)",
            )
            .bind(comment.post_id.value())
            .bind(comment.user_id.value())
            .bind(&comment.username)
            .bind(now)
            .bind(now)
            .bind(&comment.content)
            .execute(tx.conn()),
        )
        .await?;
        Ok(CommentId(result.last_insert_rowid()))
    }

    async fn insert_closure_edges_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: CommentId,
        parent: Option<CommentId>,
    ) -> AppResult<u64> {
        let deadline = tx.deadline();
        let query = match parent {
            Some(parent) => sqlx::query(
                r#"
                INSERT INTO comment_paths (ancestor, descendant, path_length)
                SELECT p.ancestor, ?, p.path_length + 1
                FROM comment_paths AS p
                WHERE p.descendant = ?
                UNION ALL
                SELECT ?, ?, 0
                "#,
            )
            .bind(id.value())
            .bind(parent.value())
            .bind(id.value())
            .bind(id.value()),
            None => sqlx::query(
                "INSERT INTO comment_paths (ancestor, descendant, path_length) VALUES (?, ?, 0)",
            )
            .bind(id.value())
            .bind(id.value()),
        };
        let result =
            within_deadline(deadline, "Failed to insert comment path", query.execute(tx.conn()))
                .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_subtree_ids_tx(
        &self,
        tx: &mut DatabaseTransaction,
        root: CommentId,
    ) -> AppResult<Vec<CommentId>> {
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to fetch comment subtree",
            sqlx::query(
                "SELECT descendant FROM comment_paths WHERE ancestor = ? ORDER BY path_length, descendant",
            )
            .bind(root.value())
            .fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("descendant").map(CommentId))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode subtree id", e))
    }

    async fn delete_subtree_tx(
        &self,
        tx: &mut DatabaseTransaction,
        ids: &[CommentId],
    ) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let deadline = tx.deadline();

        // Edges go first: every edge touching the subtree has its descendant
        // inside it, and the comment rows are referenced by those edges.
        let statements = [
            ("Failed to delete comment paths", "DELETE FROM comment_paths WHERE descendant IN ("),
            (
                "Failed to delete comment votes",
                "DELETE FROM votes WHERE target_kind = 'comment' AND target_id IN (",
            ),
            (
                "Failed to delete comment saves",
                "DELETE FROM saves WHERE target_kind = 'comment' AND target_id IN (",
            ),
            ("Failed to delete comments", "DELETE FROM comments WHERE id IN ("),
        ];

        let mut removed = 0;
        for (context, prefix) in statements {
            let mut affected = 0;
            for batch in ids.chunks(MAX_BOUND_IDS) {
                let mut qb = QueryBuilder::<Sqlite>::new(prefix);
                let mut separated = qb.separated(",");
                for id in batch {
                    separated.push_bind(id.value());
                }
                qb.push(")");
                let result =
                    within_deadline(deadline, context, qb.build().execute(tx.conn())).await?;
                affected += result.rows_affected();
            }
            removed = affected;
        }
        Ok(removed)
    }

    async fn update_comment_content_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: CommentId,
        content: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to update comment",
            sqlx::query("UPDATE comments SET content = ?, updated_at = ? WHERE id = ?")
                .bind(content)
                .bind(now)
                .bind(id.value())
                .execute(tx.conn()),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_vote_score_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
    ) -> AppResult<Option<Score>> {
        let deadline = tx.deadline();
        let score: Option<i64> = within_deadline(
            deadline,
            "Failed to fetch vote",
            sqlx::query_scalar(
                "SELECT score FROM votes WHERE user_id = ? AND target_kind = ? AND target_id = ?",
            )
            .bind(user_id.value())
            .bind(target.kind.as_str())
            .bind(target.id)
            .fetch_optional(tx.conn()),
        )
        .await?;

        match score {
            None => Ok(None),
            Some(value) => Score::from_value(value).map(Some).ok_or_else(|| {
                AppError::InconsistentData(format!(
                    "vote by user {} on {} has score {}",
                    user_id, target, value
                ))
            }),
        }
    }

    async fn insert_vote_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
        score: Score,
    ) -> AppResult<()> {
        let deadline = tx.deadline();
        within_deadline(
            deadline,
            "Failed to insert vote",
            sqlx::query(
                "INSERT INTO votes (user_id, target_kind, target_id, score) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id.value())
            .bind(target.kind.as_str())
            .bind(target.id)
            .bind(score.value())
            .execute(tx.conn()),
        )
        .await?;
        Ok(())
    }

    async fn update_vote_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
        score: Score,
    ) -> AppResult<()> {
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to update vote",
            sqlx::query(
                "UPDATE votes SET score = ? WHERE user_id = ? AND target_kind = ? AND target_id = ?",
            )
            .bind(score.value())
            .bind(user_id.value())
            .bind(target.kind.as_str())
            .bind(target.id)
            .execute(tx.conn()),
        )
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "vote by user {} on {}",
                user_id, target
            )));
        }
        Ok(())
    }

    async fn adjust_likes_tx(
        &self,
        tx: &mut DatabaseTransaction,
        target: Target,
        delta: i64,
    ) -> AppResult<()> {
        let sql = format!(
            "UPDATE {} SET likes = likes + ? WHERE id = ?",
            target.kind.table()
        );
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to update like counter",
            sqlx::query(&sql).bind(delta).bind(target.id).execute(tx.conn()),
        )
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("{} not found", target)));
        }
        Ok(())
    }

    async fn fetch_save_exists_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
    ) -> AppResult<bool> {
        let deadline = tx.deadline();
        let exists: i64 = within_deadline(
            deadline,
            "Failed to check saved state",
            sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM saves WHERE user_id = ? AND target_kind = ? AND target_id = ?)",
            )
            .bind(user_id.value())
            .bind(target.kind.as_str())
            .bind(target.id)
            .fetch_one(tx.conn()),
        )
        .await?;
        Ok(exists != 0)
    }

    async fn insert_save_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
    ) -> AppResult<()> {
        let deadline = tx.deadline();
        within_deadline(
            deadline,
            "Failed to save",
            sqlx::query(
                "INSERT INTO saves (user_id, target_kind, target_id, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id.value())
            .bind(target.kind.as_str())
            .bind(target.id)
            .bind(Utc::now())
            .execute(tx.conn()),
        )
        .await?;
        Ok(())
    }

    async fn delete_save_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
        target: Target,
    ) -> AppResult<()> {
        let deadline = tx.deadline();
        within_deadline(
            deadline,
            "Failed to unsave",
            sqlx::query("DELETE FROM saves WHERE user_id = ? AND target_kind = ? AND target_id = ?")
                .bind(user_id.value())
                .bind(target.kind.as_str())
                .bind(target.id)
                .execute(tx.conn()),
        )
        .await?;
        Ok(())
    }

    async fn create_topic_tx(&self, tx: &mut DatabaseTransaction, name: &str) -> AppResult<TopicId> {
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to create topic",
            sqlx::query("INSERT INTO topics (name, num_posts, created_at) VALUES (?, 0, ?)")
                .bind(name)
                .bind(Utc::now())
                .execute(tx.conn()),
        )
        .await?;
        Ok(TopicId(result.last_insert_rowid()))
    }

    async fn get_topic_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: TopicId,
    ) -> AppResult<Option<Topic>> {
        let context = format!("Failed to get topic {}", id);
        let deadline = tx.deadline();
        let row = within_deadline(
            deadline,
            &context,
            sqlx::query("SELECT id, name, num_posts, created_at FROM topics WHERE id = ?")
                .bind(id.value())
                .fetch_optional(tx.conn()),
        )
        .await?;
        row.as_ref()
            .map(topic_from_row)
            .transpose()
            .map_err(|e| AppError::from_sqlx(&context, e))
    }

    async fn adjust_num_posts_tx(
        &self,
        tx: &mut DatabaseTransaction,
        topic_id: TopicId,
        delta: i64,
    ) -> AppResult<()> {
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to update number of posts on topic",
            sqlx::query("UPDATE topics SET num_posts = num_posts + ? WHERE id = ?")
                .bind(delta)
                .bind(topic_id.value())
                .execute(tx.conn()),
        )
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("topic {} not found", topic_id)));
        }
        Ok(())
    }

    async fn insert_post_tx(
        &self,
        tx: &mut DatabaseTransaction,
        post: &NewPost,
        now: DateTime<Utc>,
    ) -> AppResult<PostId> {
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to insert post",
            sqlx::query(
                "INSERT INTO posts (topic_id, user_id, username, likes, created_at, updated_at, title, content, num_comments) \
                 VALUES (?, ?, ?, 0, ?, ?, ?, ?, 0)",
            )
            .bind(post.topic_id.value())
            .bind(post.user_id.value())
            .bind(&post.username)
            .bind(now)
            .bind(now)
            .bind(&post.title)
            .bind(&post.content)
            .execute(tx.conn()),
        )
        .await?;
        Ok(PostId(result.last_insert_rowid()))
    }

    async fn get_post_tx(&self, tx: &mut DatabaseTransaction, id: PostId) -> AppResult<Option<Post>> {
        let sql = format!("SELECT {} FROM posts AS p WHERE p.id = ?", POST_COLUMNS);
        let context = format!("Failed to get post {}", id);
        let deadline = tx.deadline();
        let row = within_deadline(
            deadline,
            &context,
            sqlx::query(&sql).bind(id.value()).fetch_optional(tx.conn()),
        )
        .await?;
        row.as_ref()
            .map(post_from_row)
            .transpose()
            .map_err(|e| AppError::from_sqlx(&context, e))
    }

    async fn update_post_tx(
        &self,
        tx: &mut DatabaseTransaction,
        id: PostId,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to update post",
            sqlx::query("UPDATE posts SET title = ?, content = ?, updated_at = ? WHERE id = ?")
                .bind(title)
                .bind(content)
                .bind(now)
                .bind(id.value())
                .execute(tx.conn()),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_post_tx(&self, tx: &mut DatabaseTransaction, id: PostId) -> AppResult<u64> {
        let deadline = tx.deadline();

        // Everything hanging off the post's comments goes before the comments.
        let dependents = [
            (
                "Failed to delete comment paths of post",
                "DELETE FROM comment_paths WHERE descendant IN (SELECT id FROM comments WHERE post_id = ?)",
            ),
            (
                "Failed to delete comment votes of post",
                "DELETE FROM votes WHERE target_kind = 'comment' \
                 AND target_id IN (SELECT id FROM comments WHERE post_id = ?)",
            ),
            (
                "Failed to delete comment saves of post",
                "DELETE FROM saves WHERE target_kind = 'comment' \
                 AND target_id IN (SELECT id FROM comments WHERE post_id = ?)",
            ),
            (
                "Failed to delete post votes",
                "DELETE FROM votes WHERE target_kind = 'post' AND target_id = ?",
            ),
            (
                "Failed to delete post saves",
                "DELETE FROM saves WHERE target_kind = 'post' AND target_id = ?",
            ),
        ];
        for (context, sql) in dependents {
            within_deadline(
                deadline,
                context,
                sqlx::query(sql).bind(id.value()).execute(tx.conn()),
            )
            .await?;
        }

        let comments = within_deadline(
            deadline,
            "Failed to delete comments of post",
            sqlx::query("DELETE FROM comments WHERE post_id = ?")
                .bind(id.value())
                .execute(tx.conn()),
        )
        .await?;

        let post = within_deadline(
            deadline,
            "Failed to delete post",
            sqlx::query("DELETE FROM posts WHERE id = ?")
                .bind(id.value())
                .execute(tx.conn()),
        )
        .await?;
        if post.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("post {} not found", id)));
        }
        Ok(comments.rows_affected())
    }

    async fn list_posts_for_topic_tx(
        &self,
        tx: &mut DatabaseTransaction,
        topic_id: TopicId,
    ) -> AppResult<Vec<Post>> {
        let sql = format!(
            "SELECT {} FROM posts AS p WHERE p.topic_id = ? ORDER BY p.id DESC",
            POST_COLUMNS
        );
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to list posts for topic",
            sqlx::query(&sql).bind(topic_id.value()).fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(post_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode post row", e))
    }

    async fn list_posts_tx(&self, tx: &mut DatabaseTransaction, limit: i64) -> AppResult<Vec<Post>> {
        let sql = format!("SELECT {} FROM posts AS p ORDER BY p.id DESC LIMIT ?", POST_COLUMNS);
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to list posts",
            sqlx::query(&sql).bind(limit).fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(post_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode post row", e))
    }

    async fn list_topics_tx(&self, tx: &mut DatabaseTransaction, limit: i64) -> AppResult<Vec<Topic>> {
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to list topics",
            sqlx::query("SELECT id, name, num_posts, created_at FROM topics ORDER BY id LIMIT ?")
                .bind(limit)
                .fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(topic_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode topic row", e))
    }

    async fn adjust_num_comments_tx(
        &self,
        tx: &mut DatabaseTransaction,
        post_id: PostId,
        delta: i64,
    ) -> AppResult<()> {
        let deadline = tx.deadline();
        let result = within_deadline(
            deadline,
            "Failed to update number of comments on post",
            sqlx::query("UPDATE posts SET num_comments = num_comments + ? WHERE id = ?")
                .bind(delta)
                .bind(post_id.value())
                .execute(tx.conn()),
        )
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("post {} not found", post_id)));
        }
        Ok(())
    }

    async fn saved_comments_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
    ) -> AppResult<Vec<Comment>> {
        let sql = format!(
            "SELECT {} FROM saves AS s JOIN comments AS c ON s.target_id = c.id \
             WHERE s.user_id = ? AND s.target_kind = 'comment' ORDER BY s.created_at DESC, c.id DESC",
            COMMENT_COLUMNS
        );
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to fetch saved comments",
            sqlx::query(&sql).bind(user_id.value()).fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(comment_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode saved comment", e))
    }

    async fn saved_posts_tx(&self, tx: &mut DatabaseTransaction, user_id: UserId) -> AppResult<Vec<Post>> {
        let sql = format!(
            "SELECT {} FROM saves AS s JOIN posts AS p ON s.target_id = p.id \
             WHERE s.user_id = ? AND s.target_kind = 'post' ORDER BY s.created_at DESC, p.id DESC",
            POST_COLUMNS
        );
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to fetch saved posts",
            sqlx::query(&sql).bind(user_id.value()).fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(post_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode saved post", e))
    }

    async fn liked_comments_tx(
        &self,
        tx: &mut DatabaseTransaction,
        user_id: UserId,
    ) -> AppResult<Vec<Comment>> {
        let sql = format!(
            "SELECT {} FROM votes AS v JOIN comments AS c ON v.target_id = c.id \
             WHERE v.user_id = ? AND v.target_kind = 'comment' AND v.score = 1 ORDER BY c.id DESC",
            COMMENT_COLUMNS
        );
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to fetch liked comments",
            sqlx::query(&sql).bind(user_id.value()).fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(comment_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode liked comment", e))
    }

    async fn liked_posts_tx(&self, tx: &mut DatabaseTransaction, user_id: UserId) -> AppResult<Vec<Post>> {
        let sql = format!(
            "SELECT {} FROM votes AS v JOIN posts AS p ON v.target_id = p.id \
             WHERE v.user_id = ? AND v.target_kind = 'post' AND v.score = 1 ORDER BY p.id DESC",
            POST_COLUMNS
        );
        let deadline = tx.deadline();
        let rows = within_deadline(
            deadline,
            "Failed to fetch liked posts",
            sqlx::query(&sql).bind(user_id.value()).fetch_all(tx.conn()),
        )
        .await?;
        rows.iter()
            .map(post_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::from_sqlx("Failed to decode liked post", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_breadcrumb_orders_root_first() {
        let chain = parse_breadcrumb(9, "0:9,2:1,1:4").unwrap();
        assert_eq!(chain, vec![1, 4, 9]);
        assert_eq!(join_ids(&chain), "1,4,9");
    }

    #[test]
    fn test_parse_breadcrumb_rejects_garbage() {
        assert!(matches!(
            parse_breadcrumb(3, "0:3,x"),
            Err(AppError::InconsistentData(_))
        ));
    }

    #[tokio::test]
    async fn test_closure_edges_for_reply() {
        let db = SqliteDatabase::new_in_memory().await.unwrap();
        let mut tx = db.begin_transaction().await.unwrap();
        let topic = db.create_topic_tx(&mut tx, "rust").await.unwrap();
        let post = db
            .insert_post_tx(
                &mut tx,
                &NewPost {
                    user_id: UserId(1),
                    username: "ada".into(),
                    topic_id: topic,
                    title: "t".into(),
                    content: "c".into(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let new_comment = |parent| NewComment {
            user_id: UserId(1),
            username: "ada".into(),
            post_id: post,
            parent,
            content: "hi".into(),
        };
        let root = db
            .insert_comment_tx(&mut tx, &new_comment(None), Utc::now())
            .await
            .unwrap();
        assert_eq!(db.insert_closure_edges_tx(&mut tx, root, None).await.unwrap(), 1);

        let child = db
            .insert_comment_tx(&mut tx, &new_comment(Some(root)), Utc::now())
            .await
            .unwrap();
        assert_eq!(db.insert_closure_edges_tx(&mut tx, child, Some(root)).await.unwrap(), 2);

        let grandchild = db
            .insert_comment_tx(&mut tx, &new_comment(Some(child)), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            db.insert_closure_edges_tx(&mut tx, grandchild, Some(child)).await.unwrap(),
            3
        );

        assert_eq!(db.fetch_top_level_ids_tx(&mut tx, post).await.unwrap(), vec![root]);
        assert_eq!(
            db.fetch_subtree_ids_tx(&mut tx, child).await.unwrap(),
            vec![child, grandchild]
        );

        let rows = db.fetch_subtree_rows_tx(&mut tx, &[root]).await.unwrap();
        let depths: Vec<i64> = rows.iter().map(|r| r.path_length).collect();
        assert_eq!(depths, vec![0, 1, 2]);
        assert_eq!(
            rows[2].breadcrumb,
            format!("{},{},{}", root, child, grandchild)
        );
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_wide_forest_is_fetched_and_deleted_in_batches() {
        let db = SqliteDatabase::new_in_memory().await.unwrap();
        let mut tx = db.begin_transaction().await.unwrap();
        let topic = db.create_topic_tx(&mut tx, "busy").await.unwrap();
        let post = db
            .insert_post_tx(
                &mut tx,
                &NewPost {
                    user_id: UserId(1),
                    username: "ada".into(),
                    topic_id: topic,
                    title: "t".into(),
                    content: "c".into(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let count = MAX_BOUND_IDS * 2 + 7;
        for _ in 0..count {
            let id = db
                .insert_comment_tx(
                    &mut tx,
                    &NewComment {
                        user_id: UserId(2),
                        username: "bob".into(),
                        post_id: post,
                        parent: None,
                        content: "+1".into(),
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
            db.insert_closure_edges_tx(&mut tx, id, None).await.unwrap();
        }

        let top_level = db.fetch_top_level_ids_tx(&mut tx, post).await.unwrap();
        assert_eq!(top_level.len(), count);

        let rows = db.fetch_subtree_rows_tx(&mut tx, &top_level).await.unwrap();
        let ids: Vec<CommentId> = rows.iter().map(|r| r.comment.id).collect();
        assert_eq!(ids, top_level);

        let removed = db.delete_subtree_tx(&mut tx, &top_level).await.unwrap();
        assert_eq!(removed, count as u64);
        assert!(db.fetch_top_level_ids_tx(&mut tx, post).await.unwrap().is_empty());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_missing_target_is_not_found() {
        let db = SqliteDatabase::new_in_memory().await.unwrap();
        let mut tx = db.begin_transaction().await.unwrap();
        let err = db
            .lock_target_tx(&mut tx, Target::comment(CommentId(42)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}

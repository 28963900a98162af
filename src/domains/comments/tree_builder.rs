// Comment Tree Builder - Rebuilds a post's threaded comments from closure rows
// Rows arrive in breadcrumb order, so a single pass with an ancestor stack suffices

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::core::{CommentId, PostId, UserId};
use crate::error::{AppError, AppResult};
use crate::models::{Comment, SubtreeRow};

/// A comment placed in the forest. Children are arena indices in row order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub comment: Comment,
    pub depth: usize,
    children: Vec<usize>,
}

impl CommentNode {
    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

/// Arena-backed comment forest. Nodes are owned by the arena and refer to
/// each other by index; `roots` lists the top-level comments in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentForest {
    nodes: Vec<CommentNode>,
    roots: Vec<usize>,
}

impl CommentForest {
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn node(&self, index: usize) -> &CommentNode {
        &self.nodes[index]
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &CommentNode> + '_ {
        self.nodes[index].children.iter().map(move |&child| &self.nodes[child])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Arena index of a comment
    pub fn find(&self, id: CommentId) -> Option<usize> {
        self.nodes.iter().position(|node| node.comment.id == id)
    }

    /// Nodes in preorder, which is also the order the rows arrived in
    pub fn iter(&self) -> impl Iterator<Item = &CommentNode> {
        self.nodes.iter()
    }

    /// Owned-children view for templates and JSON rendering
    pub fn nested(&self) -> Vec<NestedComment<'_>> {
        self.roots.iter().map(|&root| self.nest(root)).collect()
    }

    fn nest(&self, index: usize) -> NestedComment<'_> {
        let node = &self.nodes[index];
        NestedComment {
            id: node.comment.id,
            post_id: node.comment.post_id,
            user_id: node.comment.user_id,
            username: &node.comment.username,
            content: &node.comment.content,
            likes: node.comment.likes,
            created_at: node.comment.created_at,
            updated_at: node.comment.updated_at,
            depth: node.depth,
            children: node.children.iter().map(|&child| self.nest(child)).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NestedComment<'a> {
    pub id: CommentId,
    pub post_id: PostId,
    pub user_id: UserId,
    pub username: &'a str,
    pub content: &'a str,
    pub likes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub depth: usize,
    pub children: Vec<NestedComment<'a>>,
}

/// Build the comment forest for `post_id` from rows in breadcrumb order.
///
/// `path_length` is the row's depth below its top-level comment. The stack
/// holds the chain from the current top-level comment down to the previous
/// row, so before attaching a row at depth `d` the stack is cut back to its
/// `d` ancestors: nothing is popped when descending, one entry for a sibling,
/// and `current_depth - d + 1` entries when climbing back out of a subtree.
///
/// An empty row set is `NoCommentsForPost`, never an empty forest.
pub fn build_forest(post_id: PostId, rows: Vec<SubtreeRow>) -> AppResult<CommentForest> {
    if rows.is_empty() {
        return Err(AppError::NoCommentsForPost(post_id));
    }

    let mut forest = CommentForest {
        nodes: Vec::with_capacity(rows.len()),
        roots: Vec::new(),
    };
    let mut stack: Vec<usize> = Vec::new();
    let mut current_depth = 0usize;
    let mut seen = HashSet::with_capacity(rows.len());

    for row in rows {
        let id = row.comment.id;
        if row.comment.post_id != post_id {
            return Err(AppError::InconsistentData(format!(
                "comment {} belongs to post {}, not {}",
                id, row.comment.post_id, post_id
            )));
        }
        if !seen.insert(id) {
            return Err(AppError::InconsistentData(format!(
                "comment {} appears twice in post {}",
                id, post_id
            )));
        }
        let depth = usize::try_from(row.path_length).map_err(|_| {
            AppError::InconsistentData(format!(
                "comment {} has negative path length {}",
                id, row.path_length
            ))
        })?;

        let parent = if depth == 0 {
            if row.ancestor != id {
                return Err(AppError::InconsistentData(format!(
                    "top-level comment {} reported under ancestor {}",
                    id, row.ancestor
                )));
            }
            stack.clear();
            None
        } else {
            if depth > current_depth + 1 {
                return Err(AppError::InconsistentData(format!(
                    "comment {} at depth {} skips a level below depth {}",
                    id, depth, current_depth
                )));
            }
            let pops = current_depth + 1 - depth;
            stack.truncate(stack.len().saturating_sub(pops));
            let parent = *stack.last().ok_or_else(|| {
                AppError::InconsistentData(format!(
                    "comment {} at depth {} has no preceding top-level comment",
                    id, depth
                ))
            })?;
            let root = &forest.nodes[stack[0]].comment;
            if root.id != row.ancestor {
                return Err(AppError::InconsistentData(format!(
                    "comment {} belongs under {} but follows {}",
                    id, row.ancestor, root.id
                )));
            }
            Some(parent)
        };

        let index = forest.nodes.len();
        forest.nodes.push(CommentNode {
            comment: row.comment,
            depth,
            children: Vec::new(),
        });
        match parent {
            Some(parent) => forest.nodes[parent].children.push(index),
            None => forest.roots.push(index),
        }
        stack.push(index);
        current_depth = depth;
    }

    debug!(
        post_id = %post_id,
        comments = forest.len(),
        threads = forest.roots.len(),
        "built comment forest"
    );
    Ok(forest)
}

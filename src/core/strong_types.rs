// Strong Types - Newtype identifiers and vote/save vocabulary for the forum core
// Keeps user, post and comment ids from being mixed up at call sites

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! forum_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the raw ID value
            pub fn value(self) -> i64 {
                self.0
            }

            /// Database ids start at 1
            pub fn is_valid(self) -> bool {
                self.0 > 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

forum_id!(
    /// Registered user
    UserId
);
forum_id!(
    /// Forum topic (board) that posts live in
    TopicId
);
forum_id!(
    /// Top-level post that comments hang under
    PostId
);
forum_id!(
    /// Comment anywhere in a post's thread
    CommentId
);

/// Kind of entity a vote or bookmark points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Post,
    Comment,
}

impl TargetKind {
    /// Value stored in the `target_kind` column
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Post => "post",
            TargetKind::Comment => "comment",
        }
    }

    /// Table carrying the denormalized `likes` counter for this kind
    pub fn table(self) -> &'static str {
        match self {
            TargetKind::Post => "posts",
            TargetKind::Comment => "comments",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A votable / saveable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub kind: TargetKind,
}

impl Target {
    pub fn post(id: PostId) -> Self {
        Self { id: id.value(), kind: TargetKind::Post }
    }

    pub fn comment(id: CommentId) -> Self {
        Self { id: id.value(), kind: TargetKind::Comment }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Stored vote. Zero is never persisted; an absent record means no vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Score {
    Like,
    Dislike,
}

impl Score {
    pub fn value(self) -> i64 {
        match self {
            Score::Like => 1,
            Score::Dislike => -1,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(Score::Like),
            -1 => Some(Score::Dislike),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_operations() {
        let id = CommentId::new(123);
        assert_eq!(id.value(), 123);
        assert!(id.is_valid());
        assert!(!PostId::new(0).is_valid());
        assert_eq!(i64::from(UserId::from(9)), 9);
    }

    #[test]
    fn test_target_formatting() {
        assert_eq!(Target::comment(CommentId(4)).to_string(), "comment:4");
        assert_eq!(Target::post(PostId(2)).kind.table(), "posts");
    }

    #[test]
    fn test_score_values() {
        assert_eq!(Score::from_value(1), Some(Score::Like));
        assert_eq!(Score::from_value(-1), Some(Score::Dislike));
        assert_eq!(Score::from_value(0), None);
        assert_eq!(Score::Dislike.value(), -1);
    }
}

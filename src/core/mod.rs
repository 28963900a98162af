// Core types and primitives shared by the store and the services

pub mod strong_types;

pub use strong_types::{CommentId, PostId, Score, Target, TargetKind, TopicId, UserId};

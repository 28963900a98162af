// Forum records as they come out of the relational store

pub mod comment;
pub mod post;

pub use comment::{Comment, NewComment, SubtreeRow};
pub use post::{NewPost, Post, Topic};

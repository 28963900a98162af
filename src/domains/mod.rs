// Domain-Driven Organization - pure forum logic with no storage dependency

pub mod comments;

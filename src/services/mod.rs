// Forum services - transactional operations over the forum store
pub mod comment_service;
pub mod post_service;
pub mod save_toggle;
pub mod user_activity;
pub mod vote_ledger;

pub use comment_service::CommentService;
pub use post_service::PostService;
pub use save_toggle::SaveToggle;
pub use user_activity::UserActivity;
pub use vote_ledger::{VoteChange, VoteLedger, VoteState};

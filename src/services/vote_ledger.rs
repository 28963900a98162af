// Vote Ledger - Idempotent like/dislike with the denormalized likes counter
// Each toggle locks its target first so concurrent voters serialize

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::{Score, Target, UserId};
use crate::error::AppResult;
use crate::infrastructure::database::{DatabaseTransaction, ForumDatabase};

/// What a user currently has recorded against a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteState {
    Unset,
    Liked,
    Disliked,
}

impl From<Option<Score>> for VoteState {
    fn from(score: Option<Score>) -> Self {
        match score {
            None => VoteState::Unset,
            Some(Score::Like) => VoteState::Liked,
            Some(Score::Dislike) => VoteState::Disliked,
        }
    }
}

/// Write a vote needs, with the matching counter delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteChange {
    Insert { score: Score, delta: i64 },
    Update { score: Score, delta: i64 },
    Unchanged,
}

impl VoteChange {
    pub fn delta(self) -> i64 {
        match self {
            VoteChange::Insert { delta, .. } | VoteChange::Update { delta, .. } => delta,
            VoteChange::Unchanged => 0,
        }
    }
}

impl VoteState {
    /// Transition table. Repeating the current vote changes nothing, and a
    /// flip moves the counter by two.
    pub fn apply(self, vote: Score) -> VoteChange {
        match (self, vote) {
            (VoteState::Unset, score) => VoteChange::Insert {
                score,
                delta: score.value(),
            },
            (VoteState::Liked, Score::Like) | (VoteState::Disliked, Score::Dislike) => {
                VoteChange::Unchanged
            }
            (VoteState::Liked, Score::Dislike) | (VoteState::Disliked, Score::Like) => {
                VoteChange::Update {
                    score: vote,
                    delta: 2 * vote.value(),
                }
            }
        }
    }
}

/// Persist a vote change and move the target's counter inside `tx`
pub(crate) async fn apply_vote_change_tx(
    db: &dyn ForumDatabase,
    tx: &mut DatabaseTransaction,
    user_id: UserId,
    target: Target,
    change: VoteChange,
) -> AppResult<()> {
    match change {
        VoteChange::Insert { score, delta } => {
            db.insert_vote_tx(tx, user_id, target, score).await?;
            db.adjust_likes_tx(tx, target, delta).await
        }
        VoteChange::Update { score, delta } => {
            db.update_vote_tx(tx, user_id, target, score).await?;
            db.adjust_likes_tx(tx, target, delta).await
        }
        VoteChange::Unchanged => Ok(()),
    }
}

#[derive(Clone)]
pub struct VoteLedger {
    db: Arc<dyn ForumDatabase>,
}

impl VoteLedger {
    pub fn new(db: Arc<dyn ForumDatabase>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn like(&self, user_id: UserId, target: Target) -> AppResult<VoteChange> {
        self.cast(user_id, target, Score::Like).await
    }

    #[instrument(skip(self))]
    pub async fn dislike(&self, user_id: UserId, target: Target) -> AppResult<VoteChange> {
        self.cast(user_id, target, Score::Dislike).await
    }

    /// Current vote of `user_id` on `target`
    pub async fn score(&self, user_id: UserId, target: Target) -> AppResult<Option<Score>> {
        let mut tx = self.db.begin_transaction().await?;
        let score = self.db.fetch_vote_score_tx(&mut tx, user_id, target).await?;
        tx.commit().await?;
        Ok(score)
    }

    async fn cast(&self, user_id: UserId, target: Target, vote: Score) -> AppResult<VoteChange> {
        let mut tx = self.db.begin_transaction().await?;

        // Lock before reading so two first votes cannot both see "absent".
        self.db.lock_target_tx(&mut tx, target).await?;
        let current = VoteState::from(self.db.fetch_vote_score_tx(&mut tx, user_id, target).await?);
        let change = current.apply(vote);
        apply_vote_change_tx(self.db.as_ref(), &mut tx, user_id, target, change).await?;

        tx.commit().await?;
        debug!(?current, ?change, "vote recorded");
        Ok(change)
    }
}

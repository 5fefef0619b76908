use std::collections::HashMap;
use tokio::sync::{Mutex, oneshot};

/// A paused count waiting for someone to pick among the tied options.
#[derive(Debug)]
pub struct PendingTie {
    // (option id, candidate index in the count)
    candidates: Vec<(String, usize)>,
    reply: oneshot::Sender<usize>,
}

impl PendingTie {
    pub fn candidate_for(&self, option_id: &str) -> Option<usize> {
        self.candidates
            .iter()
            .find(|(id, _)| id == option_id)
            .map(|(_, candidate)| *candidate)
    }

    /// Hands the decision to the waiting count. False if the count is gone.
    pub fn answer(self, candidate: usize) -> bool {
        self.reply.send(candidate).is_ok()
    }
}

/// One slot per paused vote. Taking the slot is what makes a resolution
/// happen at most once.
#[derive(Debug, Default)]
pub struct TieBreakCoordinator {
    pending: Mutex<HashMap<String, PendingTie>>,
}

impl TieBreakCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        vote_id: &str,
        candidates: Vec<(String, usize)>,
    ) -> oneshot::Receiver<usize> {
        let (reply, decision) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(vote_id.to_string(), PendingTie { candidates, reply });
        decision
    }

    pub async fn take(&self, vote_id: &str) -> Option<PendingTie> {
        self.pending.lock().await.remove(vote_id)
    }

    /// Puts back a slot taken by a resolution that could not go through.
    pub async fn restore(&self, vote_id: &str, pending: PendingTie) {
        self.pending.lock().await.insert(vote_id.to_string(), pending);
    }

    /// Drops the slot, which wakes the waiting count with an error.
    pub async fn forget(&self, vote_id: &str) {
        self.pending.lock().await.remove(vote_id);
    }
}

//! Warteschlange für ICE Candidates, die vor der Remote Description eintreffen

use super::transport::IceCandidate;
use std::collections::VecDeque;

/// FIFO für noch nicht anwendbare Candidates
///
/// Wird genau einmal geleert, direkt nachdem die Remote Description gesetzt
/// wurde. Danach werden Candidates sofort angewendet.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    flushed: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hängt einen Candidate an und gibt die neue Länge zurück
    pub fn push(&mut self, candidate: IceCandidate) -> usize {
        self.pending.push_back(candidate);
        self.pending.len()
    }

    /// Entnimmt alle Candidates in Ankunftsreihenfolge
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.flushed = true;
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Ob der Flush nach der Remote Description schon stattgefunden hat
    pub fn was_flushed(&self) -> bool {
        self.flushed
    }
}

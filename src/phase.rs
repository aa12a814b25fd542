use serde::{Deserialize, Serialize};

/// One stage of a repository's transfer protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Everything the repository holds when the run reaches it.
    Full,
    /// Units created or modified after phase 1 began.
    Diff,
    /// Units recorded in the retry ledger.
    Retry,
}

impl Phase {
    pub fn number(self) -> u8 {
        match self {
            Phase::Full => 1,
            Phase::Diff => 2,
            Phase::Retry => 3,
        }
    }

    pub fn headline(self) -> &'static str {
        match self {
            Phase::Full => "Phase 1: Transferring all files in the repository",
            Phase::Diff => "Phase 2: Transferring newly created and modified files",
            Phase::Retry => "Phase 3: Retrying transfer failures",
        }
    }

    /// Labels of the storage and file widgets shown under the headline.
    pub fn labels(self) -> (&'static str, &'static str) {
        match self {
            Phase::Full => ("Storage", "Files"),
            Phase::Diff => ("Diff Storage", "Diff Files"),
            Phase::Retry => ("Storage", "Files"),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "phase {}", self.number())
    }
}

/// Per-repository position in the phase sequence. Persisted, so a restarted
/// run resumes at the phase it was interrupted in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoPhaseState {
    #[default]
    NotStarted,
    Phase1Active,
    Phase2Active,
    Phase3Active,
    Done,
}

impl RepoPhaseState {
    /// Transition taken when the current state completes.
    ///
    /// `diff_pending` is only consulted after phase 1, `failures_pending`
    /// after phases 1 and 2. Phase 3 always ends the sequence; failures that
    /// survive it stay in the ledger for the next run.
    pub fn next(self, diff_pending: bool, failures_pending: bool) -> RepoPhaseState {
        use RepoPhaseState::*;
        match self {
            NotStarted => Phase1Active,
            Phase1Active if diff_pending => Phase2Active,
            Phase1Active | Phase2Active if failures_pending => Phase3Active,
            Phase1Active | Phase2Active => Done,
            Phase3Active | Done => Done,
        }
    }

    pub fn active_phase(self) -> Option<Phase> {
        match self {
            RepoPhaseState::Phase1Active => Some(Phase::Full),
            RepoPhaseState::Phase2Active => Some(Phase::Diff),
            RepoPhaseState::Phase3Active => Some(Phase::Retry),
            RepoPhaseState::NotStarted | RepoPhaseState::Done => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RepoPhaseState::NotStarted => "not started",
            RepoPhaseState::Phase1Active => "phase 1",
            RepoPhaseState::Phase2Active => "phase 2",
            RepoPhaseState::Phase3Active => "phase 3",
            RepoPhaseState::Done => "done",
        }
    }
}

//! Primary election coordinator (C5) — decides which online device acts as
//! primary after the incumbent goes offline or none has been chosen yet
//! (§4.5).
//!
//! The state machine has four states: `Idle` (nothing to decide), `Waiting`
//! (the primary was just lost; a grace period is running before a round
//! opens, giving a flaky connection a chance to recover on its own),
//! `Collecting` (a round is open, announcing our own candidacy and
//! collecting others'), and `Decided` (a winner was picked and broadcast). A
//! round always resolves to `Decided` or back to `Idle` if nobody is
//! eligible to run.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a round stays open for candidacies before tallying.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(3000);
/// How long `Waiting` holds before a round actually opens after the primary
/// is lost — gives a blip a chance to resolve without a full re-election.
pub const PRIMARY_LOSS_GRACE: Duration = Duration::from_millis(5000);

/// A device's bid to become primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub user_designated_primary: bool,
    pub uptime_millis: u64,
}

/// Total order over candidates: user-designated wins outright, then longer
/// uptime wins on ties, then lexicographically smallest id breaks remaining
/// ties (§8, invariant on deterministic election outcomes).
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .user_designated_primary
            .cmp(&self.user_designated_primary)
            .then_with(|| other.uptime_millis.cmp(&self.uptime_millis))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Picks the winner from a non-empty candidate slate. Returns `None` for an
/// empty slate (nobody to elect).
pub fn elect(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().min()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Waiting,
    Collecting,
    Decided,
}

#[derive(Debug, Clone)]
pub enum ElectionEvent {
    RoundStarted,
    Decided { winner_id: String },
    NoEligibleCandidate,
}

struct Round {
    candidates: Vec<Candidate>,
    timer: Option<JoinHandle<()>>,
}

/// Runs one election round at a time; a new trigger while a round is open
/// (or a grace period is running) is ignored — the open round or grace
/// period already reflects current intent.
pub struct Election {
    state: Mutex<ElectionState>,
    round: Mutex<Option<Round>>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ElectionEvent>,
    cancel: CancellationToken,
}

impl Election {
    pub fn new(cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(ElectionState::Idle),
            round: Mutex::new(None),
            grace_timer: Mutex::new(None),
            events,
            cancel,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ElectionState {
        *self.state.lock()
    }

    /// Starts a round immediately if one isn't already open (§4.5, startup
    /// with no known primary).
    pub fn handle_no_primary_on_startup(self: &Arc<Self>, self_candidate: Candidate) {
        let mut state = self.state.lock();
        if *state != ElectionState::Idle {
            return;
        }
        *state = ElectionState::Collecting;
        drop(state);
        self.begin_round(self_candidate);
    }

    /// Heard an `election:start` from another device. Joins the round if we
    /// aren't already collecting one (§4.5).
    pub fn handle_election_start(self: &Arc<Self>, self_candidate: Candidate) {
        let mut state = self.state.lock();
        if *state == ElectionState::Collecting || *state == ElectionState::Decided {
            return;
        }
        if let Some(timer) = self.grace_timer.lock().take() {
            timer.abort();
        }
        *state = ElectionState::Collecting;
        drop(state);
        self.begin_round(self_candidate);
    }

    /// The primary we knew about just went offline. Enters `Waiting` and
    /// arms a grace timer; if nothing resolves the slot within
    /// [`PRIMARY_LOSS_GRACE`], a round opens using the candidate `make_candidate`
    /// produces at that moment (uptime keeps advancing during the wait).
    pub fn handle_primary_lost(
        self: &Arc<Self>,
        make_candidate: impl Fn() -> Candidate + Send + Sync + 'static,
    ) {
        let mut state = self.state.lock();
        if *state != ElectionState::Idle {
            return;
        }
        *state = ElectionState::Waiting;
        drop(state);
        info!("election: primary lost, entering grace period");

        let this = self.clone();
        let cancel = self.cancel.child_token();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(PRIMARY_LOSS_GRACE) => {
                    let mut state = this.state.lock();
                    if *state != ElectionState::Waiting {
                        return;
                    }
                    *state = ElectionState::Collecting;
                    drop(state);
                    this.begin_round(make_candidate());
                }
                _ = cancel.cancelled() => {}
            }
        });
        *self.grace_timer.lock() = Some(timer);
    }

    /// Seeds the round with our own candidacy and arms the decide-by timer.
    /// Caller must already have transitioned `state` to `Collecting`.
    fn begin_round(self: &Arc<Self>, self_candidate: Candidate) {
        let this = self.clone();
        let cancel = self.cancel.child_token();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ELECTION_TIMEOUT) => this.close_round(),
                _ = cancel.cancelled() => {}
            }
        });

        *self.round.lock() = Some(Round {
            candidates: vec![self_candidate],
            timer: Some(timer),
        });
        let _ = self.events.send(ElectionEvent::RoundStarted);
        info!("election: round started");
    }

    /// Records a candidacy heard from another device. No-op if no round is
    /// open.
    pub fn receive_candidate(&self, candidate: Candidate) {
        let state = self.state.lock();
        if *state != ElectionState::Collecting {
            return;
        }
        drop(state);
        if let Some(round) = self.round.lock().as_mut() {
            if let Some(existing) = round.candidates.iter_mut().find(|c| c.id == candidate.id) {
                *existing = candidate;
            } else {
                round.candidates.push(candidate);
            }
        }
    }

    /// Closes the round early and tallies immediately. Used by tests and by
    /// a node that has heard from every known device already.
    pub fn close_round(&self) {
        {
            let mut state = self.state.lock();
            if *state != ElectionState::Collecting {
                return;
            }
            *state = ElectionState::Decided;
        }

        let winner = {
            let mut round = self.round.lock();
            let Some(round) = round.as_mut() else {
                return;
            };
            if let Some(timer) = round.timer.take() {
                timer.abort();
            }
            elect(&round.candidates).cloned()
        };

        // An empty slate is structurally unreachable (begin_round always
        // seeds the round with self_candidate first) but the deterministic
        // default (§4.5) still applies here rather than panicking.
        match winner {
            Some(candidate) => {
                info!("election: decided, winner={}", candidate.id);
                let _ = self.events.send(ElectionEvent::Decided {
                    winner_id: candidate.id,
                });
            }
            None => {
                *self.state.lock() = ElectionState::Idle;
                let _ = self.events.send(ElectionEvent::NoEligibleCandidate);
            }
        }
    }

    /// Returns to `Idle` so a future trigger can open a new round (e.g. the
    /// decided primary itself later goes offline).
    pub fn reset(&self) {
        if let Some(round) = self.round.lock().take() {
            if let Some(timer) = round.timer {
                timer.abort();
            }
        }
        if let Some(timer) = self.grace_timer.lock().take() {
            timer.abort();
        }
        *self.state.lock() = ElectionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, designated: bool, uptime: u64) -> Candidate {
        Candidate {
            id: id.to_string(),
            user_designated_primary: designated,
            uptime_millis: uptime,
        }
    }

    #[test]
    fn user_designated_outranks_everything() {
        let candidates = vec![candidate("b", false, 10_000), candidate("a", true, 1)];
        assert_eq!(elect(&candidates).unwrap().id, "a");
    }

    #[test]
    fn longer_uptime_wins_without_designation() {
        let candidates = vec![candidate("a", false, 100), candidate("b", false, 200)];
        assert_eq!(elect(&candidates).unwrap().id, "b");
    }

    #[test]
    fn lexicographic_id_breaks_remaining_ties() {
        let candidates = vec![candidate("zz", false, 50), candidate("aa", false, 50)];
        assert_eq!(elect(&candidates).unwrap().id, "aa");
    }

    #[test]
    fn empty_slate_elects_nobody() {
        assert!(elect(&[]).is_none());
    }

    #[tokio::test]
    async fn round_closes_and_decides_with_self_candidate_alone() {
        let election = Arc::new(Election::new(CancellationToken::new()));
        let mut events = election.subscribe();
        election.handle_no_primary_on_startup(candidate("solo", false, 5));
        assert_eq!(election.state(), ElectionState::Collecting);
        election.close_round();

        let mut saw_decided = false;
        while let Ok(event) = events.try_recv() {
            if let ElectionEvent::Decided { winner_id } = event {
                assert_eq!(winner_id, "solo");
                saw_decided = true;
            }
        }
        assert!(saw_decided);
        assert_eq!(election.state(), ElectionState::Decided);
    }

    #[tokio::test]
    async fn higher_ranked_late_candidate_still_wins_before_close() {
        let election = Arc::new(Election::new(CancellationToken::new()));
        election.handle_no_primary_on_startup(candidate("self", false, 5));
        election.receive_candidate(candidate("other", true, 0));
        election.close_round();
        assert_eq!(election.state(), ElectionState::Decided);
    }

    #[tokio::test]
    async fn primary_lost_enters_waiting_before_any_round_opens() {
        let election = Arc::new(Election::new(CancellationToken::new()));
        election.handle_primary_lost(|| candidate("self", false, 5));
        // The grace phase is a genuinely distinct state from the round
        // itself: no candidates are being collected yet.
        assert_eq!(election.state(), ElectionState::Waiting);
        election.reset();
    }

    #[tokio::test]
    async fn election_start_from_idle_opens_a_round() {
        let election = Arc::new(Election::new(CancellationToken::new()));
        election.handle_election_start(candidate("self", false, 5));
        assert_eq!(election.state(), ElectionState::Collecting);
    }

    #[tokio::test]
    async fn election_start_cancels_a_pending_grace_period() {
        let election = Arc::new(Election::new(CancellationToken::new()));
        election.handle_primary_lost(|| candidate("self", false, 5));
        assert_eq!(election.state(), ElectionState::Waiting);
        election.handle_election_start(candidate("self", false, 5));
        assert_eq!(election.state(), ElectionState::Collecting);
    }
}

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CountryCode, Move, MoveKind, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountryStatus {
    Correct,
    Failed,
}

pub type CountryStatusMap = BTreeMap<CountryCode, CountryStatus>;

/// Display state derived from the move log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub country_status: CountryStatusMap,
    /// Players who attempted the question currently open in `round`.
    pub attempts: BTreeSet<PlayerId>,
}

impl Projection {
    pub fn status_of(&self, country: &CountryCode) -> Option<CountryStatus> {
        self.country_status.get(country).copied()
    }

    pub fn is_resolved(&self, country: &CountryCode) -> bool {
        self.country_status.contains_key(country)
    }

    pub fn has_attempted(&self, player_id: PlayerId) -> bool {
        self.attempts.contains(&player_id)
    }
}

/// Log order: creation time, then store sequence number.
pub fn log_order(a: &Move, b: &Move) -> Ordering {
    a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq))
}

pub fn sort_log(moves: &mut [Move]) {
    moves.sort_by(log_order);
}

/// Replays the move log for `round`.
///
/// The first terminal move for a country wins; later moves for the same
/// country do not change its status. A terminal move in the current round
/// closes the question, so attempts recorded before it are dropped.
pub fn project(moves: &[Move], round: u32) -> Projection {
    let mut ordered: Vec<&Move> = moves.iter().collect();
    ordered.sort_by(|a, b| log_order(a, b));

    let mut seen: HashSet<Uuid> = HashSet::with_capacity(ordered.len());
    let mut projection = Projection::default();

    for mv in ordered {
        if !seen.insert(mv.id) {
            continue;
        }
        match mv.kind {
            MoveKind::Guess if mv.correct => {
                if let Some(target) = &mv.target {
                    projection
                        .country_status
                        .entry(target.clone())
                        .or_insert(CountryStatus::Correct);
                }
                if mv.round == round {
                    projection.attempts.clear();
                }
            }
            MoveKind::Guess | MoveKind::Timeout => {
                if mv.round == round {
                    projection.attempts.insert(mv.player_id);
                }
            }
            MoveKind::AllFailed => {
                if let Some(target) = &mv.target {
                    projection
                        .country_status
                        .entry(target.clone())
                        .or_insert(CountryStatus::Failed);
                }
                if mv.round == round {
                    projection.attempts.clear();
                }
            }
            MoveKind::Surrender => {}
        }
    }

    projection
}

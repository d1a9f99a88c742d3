use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{RetryPolicy, SessionConfig};
use crate::model::{
    CountryCode, GameStatePatch, MoveKind, NewMove, PlayerId, Question, RoomStatus,
};
use crate::questions::QuestionPool;
use crate::store::{Store, StoreResult};
use crate::view::RoomView;

/// Correction the host applies when the roster and game state disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desync {
    /// One or no eligible player left.
    Finish,
    /// The turn holder is no longer on the roster.
    Reassign {
        to: PlayerId,
        question: Option<Question>,
        round: u32,
        /// Open question that nobody left can answer; recorded as failed.
        abandoned: Option<CountryCode>,
    },
}

/// Host-only watchdog over roster changes during play.
pub struct LivenessMonitor {
    me: PlayerId,
    pool: QuestionPool,
    rng: StdRng,
    turn_seconds: u32,
    retry: RetryPolicy,
    finish_sent: bool,
    reassigned_from: Option<u64>,
}

impl LivenessMonitor {
    pub fn new(me: PlayerId, config: &SessionConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self {
            me,
            pool: config.question_pool(),
            rng,
            turn_seconds: config.turn_seconds,
            retry: config.retry,
            finish_sent: false,
            reassigned_from: None,
        }
    }

    /// What the host should correct, if anything. Each game state version is
    /// corrected at most once, and the game is finished at most once.
    pub fn inspect(&mut self, view: &RoomView) -> Option<Desync> {
        let room = view.room.as_ref()?;
        if room.status != RoomStatus::Playing {
            self.finish_sent = false;
            self.reassigned_from = None;
            return None;
        }
        if !room.is_host(self.me) {
            return None;
        }

        if view.eligible().count() <= 1 {
            return (!self.finish_sent).then_some(Desync::Finish);
        }

        let game = view.game.as_ref()?;
        if view.player(game.current_turn).is_some() || self.reassigned_from == Some(game.version) {
            return None;
        }

        let open = &game.question.target;
        let question_closed = view.projection.is_resolved(open);
        if !question_closed {
            if let Some(next) = view
                .eligible()
                .find(|p| !view.projection.has_attempted(p.player_id))
            {
                return Some(Desync::Reassign {
                    to: next.player_id,
                    question: None,
                    round: game.round,
                    abandoned: None,
                });
            }
        }

        let to = view.eligible().next()?.player_id;
        let mut question = self
            .pool
            .pick(&view.projection.country_status, Some(open), &mut self.rng);
        if let Some(q) = question.as_mut() {
            q.mode = room.mode;
        }
        match question {
            Some(question) => Some(Desync::Reassign {
                to,
                question: Some(question),
                round: game.round + 1,
                abandoned: (!question_closed).then(|| open.clone()),
            }),
            None => (!self.finish_sent).then_some(Desync::Finish),
        }
    }

    /// Inspects the view and writes the correction. Returns what was applied.
    pub async fn act(&mut self, store: &dyn Store, view: &RoomView) -> StoreResult<Option<Desync>> {
        let Some(desync) = self.inspect(view) else {
            return Ok(None);
        };
        let (Some(room), Some(game)) = (view.room.as_ref(), view.game.as_ref()) else {
            return Ok(None);
        };
        let room_id = room.id;

        match &desync {
            Desync::Finish => {
                self.finish_sent = true;
                tracing::info!("Room {} has at most one player left in the game; finishing", room_id);
                let result = self
                    .retry
                    .run("finish game", || {
                        store.update_room_status(room_id, RoomStatus::Finished, Some(RoomStatus::Playing))
                    })
                    .await;
                match result {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => {}
                    Err(e) => {
                        self.finish_sent = false;
                        return Err(e);
                    }
                }
            }
            Desync::Reassign {
                to,
                question,
                round,
                abandoned,
            } => {
                self.reassigned_from = Some(game.version);
                tracing::info!(
                    "Turn holder {} left room {}; reassigning to {}",
                    game.current_turn,
                    room_id,
                    to
                );
                if let Some(country) = abandoned {
                    let mv = NewMove {
                        room_id,
                        player_id: self.me,
                        kind: MoveKind::AllFailed,
                        target: Some(country.clone()),
                        correct: false,
                        round: game.round,
                    };
                    match self.retry.run("record all_failed", || store.insert_move(mv.clone())).await {
                        Ok(_) => {}
                        Err(e) if e.is_conflict() => {}
                        Err(e) => tracing::warn!("Could not record {} as failed: {}", country, e),
                    }
                }
                let patch = GameStatePatch {
                    current_turn: Some(*to),
                    question: question.clone(),
                    round: Some(*round),
                    time_left: Some(self.turn_seconds),
                    expected_version: Some(game.version),
                };
                match self
                    .retry
                    .run("turn reassignment", || store.update_game_state(room_id, patch.clone()))
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => {
                        tracing::debug!("Turn already moved past version {}", game.version);
                    }
                    Err(e) => {
                        self.reassigned_from = None;
                        return Err(e);
                    }
                }
            }
        }
        Ok(Some(desync))
    }
}

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;

use crate::config::{RetryPolicy, SessionConfig};
use crate::model::{
    CountryCode, GameState, GameStatePatch, Move, MoveKind, NewMove, Player, PlayerDelta,
    PlayerId, Question, RoomId, RoomStatus, CORRECT_GUESS_SCORE,
};
use crate::questions::QuestionPool;
use crate::store::{Store, StoreError};
use crate::view::RoomView;

// -- Turn State Machine --

/// Local write guard. Anything but `AwaitingMove` blocks new submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPhase {
    AwaitingMove,
    Resolving,
    /// Rotation written; waiting to observe a game state newer than `base_version`.
    AwaitingConfirmation { base_version: u64, since: Instant },
    /// This client appended `all_failed` and owes the rotation at `deadline`.
    AllFailedPending {
        country: CountryCode,
        round: u32,
        base_version: u64,
        lives_after: u8,
        deadline: Instant,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Guess(CountryCode),
    Timeout,
    Surrender,
}

/// Turn change written by a coordinator. `question: None` keeps the open
/// question (fast pass).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub next_turn: PlayerId,
    pub round: u32,
    pub question: Option<Question>,
}

impl Rotation {
    pub fn is_fast_pass(&self) -> bool {
        self.question.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Rotated(Rotation),
    /// Everyone eligible missed; the rotation follows after the settle delay.
    AllFailed { country: CountryCode, deadline: Instant },
    /// No eligible player or no question left; the room was marked finished.
    Finished,
    /// Recorded without moving the turn.
    Recorded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectedMove {
    #[error("no game in progress")]
    NotPlaying,
    #[error("not in this room")]
    NotInRoom,
    #[error("not your turn")]
    NotYourTurn,
    #[error("previous move is still resolving")]
    Busy,
    #[error("you are out of lives")]
    Eliminated,
    #[error("{0} is already resolved")]
    AlreadyResolved(CountryCode),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("move rejected: {0}")]
    Rejected(#[from] RejectedMove),
    /// The move itself was not recorded; nothing changed.
    #[error("failed to record move: {0}")]
    StoreWrite(StoreError),
    /// The move was recorded but the turn did not advance.
    #[error("failed to rotate turn: {0}")]
    Rotation(StoreError),
    /// The move was recorded but its score or lives change was not; the turn
    /// stays put until recovery settles it.
    #[error("failed to update score and lives: {0}")]
    PlayerUpdate(StoreError),
}

// -- Rotation rules --

/// Next player after `from` in cyclic roster order whose lives are above
/// zero and who passes `accept`. `from` comes back only when nobody else
/// qualifies. The flag is set when the walk passed the end of the roster.
pub fn next_in_rotation<L, A>(
    roster: &[Player],
    from: PlayerId,
    lives_of: L,
    accept: A,
) -> Option<(PlayerId, bool)>
where
    L: Fn(&Player) -> u8,
    A: Fn(&Player) -> bool,
{
    let n = roster.len();
    if n == 0 {
        return None;
    }
    let start = roster.iter().position(|p| p.player_id == from);
    // A departed mover has no position; walk from the top without wrapping.
    let origin = start.unwrap_or(n - 1);
    (1..=n).find_map(|step| {
        let raw = origin + step;
        let p = &roster[raw % n];
        (lives_of(p) > 0 && accept(p)).then(|| (p.player_id, start.is_some() && raw >= n))
    })
}

/// Latest move of the turn holder in the current round that the game state
/// has not caught up with.
pub fn pending_rotation(view: &RoomView) -> Option<&Move> {
    if !view.is_playing() {
        return None;
    }
    let game = view.game.as_ref()?;
    view.moves.iter().rev().find(|m| {
        m.round == game.round && m.player_id == game.current_turn && m.created_at > game.updated_at
    })
}

/// Score and lives change a recorded move earns its player.
fn move_delta(mv: &Move) -> Option<PlayerDelta> {
    let delta = match mv.kind {
        MoveKind::Guess if mv.correct => PlayerDelta::score(CORRECT_GUESS_SCORE),
        MoveKind::Guess | MoveKind::Timeout => PlayerDelta::lose_lives(1),
        MoveKind::Surrender => PlayerDelta::lose_lives(u8::MAX),
        MoveKind::AllFailed => return None,
    };
    Some(delta.for_move(mv.id))
}

// -- Coordinator --

pub struct Coordinator {
    me: PlayerId,
    phase: TurnPhase,
    pool: QuestionPool,
    rng: StdRng,
    settle_delay: Duration,
    confirm_timeout: Duration,
    turn_seconds: u32,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(me: PlayerId, config: &SessionConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            me,
            phase: TurnPhase::AwaitingMove,
            pool: config.question_pool(),
            rng,
            settle_delay: config.settle_delay,
            confirm_timeout: config.confirm_timeout,
            turn_seconds: config.turn_seconds,
            retry: config.retry,
        }
    }

    pub fn me(&self) -> PlayerId {
        self.me
    }

    pub fn phase(&self) -> &TurnPhase {
        &self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase != TurnPhase::AwaitingMove
    }

    pub fn settle_deadline(&self) -> Option<Instant> {
        match &self.phase {
            TurnPhase::AllFailedPending { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    pub fn pending_failure(&self) -> Option<&CountryCode> {
        match &self.phase {
            TurnPhase::AllFailedPending { country, .. } => Some(country),
            _ => None,
        }
    }

    /// Drops the guard, e.g. when the room goes away.
    pub fn reset(&mut self) {
        self.phase = TurnPhase::AwaitingMove;
    }

    pub fn check<'v>(&self, view: &'v RoomView, intent: &Intent) -> Result<&'v GameState, RejectedMove> {
        if self.is_busy() {
            return Err(RejectedMove::Busy);
        }
        let room = view.room.as_ref().ok_or(RejectedMove::NotInRoom)?;
        let me = view.player(self.me).ok_or(RejectedMove::NotInRoom)?;
        if room.status != RoomStatus::Playing {
            return Err(RejectedMove::NotPlaying);
        }
        let game = view.game.as_ref().ok_or(RejectedMove::NotPlaying)?;
        if !me.is_eligible() {
            return Err(RejectedMove::Eliminated);
        }
        if *intent == Intent::Surrender && game.current_turn != self.me {
            return Ok(game);
        }
        if game.current_turn != self.me {
            return Err(RejectedMove::NotYourTurn);
        }
        if pending_rotation(view).is_some() {
            return Err(RejectedMove::Busy);
        }
        if view.projection.is_resolved(&game.question.target) {
            return Err(RejectedMove::AlreadyResolved(game.question.target.clone()));
        }
        if let Intent::Guess(country) = intent {
            if view.projection.is_resolved(country) {
                return Err(RejectedMove::AlreadyResolved(country.clone()));
            }
        }
        Ok(game)
    }

    /// Validates and records a local move, then drives the turn forward.
    pub async fn submit(
        &mut self,
        store: &dyn Store,
        view: &RoomView,
        intent: Intent,
    ) -> Result<Outcome, CoordinatorError> {
        let game = match self.check(view, &intent) {
            Ok(game) => game.clone(),
            Err(reason) => {
                tracing::debug!("Rejected {:?} from {}: {}", intent, self.me, reason);
                return Err(reason.into());
            }
        };
        let lives = view.player(self.me).map(|p| p.lives).unwrap_or(0);

        self.phase = TurnPhase::Resolving;
        let result = self.resolve(store, view, &game, lives, intent).await;
        match &result {
            Ok(Outcome::Rotated(_)) | Ok(Outcome::Finished) => {
                self.phase = TurnPhase::AwaitingConfirmation {
                    base_version: game.version,
                    since: Instant::now(),
                };
            }
            Ok(Outcome::AllFailed { .. }) => {}
            Ok(Outcome::Recorded) | Err(_) => self.phase = TurnPhase::AwaitingMove,
        }
        result
    }

    async fn resolve(
        &mut self,
        store: &dyn Store,
        view: &RoomView,
        game: &GameState,
        lives: u8,
        intent: Intent,
    ) -> Result<Outcome, CoordinatorError> {
        let target = game.question.target.clone();
        let (kind, guessed, correct) = match &intent {
            Intent::Guess(country) => (MoveKind::Guess, Some(country.clone()), *country == target),
            Intent::Timeout => (MoveKind::Timeout, Some(target.clone()), false),
            Intent::Surrender => (MoveKind::Surrender, None, false),
        };
        let lives_after = match kind {
            MoveKind::Guess if correct => lives,
            MoveKind::Surrender => 0,
            _ => lives.saturating_sub(1),
        };

        let recorded = store
            .insert_move(NewMove {
                room_id: game.room_id,
                player_id: self.me,
                kind,
                target: guessed,
                correct,
                round: game.round,
            })
            .await
            .map_err(|e| {
                tracing::warn!("Failed to record {:?} in room {}: {}", kind, game.room_id, e);
                CoordinatorError::StoreWrite(e)
            })?;
        tracing::debug!(
            "Recorded {:?} by {} (round {}, seq {})",
            recorded.kind,
            self.me,
            recorded.round,
            recorded.seq
        );

        if let Some(delta) = move_delta(&recorded) {
            self.adjust_player(store, game.room_id, self.me, delta).await?;
        }

        let me = self.me;
        let lives_of = move |p: &Player| if p.player_id == me { lives_after } else { p.lives };

        if recorded.is_terminal() {
            let plan = self.plan_new_question(view, game, me, lives_of, Some(&target));
            return self.rotate(store, game, plan).await;
        }
        if kind == MoveKind::Surrender && game.current_turn != me {
            return Ok(Outcome::Recorded);
        }

        let mut attempts = view.projection.attempts.clone();
        attempts.insert(me);
        if let Some((next, _)) =
            next_in_rotation(&view.roster, me, lives_of, |p| !attempts.contains(&p.player_id))
        {
            let pass = Rotation {
                next_turn: next,
                round: game.round,
                question: None,
            };
            return self.rotate(store, game, Some(pass)).await;
        }

        self.record_all_failed(store, game.room_id, game.round, &target).await?;
        let deadline = Instant::now() + self.settle_delay;
        tracing::info!(
            "Nobody found {} in room {}; rotating in {:?}",
            target,
            game.room_id,
            self.settle_delay
        );
        self.phase = TurnPhase::AllFailedPending {
            country: target.clone(),
            round: game.round,
            base_version: game.version,
            lives_after,
            deadline,
        };
        Ok(Outcome::AllFailed {
            country: target,
            deadline,
        })
    }

    /// Writes the rotation owed after an all-failed settle delay. No-op unless
    /// this client is the designated writer and the turn has not moved since.
    pub async fn complete_all_failed(
        &mut self,
        store: &dyn Store,
        view: &RoomView,
    ) -> Result<Option<Outcome>, CoordinatorError> {
        let (country, base_version, lives_after) = match &self.phase {
            TurnPhase::AllFailedPending {
                country,
                base_version,
                lives_after,
                ..
            } => (country.clone(), *base_version, *lives_after),
            _ => return Ok(None),
        };
        let game = match &view.game {
            Some(game) if game.version == base_version && view.is_playing() => game.clone(),
            _ => {
                tracing::debug!("Turn moved during settle delay; dropping pending rotation");
                self.phase = TurnPhase::AwaitingMove;
                return Ok(None);
            }
        };

        self.phase = TurnPhase::Resolving;
        let me = self.me;
        let lives_of = move |p: &Player| {
            if p.player_id == me {
                p.lives.min(lives_after)
            } else {
                p.lives
            }
        };
        let plan = self.plan_new_question(view, &game, me, lives_of, Some(&country));
        let result = self.rotate(store, &game, plan).await;
        self.phase = match result {
            Ok(_) => TurnPhase::AwaitingConfirmation {
                base_version,
                since: Instant::now(),
            },
            Err(_) => TurnPhase::AwaitingMove,
        };
        result.map(Some)
    }

    /// Rotates on behalf of a turn holder whose move was recorded but never
    /// followed by a rotation.
    pub async fn recover(
        &mut self,
        store: &dyn Store,
        view: &RoomView,
    ) -> Result<Option<Outcome>, CoordinatorError> {
        if self.is_busy() {
            return Ok(None);
        }
        let (mv, game) = match (pending_rotation(view), &view.game) {
            (Some(mv), Some(game)) => (mv.clone(), game.clone()),
            _ => return Ok(None),
        };
        tracing::warn!(
            "Recovering stalled turn of {} in room {} (round {})",
            mv.player_id,
            game.room_id,
            game.round
        );

        self.phase = TurnPhase::Resolving;
        let lives = match self.settle_deltas(store, view, &game).await {
            Ok(lives) => lives,
            Err(e) => {
                self.phase = TurnPhase::AwaitingMove;
                return Err(e);
            }
        };
        let lives = &lives;
        let confirmed_lives = move |p: &Player| lives.get(&p.player_id).copied().unwrap_or(p.lives);
        let holder = mv.player_id;
        let target = game.question.target.clone();
        let result = if mv.is_terminal() || view.projection.is_resolved(&target) {
            let resolved = mv.target.clone().unwrap_or_else(|| target.clone());
            let plan = self.plan_new_question(view, &game, holder, confirmed_lives, Some(&resolved));
            self.rotate(store, &game, plan).await
        } else {
            let attempts = &view.projection.attempts;
            match next_in_rotation(&view.roster, holder, confirmed_lives, |p| {
                !attempts.contains(&p.player_id)
            }) {
                Some((next, _)) => {
                    let pass = Rotation {
                        next_turn: next,
                        round: game.round,
                        question: None,
                    };
                    self.rotate(store, &game, Some(pass)).await
                }
                None => match self.record_all_failed(store, game.room_id, game.round, &target).await {
                    Ok(()) => {
                        let plan =
                            self.plan_new_question(view, &game, holder, confirmed_lives, Some(&target));
                        self.rotate(store, &game, plan).await
                    }
                    Err(e) => Err(e),
                },
            }
        };
        self.phase = match result {
            Ok(_) => TurnPhase::AwaitingConfirmation {
                base_version: game.version,
                since: Instant::now(),
            },
            Err(_) => TurnPhase::AwaitingMove,
        };
        result.map(Some)
    }

    /// Releases the guard once the confirmed view shows the turn moved.
    pub fn observe(&mut self, view: &RoomView) {
        let base = match &self.phase {
            TurnPhase::AwaitingConfirmation { base_version, .. }
            | TurnPhase::AllFailedPending { base_version, .. } => *base_version,
            _ => return,
        };
        let moved = view.game.as_ref().map_or(true, |g| g.version > base);
        if moved || !view.is_playing() {
            if matches!(self.phase, TurnPhase::AllFailedPending { .. }) {
                tracing::debug!("Turn moved before settle delay ended");
            }
            self.phase = TurnPhase::AwaitingMove;
        }
    }

    /// Gives up waiting for confirmation. Returns true when the caller should
    /// resync from the store.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.phase {
            TurnPhase::AwaitingConfirmation { since, .. }
                if now.duration_since(since) >= self.confirm_timeout =>
            {
                tracing::warn!("No turn change observed after {:?}; resyncing", self.confirm_timeout);
                self.phase = TurnPhase::AwaitingMove;
                true
            }
            _ => false,
        }
    }

    fn plan_new_question<L>(
        &mut self,
        view: &RoomView,
        game: &GameState,
        from: PlayerId,
        lives_of: L,
        just_resolved: Option<&CountryCode>,
    ) -> Option<Rotation>
    where
        L: Fn(&Player) -> u8,
    {
        let mut question =
            self.pool
                .pick(&view.projection.country_status, just_resolved, &mut self.rng)?;
        if let Some(room) = &view.room {
            question.mode = room.mode;
        }
        let (next, wrapped) = next_in_rotation(&view.roster, from, lives_of, |_| true)?;
        Some(Rotation {
            next_turn: next,
            round: if wrapped { game.round + 1 } else { game.round },
            question: Some(question),
        })
    }

    /// Conditional on the version the plan was computed from. Losing that race
    /// means another client already advanced the turn.
    async fn rotate(
        &mut self,
        store: &dyn Store,
        game: &GameState,
        plan: Option<Rotation>,
    ) -> Result<Outcome, CoordinatorError> {
        let Some(rotation) = plan else {
            self.finish(store, game.room_id).await?;
            return Ok(Outcome::Finished);
        };
        let room_id = game.room_id;
        let patch = GameStatePatch {
            current_turn: Some(rotation.next_turn),
            question: rotation.question.clone(),
            round: Some(rotation.round),
            time_left: Some(self.turn_seconds),
            expected_version: Some(game.version),
        };
        match self
            .retry
            .run("turn rotation", || store.update_game_state(room_id, patch.clone()))
            .await
        {
            Ok(state) => {
                tracing::info!(
                    "Turn -> {} in room {} (round {}, version {}{})",
                    state.current_turn,
                    room_id,
                    state.round,
                    state.version,
                    if rotation.is_fast_pass() { ", fast pass" } else { "" }
                );
                Ok(Outcome::Rotated(rotation))
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!("Rotation from version {} already applied: {}", game.version, e);
                Ok(Outcome::Rotated(rotation))
            }
            Err(e) => {
                tracing::error!("Turn rotation in room {} failed: {}", room_id, e);
                Err(CoordinatorError::Rotation(e))
            }
        }
    }

    async fn finish(&self, store: &dyn Store, room_id: RoomId) -> Result<(), CoordinatorError> {
        let result = self
            .retry
            .run("finish game", || {
                store.update_room_status(room_id, RoomStatus::Finished, Some(RoomStatus::Playing))
            })
            .await;
        match result {
            Ok(_) => {
                tracing::info!("Game in room {} finished", room_id);
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(CoordinatorError::Rotation(e)),
        }
    }

    async fn record_all_failed(
        &self,
        store: &dyn Store,
        room_id: RoomId,
        round: u32,
        country: &CountryCode,
    ) -> Result<(), CoordinatorError> {
        let mv = NewMove {
            room_id,
            player_id: self.me,
            kind: MoveKind::AllFailed,
            target: Some(country.clone()),
            correct: false,
            round,
        };
        match self
            .retry
            .run("record all_failed", || store.insert_move(mv.clone()))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                tracing::debug!("all_failed for {} already recorded", country);
                Ok(())
            }
            Err(e) => Err(CoordinatorError::Rotation(e)),
        }
    }

    /// Safe to retry: the store applies a move's delta once.
    async fn adjust_player(
        &self,
        store: &dyn Store,
        room_id: RoomId,
        player_id: PlayerId,
        delta: PlayerDelta,
    ) -> Result<Player, CoordinatorError> {
        self.retry
            .run("player update", || store.update_player(room_id, player_id, delta))
            .await
            .map_err(|e| {
                tracing::error!("Update {:?} for {} failed: {}", delta, player_id, e);
                CoordinatorError::PlayerUpdate(e)
            })
    }

    /// Applies the deltas of seated players' moves the turn has not caught
    /// up with. Returns their lives as the store now has them.
    async fn settle_deltas(
        &self,
        store: &dyn Store,
        view: &RoomView,
        game: &GameState,
    ) -> Result<HashMap<PlayerId, u8>, CoordinatorError> {
        let mut lives = HashMap::new();
        let unsettled = view.moves.iter().filter(|m| {
            m.round == game.round && m.created_at > game.updated_at && view.player(m.player_id).is_some()
        });
        for mv in unsettled {
            let Some(delta) = move_delta(mv) else {
                continue;
            };
            let player = self.adjust_player(store, game.room_id, mv.player_id, delta).await?;
            lives.insert(player.player_id, player.lives);
        }
        Ok(lives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::projection::CountryStatus;
    use crate::testing::{capture_logs, test_config, Fault, FlakyStore, Table};

    const CODES: &[&str] = &["FRA", "DEU", "ITA", "ESP", "PRT"];

    fn coordinator(me: PlayerId) -> Coordinator {
        Coordinator::new(me, &test_config(CODES))
    }

    fn guess(code: &str) -> Intent {
        Intent::Guess(CountryCode::new(code))
    }

    fn confirmed_lives(p: &Player) -> u8 {
        p.lives
    }

    #[test]
    fn test_rotation_skips_eliminated_and_wraps() {
        let room_id = uuid::Uuid::new_v4();
        let mut roster: Vec<Player> = (0..3)
            .map(|i| Player::new(room_id, uuid::Uuid::new_v4(), format!("P{}", i), true))
            .collect();
        let ids: Vec<PlayerId> = roster.iter().map(|p| p.player_id).collect();

        assert_eq!(next_in_rotation(&roster, ids[0], confirmed_lives, |_| true), Some((ids[1], false)));
        assert_eq!(next_in_rotation(&roster, ids[2], confirmed_lives, |_| true), Some((ids[0], true)));

        roster[1].lives = 0;
        assert_eq!(next_in_rotation(&roster, ids[0], confirmed_lives, |_| true), Some((ids[2], false)));

        roster[2].lives = 0;
        // Only the mover is left.
        assert_eq!(next_in_rotation(&roster, ids[0], confirmed_lives, |_| true), Some((ids[0], true)));

        roster[0].lives = 0;
        assert_eq!(next_in_rotation(&roster, ids[0], confirmed_lives, |_| true), None);
    }

    #[test]
    fn test_rotation_from_departed_player() {
        let room_id = uuid::Uuid::new_v4();
        let roster: Vec<Player> = (0..2)
            .map(|i| Player::new(room_id, uuid::Uuid::new_v4(), format!("P{}", i), true))
            .collect();
        let gone = uuid::Uuid::new_v4();
        assert_eq!(
            next_in_rotation(&roster, gone, confirmed_lives, |_| true),
            Some((roster[0].player_id, false))
        );
    }

    #[tokio::test]
    async fn test_wrong_guess_fast_passes_then_correct_guess_wraps() {
        // Roster order P3, P1, P2; P1 holds FRA.
        let mut t = Table::new(3, 1, "FRA").await;
        let (p3, p1, p2) = (t.players[0], t.players[1], t.players[2]);
        let mut c1 = coordinator(p1);

        let out = c1.submit(&*t.memory, &t.view, guess("DEU")).await.unwrap();
        assert_eq!(
            out,
            Outcome::Rotated(Rotation {
                next_turn: p2,
                round: 1,
                question: None
            })
        );
        assert!(c1.is_busy());
        t.sync();
        c1.observe(&t.view);
        assert!(!c1.is_busy());

        assert_eq!(t.lives(p1), 2);
        assert!(t.view.projection.has_attempted(p1));
        assert_eq!(t.game().current_turn, p2);
        assert_eq!(t.game().question.target.as_str(), "FRA");
        assert_eq!(t.game().round, 1);

        let mut c2 = coordinator(p2);
        let out = c2.submit(&*t.memory, &t.view, guess("FRA")).await.unwrap();
        let Outcome::Rotated(rotation) = out else {
            panic!("expected rotation, got {:?}", out);
        };
        assert_eq!(rotation.next_turn, p3);
        assert_eq!(rotation.round, 2);
        assert_ne!(rotation.question.as_ref().unwrap().target.as_str(), "FRA");

        t.sync();
        assert_eq!(t.view.projection.status_of(&"FRA".into()), Some(CountryStatus::Correct));
        assert_eq!(t.view.player(p2).unwrap().score, 1000);
        assert_eq!(t.game().current_turn, p3);
        assert_eq!(t.game().round, 2);
        assert!(t.view.projection.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_correct_guess_mid_roster_keeps_round() {
        let mut t = Table::new(3, 0, "FRA").await;
        let mut c = coordinator(t.players[0]);
        let out = c.submit(&*t.memory, &t.view, guess("fra")).await.unwrap();
        assert!(matches!(out, Outcome::Rotated(Rotation { round: 1, .. })));
        t.sync();
        assert_eq!(t.game().current_turn, t.players[1]);
    }

    #[tokio::test]
    async fn test_everyone_misses_records_one_all_failed_then_rotates_after_settle() {
        // Roster order P3, P1, P2; P3 holds ITA.
        let mut t = Table::new(3, 0, "ITA").await;
        let (p3, p1, p2) = (t.players[0], t.players[1], t.players[2]);
        let mut c3 = coordinator(p3);
        let mut c1 = coordinator(p1);
        let mut c2 = coordinator(p2);

        c3.submit(&*t.memory, &t.view, guess("DEU")).await.unwrap();
        t.sync();
        c1.submit(&*t.memory, &t.view, guess("ESP")).await.unwrap();
        t.sync();
        let before = t.game().version;

        let out = c2.submit(&*t.memory, &t.view, guess("FRA")).await.unwrap();
        assert!(matches!(out, Outcome::AllFailed { ref country, .. } if country.as_str() == "ITA"));
        assert!(c2.settle_deadline().is_some());
        t.sync();
        c2.observe(&t.view);
        c1.observe(&t.view);
        c3.observe(&t.view);

        assert_eq!(t.all_failed_count(), 1);
        assert_eq!(t.view.projection.status_of(&"ITA".into()), Some(CountryStatus::Failed));
        assert_eq!(t.game().version, before, "no rotation before settle");
        assert!(c2.is_busy());

        // Only the designated writer acts.
        assert_eq!(c1.complete_all_failed(&*t.memory, &t.view).await.unwrap(), None);
        assert_eq!(c3.complete_all_failed(&*t.memory, &t.view).await.unwrap(), None);

        let out = c2.complete_all_failed(&*t.memory, &t.view).await.unwrap();
        let Some(Outcome::Rotated(rotation)) = out else {
            panic!("expected rotation, got {:?}", out);
        };
        assert_eq!(rotation.next_turn, p3);
        assert_eq!(rotation.round, 2);
        assert_ne!(rotation.question.unwrap().target.as_str(), "ITA");
        assert_eq!(c2.complete_all_failed(&*t.memory, &t.view).await.unwrap(), None);

        t.sync();
        assert_eq!(t.game().version, before + 1);
        assert_eq!(t.game().current_turn, p3);
        assert_eq!(t.all_failed_count(), 1);
        assert_eq!(t.lives(p1), 2);
        assert_eq!(t.lives(p2), 2);
        assert_eq!(t.lives(p3), 2);
    }

    #[tokio::test]
    async fn test_settle_rotation_dropped_when_turn_moved() {
        let mut t = Table::new(2, 0, "ITA").await;
        let (a, b) = (t.players[0], t.players[1]);
        let mut ca = coordinator(a);
        let mut cb = coordinator(b);
        ca.submit(&*t.memory, &t.view, Intent::Timeout).await.unwrap();
        t.sync();
        ca.observe(&t.view);
        cb.submit(&*t.memory, &t.view, guess("DEU")).await.unwrap();
        assert!(cb.settle_deadline().is_some());

        // Someone else moves the turn first.
        t.memory
            .update_game_state(
                t.room_id,
                GameStatePatch {
                    current_turn: Some(a),
                    question: None,
                    round: Some(2),
                    time_left: None,
                    expected_version: None,
                },
            )
            .await
            .unwrap();
        t.sync();
        cb.observe(&t.view);
        assert!(!cb.is_busy());
        assert_eq!(cb.complete_all_failed(&*t.memory, &t.view).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_out_of_turn_move_rejected_without_writes() {
        let mut t = Table::new(3, 0, "FRA").await;
        let mut c = coordinator(t.players[1]);
        let err = c.submit(&*t.memory, &t.view, guess("FRA")).await.unwrap_err();
        assert_eq!(err, CoordinatorError::Rejected(RejectedMove::NotYourTurn));
        assert!(!c.is_busy());
        t.sync();
        assert!(t.view.moves.is_empty());
        assert_eq!(t.game().version, 1);
    }

    #[tokio::test]
    async fn test_rejection_logged_locally() {
        let (logs, _guard) = capture_logs();
        let t = Table::new(3, 0, "FRA").await;
        let mut c = coordinator(t.players[2]);
        let err = c.submit(&*t.memory, &t.view, guess("FRA")).await.unwrap_err();
        assert_eq!(err, CoordinatorError::Rejected(RejectedMove::NotYourTurn));
        let logs = logs.contents();
        assert!(logs.contains("Rejected Guess"), "logs: {}", logs);
        assert!(logs.contains("not your turn"), "logs: {}", logs);
    }

    #[tokio::test]
    async fn test_second_submission_rejected_while_resolving() {
        let t = Table::new(3, 0, "FRA").await;
        let mut c = coordinator(t.players[0]);
        c.submit(&*t.memory, &t.view, guess("DEU")).await.unwrap();
        // View not yet updated: the guard alone stops the duplicate.
        let err = c.submit(&*t.memory, &t.view, guess("ESP")).await.unwrap_err();
        assert_eq!(err, CoordinatorError::Rejected(RejectedMove::Busy));
        assert_eq!(t.memory.moves(t.room_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_eliminated_and_resolved_rejections() {
        let mut t = Table::new(3, 0, "FRA").await;
        let holder = t.players[0];
        let mut c = coordinator(holder);

        t.memory
            .insert_move(NewMove {
                room_id: t.room_id,
                player_id: t.players[2],
                kind: MoveKind::AllFailed,
                target: Some("DEU".into()),
                correct: false,
                round: 0,
            })
            .await
            .unwrap();
        t.sync();
        let err = c.check(&t.view, &guess("DEU")).unwrap_err();
        assert_eq!(err, RejectedMove::AlreadyResolved("DEU".into()));

        t.set_lives(holder, 0).await;
        let err = c.check(&t.view, &guess("FRA")).unwrap_err();
        assert_eq!(err, RejectedMove::Eliminated);
    }

    #[tokio::test]
    async fn test_move_write_failure_changes_nothing() {
        let mut t = Table::new(3, 0, "FRA").await;
        let flaky = FlakyStore::new(Arc::clone(&t.memory));
        flaky.fail(Fault::InsertMove, 1);
        let mut c = coordinator(t.players[0]);

        let err = c.submit(&flaky, &t.view, guess("DEU")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StoreWrite(_)));
        assert!(!c.is_busy());
        t.sync();
        assert!(t.view.moves.is_empty());
        assert_eq!(t.lives(t.players[0]), 3);
        assert_eq!(t.game().current_turn, t.players[0]);

        // Resubmitting after the failure works.
        c.submit(&flaky, &t.view, guess("DEU")).await.unwrap();
        t.sync();
        assert_eq!(t.game().current_turn, t.players[1]);
    }

    #[tokio::test]
    async fn test_player_update_failure_surfaces_and_recovery_settles_it() {
        let mut t = Table::new(3, 0, "FRA").await;
        let flaky = FlakyStore::new(Arc::clone(&t.memory));
        flaky.fail(Fault::UpdatePlayer, 3);
        let (a, b) = (t.players[0], t.players[1]);
        let mut ca = coordinator(a);

        let err = ca.submit(&flaky, &t.view, guess("DEU")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::PlayerUpdate(_)));
        assert!(!ca.is_busy());
        t.sync();
        assert_eq!(t.view.moves.len(), 1);
        assert_eq!(t.lives(a), 3);
        assert_eq!(t.game().current_turn, a);
        assert_eq!(t.game().version, 1);

        // The turn holder cannot go again on the unsettled move.
        let err = ca.submit(&flaky, &t.view, guess("ESP")).await.unwrap_err();
        assert_eq!(err, CoordinatorError::Rejected(RejectedMove::Busy));

        let mut cb = coordinator(b);
        let out = cb.recover(&flaky, &t.view).await.unwrap();
        assert!(matches!(out, Some(Outcome::Rotated(Rotation { question: None, .. }))));
        t.sync();
        assert_eq!(t.lives(a), 2);
        assert_eq!(t.game().current_turn, b);

        // Recovering again changes nothing.
        let mut cc = coordinator(t.players[2]);
        assert_eq!(cc.recover(&flaky, &t.view).await.unwrap(), None);
        t.sync();
        assert_eq!(t.lives(a), 2);
    }

    #[tokio::test]
    async fn test_lost_update_reply_costs_one_life() {
        let mut t = Table::new(3, 0, "FRA").await;
        let flaky = FlakyStore::new(Arc::clone(&t.memory));
        flaky.lose_player_replies(1);
        let a = t.players[0];
        let mut c = coordinator(a);

        c.submit(&flaky, &t.view, guess("DEU")).await.unwrap();
        t.sync();
        assert_eq!(t.lives(a), 2);
        assert_eq!(t.game().current_turn, t.players[1]);
    }

    #[tokio::test]
    async fn test_lost_update_reply_scores_once() {
        let mut t = Table::new(3, 0, "FRA").await;
        let flaky = FlakyStore::new(Arc::clone(&t.memory));
        flaky.lose_player_replies(2);
        let a = t.players[0];
        let mut c = coordinator(a);

        c.submit(&flaky, &t.view, guess("FRA")).await.unwrap();
        t.sync();
        assert_eq!(t.view.player(a).map(|p| p.score), Some(CORRECT_GUESS_SCORE));
    }

    #[tokio::test]
    async fn test_rotation_failure_leaves_move_and_is_recovered() {
        let mut t = Table::new(3, 0, "FRA").await;
        let flaky = FlakyStore::new(Arc::clone(&t.memory));
        flaky.fail(Fault::UpdateGameState, 3);
        let (a, b) = (t.players[0], t.players[1]);
        let mut ca = coordinator(a);

        let err = ca.submit(&flaky, &t.view, guess("DEU")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Rotation(_)));
        t.sync();
        assert_eq!(t.view.moves.len(), 1);
        assert_eq!(t.lives(a), 2);
        assert_eq!(t.game().current_turn, a);
        assert!(pending_rotation(&t.view).is_some());

        // The recorded miss blocks a second attempt on the same turn.
        let err = ca.submit(&flaky, &t.view, guess("ESP")).await.unwrap_err();
        assert_eq!(err, CoordinatorError::Rejected(RejectedMove::Busy));

        let mut cb = coordinator(b);
        let out = cb.recover(&flaky, &t.view).await.unwrap();
        assert!(matches!(out, Some(Outcome::Rotated(Rotation { question: None, .. }))));
        t.sync();
        assert_eq!(t.game().current_turn, b);
        assert!(pending_rotation(&t.view).is_none());
    }

    #[tokio::test]
    async fn test_recovery_of_exhausted_question() {
        let mut t = Table::new(2, 0, "ITA").await;
        let (a, b) = (t.players[0], t.players[1]);
        for (player, kind) in [(b, MoveKind::Timeout), (a, MoveKind::Guess)] {
            t.memory
                .insert_move(NewMove {
                    room_id: t.room_id,
                    player_id: player,
                    kind,
                    target: Some(if kind == MoveKind::Guess { "DEU".into() } else { "ITA".into() }),
                    correct: false,
                    round: 1,
                })
                .await
                .unwrap();
        }
        t.sync();

        let mut cb = coordinator(b);
        let out = cb.recover(&*t.memory, &t.view).await.unwrap();
        let Some(Outcome::Rotated(rotation)) = out else {
            panic!("expected rotation, got {:?}", out);
        };
        assert_eq!(rotation.next_turn, b);
        assert_ne!(rotation.question.unwrap().target.as_str(), "ITA");
        t.sync();
        assert_eq!(t.all_failed_count(), 1);
        assert_eq!(t.view.projection.status_of(&"ITA".into()), Some(CountryStatus::Failed));
        // Both misses were charged on the way.
        assert_eq!((t.lives(a), t.lives(b)), (2, 2));
    }

    #[tokio::test]
    async fn test_concurrent_recoveries_rotate_once() {
        let mut t = Table::new(3, 0, "FRA").await;
        t.memory
            .insert_move(NewMove {
                room_id: t.room_id,
                player_id: t.players[0],
                kind: MoveKind::Guess,
                target: Some("DEU".into()),
                correct: false,
                round: 1,
            })
            .await
            .unwrap();
        t.sync();
        let before = t.game().version;

        let mut cb = coordinator(t.players[1]);
        let mut cc = coordinator(t.players[2]);
        assert!(cb.recover(&*t.memory, &t.view).await.unwrap().is_some());
        assert!(cc.recover(&*t.memory, &t.view).await.unwrap().is_some());
        t.sync();
        assert_eq!(t.game().version, before + 1);
        assert_eq!(t.game().current_turn, t.players[1]);
        assert_eq!(t.lives(t.players[0]), 2);
    }

    #[tokio::test]
    async fn test_surrender_off_turn_only_records() {
        let mut t = Table::new(3, 0, "FRA").await;
        let mut c = coordinator(t.players[2]);
        let out = c.submit(&*t.memory, &t.view, Intent::Surrender).await.unwrap();
        assert_eq!(out, Outcome::Recorded);
        assert!(!c.is_busy());
        t.sync();
        assert_eq!(t.lives(t.players[2]), 0);
        assert_eq!(t.game().version, 1);
        assert_eq!(t.view.moves[0].kind, MoveKind::Surrender);
    }

    #[tokio::test]
    async fn test_surrender_on_turn_passes_it_on() {
        let mut t = Table::new(3, 0, "FRA").await;
        let mut c = coordinator(t.players[0]);
        let out = c.submit(&*t.memory, &t.view, Intent::Surrender).await.unwrap();
        assert!(matches!(out, Outcome::Rotated(Rotation { question: None, .. })));
        t.sync();
        assert_eq!(t.lives(t.players[0]), 0);
        assert_eq!(t.game().current_turn, t.players[1]);
    }

    #[tokio::test]
    async fn test_last_question_finishes_game() {
        let mut t = Table::new(2, 0, "FRA").await;
        let mut c = Coordinator::new(t.players[0], &test_config(&["FRA"]));
        let out = c.submit(&*t.memory, &t.view, guess("FRA")).await.unwrap();
        assert_eq!(out, Outcome::Finished);
        t.sync();
        assert_eq!(t.view.room.as_ref().unwrap().status, RoomStatus::Finished);
        c.observe(&t.view);
        assert!(!c.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout_releases_guard() {
        let t = Table::new(2, 0, "FRA").await;
        let mut c = coordinator(t.players[0]);
        c.submit(&*t.memory, &t.view, guess("DEU")).await.unwrap();
        assert!(!c.expire(Instant::now()));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(c.expire(Instant::now()));
        assert!(!c.is_busy());
    }
}

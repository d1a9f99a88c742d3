use std::fmt::Write as _;

use tokio::sync::mpsc;

use mapbattle_common::model::{Move, MoveKind, PlayerId, Question, QuestionMode, RoomStatus};
use mapbattle_common::projection::CountryStatus;
use mapbattle_common::{Session, SessionError, SessionEvent, SessionSnapshot};

use crate::event::{self, AppEvent};
use crate::input::{self, Action, HELP};

/// Seconds-left marks at which the local player is reminded of the clock.
const CLOCK_WARNINGS: [u32; 2] = [10, 5];

pub async fn run(
    mut session: Session,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    mode: QuestionMode,
) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<AppEvent>(64);
    let events = tokio::spawn(event::event_loop(session_rx, event_tx));

    println!("mapbattle: you are {} ({})", session.name(), session.me());
    println!("{}", HELP);
    let mut last_warning: Option<u32> = None;

    while let Some(event) = event_rx.recv().await {
        match event {
            AppEvent::Input(line) => match input::parse_command(&line) {
                Ok(Action::Quit) => break,
                Ok(action) => {
                    if let Err(e) = perform(&mut session, action, mode).await {
                        println!("! {}", e.reason());
                    }
                }
                Err(msg) => println!("! {}", msg),
            },
            AppEvent::InputClosed => break,
            AppEvent::Session(event) => {
                if let Some(line) = describe_event(&event, &session.snapshot(), session.me()) {
                    println!("{}", line);
                }
            }
            AppEvent::Tick => {
                let snapshot = session.snapshot();
                let remaining = snapshot.time_remaining.filter(|_| snapshot.my_turn);
                match remaining {
                    Some(secs) if CLOCK_WARNINGS.contains(&secs) && last_warning != Some(secs) => {
                        println!("{}s left to answer", secs);
                        last_warning = Some(secs);
                    }
                    None => last_warning = None,
                    _ => {}
                }
            }
        }
    }

    events.abort();
    if session.room_id().is_some() {
        if let Err(e) = session.leave_room().await {
            tracing::warn!("Failed to leave room on exit: {}", e);
        }
    }
    Ok(())
}

async fn perform(session: &mut Session, action: Action, mode: QuestionMode) -> Result<(), SessionError> {
    match action {
        Action::Create => {
            let code = session.create_room().await?;
            println!("Room created, join code {}", code);
        }
        Action::Join(code) => {
            session.join_room(&code).await?;
            println!("Joined room {}", code.to_ascii_uppercase());
        }
        Action::Leave => {
            session.leave_room().await?;
            println!("Left the room");
        }
        Action::Ready(ready) => session.set_ready(ready).await?,
        Action::Start(country) => {
            let initial = country.map(|target| Question { target, mode });
            session.start_game(initial).await?;
        }
        Action::Guess(country) => session.submit_guess(country).await?,
        Action::Timeout => session.submit_timeout().await?,
        Action::Surrender => session.submit_surrender().await?,
        Action::Status => println!("{}", render_status(&session.snapshot(), session.me())),
        Action::Help => println!("{}", HELP),
        Action::Quit => {}
    }
    Ok(())
}

fn name_of(snapshot: &SessionSnapshot, player_id: PlayerId, me: PlayerId) -> String {
    if player_id == me {
        return "you".to_string();
    }
    snapshot
        .player(player_id)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| "someone".to_string())
}

/// One console line for an event, or `None` for changes the status view covers.
pub fn describe_event(event: &SessionEvent, snapshot: &SessionSnapshot, me: PlayerId) -> Option<String> {
    let line = match event {
        SessionEvent::PlayerJoined(player) => format!("{} joined", player.name),
        SessionEvent::PlayerLeft(player_id) if *player_id == me => return None,
        SessionEvent::PlayerLeft(_) => "a player left".to_string(),
        SessionEvent::MoveRecorded(mv) => describe_move(mv, snapshot, me)?,
        SessionEvent::TurnChanged {
            player_id,
            round,
            question,
        } => {
            let whose = if *player_id == me {
                "your turn".to_string()
            } else {
                format!("{}'s turn", name_of(snapshot, *player_id, me))
            };
            format!("Round {}: {} - locate {}", round, whose, describe_question(question))
        }
        SessionEvent::AllFailed(country) => format!("Nobody found {}", country),
        SessionEvent::GameStarted => "Game started".to_string(),
        SessionEvent::GameFinished { winner: Some(winner) } => {
            format!("Game over - winner: {}", name_of(snapshot, *winner, me))
        }
        SessionEvent::GameFinished { winner: None } => "Game over".to_string(),
        SessionEvent::RoomClosed => "Room closed".to_string(),
        SessionEvent::Error(reason) => format!("! {}", reason),
        SessionEvent::RoomUpdated(_) | SessionEvent::PlayerUpdated(_) => return None,
    };
    Some(line)
}

fn describe_move(mv: &Move, snapshot: &SessionSnapshot, me: PlayerId) -> Option<String> {
    let who = name_of(snapshot, mv.player_id, me);
    let target = mv
        .target
        .as_ref()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "?".to_string());
    let line = match mv.kind {
        MoveKind::Guess if mv.correct => format!("{} found {}", who, target),
        MoveKind::Guess => format!("{} missed {}", who, target),
        MoveKind::Timeout => format!("{} ran out of time on {}", who, target),
        MoveKind::Surrender => format!("{} surrendered", who),
        MoveKind::AllFailed => return None,
    };
    Some(line)
}

fn describe_question(question: &Question) -> String {
    match question.mode {
        QuestionMode::Flag => format!("the flag of {}", question.target),
        QuestionMode::Name => question.target.to_string(),
    }
}

pub fn render_status(snapshot: &SessionSnapshot, me: PlayerId) -> String {
    let Some(room) = &snapshot.room else {
        return "Not in a room (create or join one)".to_string();
    };
    let status = match room.status {
        RoomStatus::Waiting => "waiting",
        RoomStatus::Playing => "playing",
        RoomStatus::Finished => "finished",
    };

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Room {} [{}] {}/{} players",
        room.code,
        status,
        snapshot.roster.len(),
        room.max_players
    );

    let turn = snapshot.current_turn().filter(|_| room.status == RoomStatus::Playing);
    for player in &snapshot.roster {
        let marker = if Some(player.player_id) == turn { '*' } else { ' ' };
        let mut tags = Vec::new();
        if room.is_host(player.player_id) {
            tags.push("host");
        }
        if player.player_id == me {
            tags.push("you");
        }
        let tags = if tags.is_empty() {
            String::new()
        } else {
            format!(" ({})", tags.join(", "))
        };
        let state = match room.status {
            RoomStatus::Waiting if player.ready => "ready".to_string(),
            RoomStatus::Waiting => "not ready".to_string(),
            _ => format!("score {} lives {}", player.score, player.lives),
        };
        let _ = writeln!(out, " {} {}{}  {}", marker, player.name, tags, state);
    }

    if let (RoomStatus::Playing, Some(game)) = (room.status, &snapshot.game_state) {
        let _ = write!(out, "Round {}: locate {}", game.round, describe_question(&game.question));
        if let Some(secs) = snapshot.time_remaining {
            let _ = write!(out, " ({}s left)", secs);
        }
        if snapshot.resolving {
            out.push_str(" [resolving]");
        }
        out.push('\n');
    }

    let correct = snapshot
        .country_status
        .values()
        .filter(|s| **s == CountryStatus::Correct)
        .count();
    let failed = snapshot.country_status.len() - correct;
    if correct + failed > 0 {
        let _ = writeln!(out, "Resolved: {} found, {} failed", correct, failed);
    }
    out.trim_end().to_string()
}

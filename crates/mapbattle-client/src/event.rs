use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use mapbattle_common::SessionEvent;

#[derive(Debug)]
pub enum AppEvent {
    Input(String),
    InputClosed,
    Session(SessionEvent),
    Tick,
}

pub async fn event_loop(
    mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    event_tx: mpsc::Sender<AppEvent>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut tick_interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        let event = tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => AppEvent::Input(line),
                Ok(None) | Err(_) => {
                    stdin_open = false;
                    AppEvent::InputClosed
                }
            },
            Some(event) = session_rx.recv() => {
                AppEvent::Session(event)
            }
            _ = tick_interval.tick() => {
                AppEvent::Tick
            }
        };

        if event_tx.send(event).await.is_err() {
            break;
        }
    }
}

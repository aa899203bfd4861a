use super::ClipRequest;
use crate::error::{Result, TriggerError};
use crate::events::{EventBus, RollcamEvent};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a line of keyboard input asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyCommand {
    SaveClip,
    Quit,
    Ignore,
}

fn parse_line(line: &str) -> KeyCommand {
    match line.trim().to_ascii_lowercase().as_str() {
        "s" => KeyCommand::SaveClip,
        "q" | "quit" | "exit" => KeyCommand::Quit,
        _ => KeyCommand::Ignore,
    }
}

/// Line reader on standard input: `s` + newline saves a clip for every
/// camera, `q` + newline initiates shutdown.
pub struct KeyboardTrigger {
    requests: mpsc::Sender<ClipRequest>,
    events: EventBus,
    cancel: CancellationToken,
}

impl KeyboardTrigger {
    pub fn new(
        requests: mpsc::Sender<ClipRequest>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            requests,
            events,
            cancel,
        }
    }

    /// Start listening for input lines
    pub fn start(&self) -> Result<()> {
        info!("Keyboard trigger active: 's' + ENTER saves a clip, 'q' + ENTER quits");

        let requests = self.requests.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();

            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Keyboard trigger stopping");
                        break;
                    }
                    line = lines.next_line() => line,
                };

                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("Stdin closed; keyboard trigger exiting");
                        break;
                    }
                    Err(e) => {
                        warn!("Keyboard read error: {}", e);
                        break;
                    }
                };

                match parse_line(&line) {
                    KeyCommand::SaveClip => {
                        info!("Keyboard trigger: saving clip for all cameras");
                        if requests.send(ClipRequest::for_all()).await.is_err() {
                            warn!("{}", TriggerError::ChannelClosed);
                            break;
                        }
                    }
                    KeyCommand::Quit => {
                        let _ = events.publish(RollcamEvent::ShutdownRequested {
                            timestamp: Utc::now(),
                            reason: "user requested via keyboard".to_string(),
                        });
                        break;
                    }
                    KeyCommand::Ignore => {
                        debug!("Ignoring keyboard input: {:?}", line);
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop the input reader
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

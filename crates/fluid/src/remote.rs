//! Line-delimited JSON messages from the relay, and the channel that carries
//! them from the network thread into the frame tick.

use std::fmt;

use crossbeam_channel::{Receiver, Sender};
use fluidconfig::Color;
use serde::Deserialize;

use crate::splat::{Pattern, UnknownPattern};

/// Upper bound on the random splats one relay message may request.
pub const MAX_REMOTE_SPLATS: u32 = 64;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed relay message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("'{0}' input is missing a position")]
    MissingPosition(InputEvent),
    #[error("non-finite value in '{0}' message")]
    NonFinite(&'static str),
    #[error("{0} random splats requested; at most {} are allowed", MAX_REMOTE_SPLATS)]
    TooManySplats(u32),
    #[error(transparent)]
    UnknownPattern(#[from] UnknownPattern),
    #[error("remote inbox is closed")]
    Disconnected,
}

/// One inbound relay message. The `role` field some clients send is ignored.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteMessage {
    RemoteInput(RemoteInput),
    Command(RemoteCommand),
    Beat { intensity: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputEvent {
    Down,
    Move,
    Up,
}

impl fmt::Display for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputEvent::Down => "down",
            InputEvent::Move => "move",
            InputEvent::Up => "up",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Controllers identify their pointers with either strings or numbers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ControllerId {
    Text(String),
    Number(i64),
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerId::Text(text) => f.write_str(text),
            ControllerId::Number(number) => write!(f, "{number}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInput {
    pub event_type: InputEvent,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(alias = "controllerId")]
    pub pointer_id: ControllerId,
    #[serde(default)]
    pub color: Option<Color>,
    #[serde(default)]
    pub colorful: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "command", content = "parameters", rename_all = "snake_case")]
pub enum RemoteCommand {
    RandomSplats { count: u32 },
    PresetPattern { pattern: String },
    SetSplatColor { color: Color },
    SetRainbowMode { enabled: bool },
}

impl RemoteMessage {
    /// Parses and validates one line. A message that fails here must not
    /// touch engine state.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let message: RemoteMessage = serde_json::from_str(line)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            RemoteMessage::RemoteInput(input) => {
                match (input.event_type, input.position) {
                    (InputEvent::Up, _) => {}
                    (event, None) => return Err(ProtocolError::MissingPosition(event)),
                    (_, Some(position)) => {
                        if !position.x.is_finite() || !position.y.is_finite() {
                            return Err(ProtocolError::NonFinite("remote_input"));
                        }
                    }
                }
                Ok(())
            }
            RemoteMessage::Command(RemoteCommand::PresetPattern { pattern }) => {
                pattern.parse::<Pattern>()?;
                Ok(())
            }
            RemoteMessage::Command(RemoteCommand::RandomSplats { count })
                if *count > MAX_REMOTE_SPLATS =>
            {
                Err(ProtocolError::TooManySplats(*count))
            }
            RemoteMessage::Command(_) => Ok(()),
            RemoteMessage::Beat { intensity } => {
                if intensity.is_finite() {
                    Ok(())
                } else {
                    Err(ProtocolError::NonFinite("beat"))
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RemoteMessage::RemoteInput(_) => "remote_input",
            RemoteMessage::Command(_) => "command",
            RemoteMessage::Beat { .. } => "beat",
        }
    }
}

/// Number of random splats a beat of the given intensity triggers, capped at
/// [`MAX_REMOTE_SPLATS`].
pub fn beat_splats(intensity: f32) -> u32 {
    (intensity * 5.0).floor().clamp(0.0, MAX_REMOTE_SPLATS as f32) as u32
}

#[derive(Clone, Debug, PartialEq)]
pub enum RemoteEvent {
    Message { session: u64, message: RemoteMessage },
    SessionClosed { session: u64 },
}

/// Producer half of the remote inbox, owned by the network thread.
#[derive(Clone, Debug)]
pub struct RemoteSender {
    sender: Sender<RemoteEvent>,
}

pub fn remote_channel() -> (RemoteSender, Receiver<RemoteEvent>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (RemoteSender { sender }, receiver)
}

impl RemoteSender {
    /// Parses `line` and queues it. Malformed lines are logged and dropped.
    pub fn send_line(&self, session: u64, line: &str) -> Result<(), ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let message = match RemoteMessage::parse(line) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(session, %err, "dropping relay message");
                return Err(err);
            }
        };
        tracing::trace!(session, kind = message.kind(), "relay message");
        self.send(RemoteEvent::Message { session, message })
    }

    pub fn close_session(&self, session: u64) -> Result<(), ProtocolError> {
        tracing::debug!(session, "relay session closed");
        self.send(RemoteEvent::SessionClosed { session })
    }

    fn send(&self, event: RemoteEvent) -> Result<(), ProtocolError> {
        self.sender
            .send(event)
            .map_err(|_| ProtocolError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_input_with_either_id_field() {
        let message = RemoteMessage::parse(
            r#"{"type":"remote_input","role":"controller","eventType":"down",
                "position":{"x":0.25,"y":0.75},"pointerId":"p1",
                "color":{"r":255,"g":0,"b":0},"colorful":false}"#,
        )
        .unwrap();
        let RemoteMessage::RemoteInput(input) = message else {
            panic!("expected remote input");
        };
        assert_eq!(input.event_type, InputEvent::Down);
        assert_eq!(input.pointer_id, ControllerId::Text("p1".into()));
        assert_eq!(input.position, Some(Position { x: 0.25, y: 0.75 }));
        assert_eq!(input.color, Some(Color::new(255.0, 0.0, 0.0)));
        assert_eq!(input.colorful, Some(false));

        let message = RemoteMessage::parse(
            r#"{"type":"remote_input","eventType":"up","controllerId":7}"#,
        )
        .unwrap();
        let RemoteMessage::RemoteInput(input) = message else {
            panic!("expected remote input");
        };
        assert_eq!(input.pointer_id.to_string(), "7");
    }

    #[test]
    fn parses_commands() {
        let cases = [
            (
                r#"{"type":"command","command":"random_splats","parameters":{"count":4}}"#,
                RemoteCommand::RandomSplats { count: 4 },
            ),
            (
                r#"{"type":"command","command":"preset_pattern","parameters":{"pattern":"corners"}}"#,
                RemoteCommand::PresetPattern {
                    pattern: "corners".into(),
                },
            ),
            (
                r##"{"type":"command","command":"set_splat_color","parameters":{"color":"#00ff00"}}"##,
                RemoteCommand::SetSplatColor {
                    color: Color::new(0.0, 255.0, 0.0),
                },
            ),
            (
                r#"{"type":"command","command":"set_rainbow_mode","parameters":{"enabled":false}}"#,
                RemoteCommand::SetRainbowMode { enabled: false },
            ),
        ];
        for (line, expected) in cases {
            assert_eq!(
                RemoteMessage::parse(line).unwrap(),
                RemoteMessage::Command(expected)
            );
        }
    }

    #[test]
    fn beat_intensity_maps_to_splat_count() {
        let message = RemoteMessage::parse(r#"{"type":"beat","intensity":0.9}"#).unwrap();
        assert_eq!(message, RemoteMessage::Beat { intensity: 0.9 });
        assert_eq!(beat_splats(0.9), 4);
        assert_eq!(beat_splats(1.0), 5);
        assert_eq!(beat_splats(-1.0), 0);
        assert_eq!(beat_splats(1e30), MAX_REMOTE_SPLATS);
    }

    #[test]
    fn random_splat_commands_are_bounded() {
        let line = |count: u64| {
            format!(
                r#"{{"type":"command","command":"random_splats","parameters":{{"count":{count}}}}}"#
            )
        };
        assert_eq!(
            RemoteMessage::parse(&line(u64::from(MAX_REMOTE_SPLATS))).unwrap(),
            RemoteMessage::Command(RemoteCommand::RandomSplats {
                count: MAX_REMOTE_SPLATS
            })
        );
        assert!(matches!(
            RemoteMessage::parse(&line(u64::from(u32::MAX))),
            Err(ProtocolError::TooManySplats(u32::MAX))
        ));
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in [
            "not json",
            r#"{"type":"unknown"}"#,
            r#"{"type":"command","command":"self_destruct","parameters":{}}"#,
            r#"{"type":"command","command":"preset_pattern","parameters":{"pattern":"spiral"}}"#,
            r#"{"type":"remote_input","eventType":"move","pointerId":"a"}"#,
            r#"{"type":"remote_input","eventType":"hover","position":{"x":0,"y":0},"pointerId":"a"}"#,
        ] {
            assert!(RemoteMessage::parse(line).is_err(), "accepted {line}");
        }
    }

    #[test]
    fn sender_drops_malformed_lines() {
        let (sender, receiver) = remote_channel();
        assert!(sender.send_line(1, "{broken").is_err());
        sender.send_line(1, "   ").unwrap();
        assert!(receiver.try_recv().is_err());

        sender
            .send_line(1, r#"{"type":"beat","intensity":0.5}"#)
            .unwrap();
        sender.close_session(1).unwrap();
        assert_eq!(
            receiver.try_recv().unwrap(),
            RemoteEvent::Message {
                session: 1,
                message: RemoteMessage::Beat { intensity: 0.5 }
            }
        );
        assert_eq!(
            receiver.try_recv().unwrap(),
            RemoteEvent::SessionClosed { session: 1 }
        );

        drop(receiver);
        assert!(matches!(
            sender.close_session(1),
            Err(ProtocolError::Disconnected)
        ));
    }
}

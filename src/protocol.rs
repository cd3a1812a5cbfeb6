//! JSON-lines protocol between the director and its clients.
//!
//! Clients send commands; the director sends camera info, command acks and
//! per-frame subject broadcasts. One JSON object per line.

use std::io::BufRead;

use anyhow::{anyhow, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::camera::CameraInfo;
use crate::tracker::TrackedSubject;

/// 1行の最大長
const MAX_LINE_LENGTH: usize = 1024 * 1024;

// --- Message types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    StartTracking,
    StopTracking,
    SetActiveCamera,
}

/// Client → director
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Command {
        command: CommandKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        camera_id: Option<String>,
    },
}

/// 検証済みのコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartTracking,
    StopTracking,
    SetActiveCamera(String),
}

impl ClientMessage {
    pub fn command(command: Command) -> Self {
        match command {
            Command::StartTracking => ClientMessage::Command {
                command: CommandKind::StartTracking,
                camera_id: None,
            },
            Command::StopTracking => ClientMessage::Command {
                command: CommandKind::StopTracking,
                camera_id: None,
            },
            Command::SetActiveCamera(id) => ClientMessage::Command {
                command: CommandKind::SetActiveCamera,
                camera_id: Some(id),
            },
        }
    }

    pub fn into_command(self) -> Result<Command> {
        match self {
            ClientMessage::Command { command, camera_id } => match command {
                CommandKind::StartTracking => Ok(Command::StartTracking),
                CommandKind::StopTracking => Ok(Command::StopTracking),
                CommandKind::SetActiveCamera => camera_id
                    .filter(|id| !id.is_empty())
                    .map(Command::SetActiveCamera)
                    .ok_or_else(|| anyhow!("set_active_camera requires camera_id")),
            },
        }
    }
}

/// Director → client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    CamerasInfo { cameras: Vec<CameraInfo> },
    CommandAck { ok: bool, error: Option<String> },
    /// 1フレーム分の追跡結果
    Persons { timestamp: i64, persons: Vec<TrackedSubject> },
}

// --- Line codec helpers ---

pub type MessageStream<S> = Framed<S, LinesCodec>;

/// JSON-lines のメッセージストリームを作る
pub fn message_stream<S: AsyncRead + AsyncWrite>(stream: S) -> MessageStream<S> {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

pub fn encode<T: Serialize>(msg: &T) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line)?)
}

/// Send a serializable message as one line.
pub async fn send_message<S, T>(sink: &mut S, msg: &T) -> Result<()>
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
    T: Serialize,
{
    sink.send(encode(msg)?).await?;
    Ok(())
}

/// Read client commands line by line from a blocking reader and forward them.
///
/// Returns at end of input or once the receiving side is gone. Invalid lines
/// are logged and skipped. Blocks the calling thread; run it on a dedicated
/// thread, not on the runtime.
pub fn forward_commands<R: BufRead>(reader: R, commands: &mpsc::Sender<Command>) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let command = match decode::<ClientMessage>(&line).and_then(ClientMessage::into_command) {
            Ok(command) => command,
            Err(e) => {
                warn!("rejected client message: {e:#}");
                continue;
            }
        };
        if commands.blocking_send(command).is_err() {
            break;
        }
    }
    Ok(())
}

/// Receive and deserialize a message. `None` when the peer closed the stream.
pub async fn recv_message<S, T>(stream: &mut S) -> Result<Option<T>>
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
    T: DeserializeOwned,
{
    loop {
        match stream.next().await {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => return decode(&line).map(Some),
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Activity, SubjectSize};

    #[test]
    fn test_command_json() {
        let msg: ClientMessage =
            decode(r#"{"type": "command", "command": "set_active_camera", "camera_id": "cam2"}"#).unwrap();
        assert_eq!(msg.into_command().unwrap(), Command::SetActiveCamera("cam2".into()));

        let msg: ClientMessage = decode(r#"{"type": "command", "command": "stop_tracking"}"#).unwrap();
        assert_eq!(msg.into_command().unwrap(), Command::StopTracking);

        let line = encode(&ClientMessage::command(Command::StartTracking)).unwrap();
        assert_eq!(line, r#"{"type":"command","command":"start_tracking"}"#);
    }

    #[test]
    fn test_set_active_camera_without_id_rejected() {
        let msg: ClientMessage = decode(r#"{"type": "command", "command": "set_active_camera"}"#).unwrap();
        assert!(msg.into_command().is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(decode::<ClientMessage>(r#"{"type": "command", "command": "self_destruct"}"#).is_err());
    }

    #[test]
    fn test_persons_json() {
        let msg = ServerMessage::Persons {
            timestamp: 1_700_000_000_000,
            persons: vec![TrackedSubject {
                subject_id: "person_1".into(),
                position: [0.4, 0.0, 0.0],
                velocity: [0.4, 0.0, 0.0],
                direction: [1.0, 0.0, 0.0],
                activity: Activity::Running,
                size: SubjectSize {
                    height: 1.7,
                    width: 0.5,
                    depth: 0.3,
                    pixel_to_world: Some(0.0085),
                },
            }],
        };
        let json: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "persons");
        assert_eq!(json["persons"][0]["activity"], "running");
        assert_eq!(json["persons"][0]["subject_id"], "person_1");
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = message_stream(client);
        let mut server = message_stream(server);

        send_message(&mut client, &ClientMessage::command(Command::StopTracking)).await.unwrap();
        let received: ClientMessage = recv_message(&mut server).await.unwrap().unwrap();
        assert_eq!(received.into_command().unwrap(), Command::StopTracking);

        send_message(&mut server, &ServerMessage::CommandAck { ok: true, error: None }).await.unwrap();
        let ack: serde_json::Value = recv_message(&mut client).await.unwrap().unwrap();
        assert_eq!(ack["type"], "command_ack");

        drop(server);
        assert!(recv_message::<_, serde_json::Value>(&mut client).await.unwrap().is_none());
    }

    #[test]
    fn test_forward_commands_until_end_of_input() {
        let input = concat!(
            "{\"type\": \"command\", \"command\": \"start_tracking\"}\n",
            "\n",
            "not json\n",
            "{\"type\": \"command\", \"command\": \"set_active_camera\"}\n",
            "{\"type\": \"command\", \"command\": \"set_active_camera\", \"camera_id\": \"side\"}\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        forward_commands(input.as_bytes(), &tx).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Command::StartTracking);
        assert_eq!(rx.try_recv().unwrap(), Command::SetActiveCamera("side".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_commands_returns_when_receiver_closed() {
        let line = "{\"type\": \"command\", \"command\": \"stop_tracking\"}\n";
        let input = line.repeat(100);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        // 受信側が無ければ残りの入力を読まずに戻る
        forward_commands(input.as_bytes(), &tx).unwrap();
        assert!(tx.is_closed());
    }
}

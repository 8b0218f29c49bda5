//! Newline-delimited JSON packets exchanged between clients and the server.
//!
//! Every packet is one JSON object of the form `{"type": ..., "payload": {...}}`
//! followed by `\n`.

use std::{fmt::Display, io, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest line accepted from a peer, newline excluded.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// An encoded, newline-terminated packet. Cloning is cheap so a single
/// encoding can be fanned out to every connection.
pub type Frame = Arc<[u8]>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed packet: {0}")]
    Malformed(serde_json::Error),
    #[error("failed to encode packet: {0}")]
    Encode(serde_json::Error),
    #[error("frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientPacket {
    Register(Credentials),
    Login(Credentials),
    Chat {
        content: String,
    },
    Search(SearchQuery),
    History {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<i64>,
    },
    Users {},
    Quit {},
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatBroadcast {
    pub user_id: String,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerPacket {
    Response(Response),
    Broadcast(ChatBroadcast),
    System { message: String },
}

impl ServerPacket {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::Response(Response {
            success: true,
            message: message.into(),
            data: None,
        })
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self::Response(Response {
            success: true,
            message: message.into(),
            data: Some(data),
        })
    }

    pub fn error(reason: impl Display) -> Self {
        Self::Response(Response {
            success: false,
            message: format!("error: {reason}"),
            data: None,
        })
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

/// Encodes a packet once into a shareable frame, newline included.
pub fn encode_frame<T: Serialize>(packet: &T) -> Result<Frame, ProtocolError> {
    let mut encoded = serde_json::to_vec(packet).map_err(ProtocolError::Encode)?;
    encoded.push(b'\n');
    Ok(Frame::from(encoded))
}

/// Decodes a single line, tolerating a trailing `\n` or `\r\n`.
pub fn decode_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(trim_line_ending(line)).map_err(ProtocolError::Malformed)
}

/// Reads the next packet, skipping blank lines. `Ok(None)` means the peer closed
/// the stream. A malformed line is consumed in full, so the caller may keep reading.
pub async fn read_packet<R, T>(reader: &mut R, max_len: usize) -> Result<Option<T>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let mut limited = (&mut *reader).take(max_len as u64 + 1);
        let bytes = limited.read_until(b'\n', &mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        if !line.ends_with(b"\n") && line.len() > max_len {
            return Err(ProtocolError::FrameTooLong { limit: max_len });
        }

        if line.trim_ascii().is_empty() {
            continue;
        }

        return decode_frame(&line).map(Some);
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

pub async fn write_packet<W, T>(writer: &mut W, packet: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(packet)?;
    write_frame(writer, &frame).await?;
    Ok(())
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn decodes_client_packets_from_wire_shape() {
        let register: ClientPacket = decode_frame(
            br#"{"type":"register","payload":{"username":"alice","password":"pw"}}"#,
        )
        .expect("register");
        assert_eq!(
            register,
            ClientPacket::Register(Credentials {
                username: "alice".into(),
                password: "pw".into(),
            })
        );

        let users: ClientPacket =
            decode_frame(b"{\"type\":\"users\",\"payload\":{}}\r\n").expect("users");
        assert_eq!(users, ClientPacket::Users {});

        let history: ClientPacket =
            decode_frame(br#"{"type":"history","payload":{}}"#).expect("history");
        assert_eq!(history, ClientPacket::History { limit: None });

        let search: ClientPacket = decode_frame(
            br#"{"type":"search","payload":{"username":"bob","from":"2024-05-01T12:00:00Z"}}"#,
        )
        .expect("search");
        assert_eq!(
            search,
            ClientPacket::Search(SearchQuery {
                username: Some("bob".into()),
                from: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
                ..SearchQuery::default()
            })
        );
    }

    #[test]
    fn unknown_type_is_malformed() {
        let result = decode_frame::<ClientPacket>(br#"{"type":"shout","payload":{}}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn response_omits_absent_data() {
        let encoded = encode_frame(&ServerPacket::error("nope")).expect("encode");
        let value: Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(
            value,
            json!({"type": "response", "payload": {"success": false, "message": "error: nope"}})
        );
        assert_eq!(encoded.last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn malformed_line_does_not_poison_the_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"not json\n\n").await.expect("write");
        write_packet(&mut writer, &ClientPacket::Quit {})
            .await
            .expect("write quit");

        let first = read_packet::<_, ClientPacket>(&mut reader, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(first, Err(ProtocolError::Malformed(_))));

        let second = read_packet::<_, ClientPacket>(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .expect("read")
            .expect("packet");
        assert_eq!(second, ClientPacket::Quit {});

        drop(writer);
        let eof = read_packet::<_, ClientPacket>(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .expect("read eof");
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer.write_all(&[b'x'; 64]).await.expect("write");
        writer.write_all(b"\n").await.expect("write newline");

        let result = read_packet::<_, ClientPacket>(&mut reader, 16).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLong { limit: 16 })));
    }
}

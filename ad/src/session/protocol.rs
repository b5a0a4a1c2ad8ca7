//! Daemon control protocol: uvarint-length-delimited JSON envelopes
//!
//! Each message on the control socket is `uvarint length | json object`,
//! the object being `{"type": <kind>, "data": {...}}`. The enums below are
//! the complete kind set; unknown kinds fail decoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is a protocol violation
pub const MAX_FRAME: u64 = 16 * 1024 * 1024;

/// Protocol failure modes
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("socket io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u64),

    #[error("connection closed mid-frame")]
    UnexpectedEof,
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// A spawn request as carried over the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub parent_turn: u64,
    pub parent_profile: String,
    pub child_profile: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    pub task: String,
    #[serde(default)]
    pub issues: Vec<u64>,
    #[serde(default)]
    pub read_only: bool,
    /// Block the RPC until the child reaches a terminal status
    #[serde(default)]
    pub wait: bool,
}

/// Messages from a client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to the event stream, replaying the journal from a byte offset
    Attach {
        #[serde(default)]
        replay_from: Option<u64>,
    },
    /// Cancel the root loop runtime
    Cancel {},
    /// Launch a child spawn through the orchestrator
    Spawn { request: SpawnRequest },
    /// Record a wait signal for a turn
    Wait { turn_id: u64 },
    /// Liveness probe
    Ping {},
}

/// Messages from the daemon to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Verbatim agent stdout chunk
    Raw { data: String },
    /// Normalised agent event, opaque to the daemon
    Event { json: serde_json::Value },
    /// One turn ended
    Finished { exit_code: i32, duration_ns: u64 },
    /// The loop run ended
    Done {
        #[serde(default)]
        error: Option<String>,
    },
    /// Generic acknowledgement
    Ok {},
    /// Reply to `ping`
    Pong {},
    /// Reply to `spawn`
    SpawnResult {
        ok: bool,
        #[serde(default)]
        spawn_id: Option<u64>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Request-level failure
    Error { message: String },
}

/// Encode a value as one frame (uvarint length + JSON)
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut frame = Vec::with_capacity(json.len() + 10);
    put_uvarint(&mut frame, json.len() as u64);
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Write one frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on clean EOF at a frame boundary
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match read_uvarint(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len > MAX_FRAME {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Append a LEB128 unsigned varint
pub fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a LEB128 unsigned varint from a buffer, returning (value, bytes read)
pub fn get_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Read a LEB128 unsigned varint; `Ok(None)` on EOF before the first byte
async fn read_uvarint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && first => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::UnexpectedEof);
            }
            Err(e) => return Err(ProtocolError::Io(e)),
        }
        first = false;

        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift >= 64 {
            return Err(ProtocolError::FrameTooLarge(u64::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_serializes_with_type_and_data() {
        let msg = ClientMessage::Attach { replay_from: Some(128) };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"attach","data":{"replay_from":128}}"#);
    }

    #[test]
    fn test_ping_pong_shapes() {
        assert_eq!(
            serde_json::to_string(&ClientMessage::Ping {}).unwrap(),
            r#"{"type":"ping","data":{}}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerMessage::Pong {}).unwrap(),
            r#"{"type":"pong","data":{}}"#
        );
    }

    #[test]
    fn test_raw_event_round_trip() {
        let msg = ServerMessage::Raw {
            data: "hello\n".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"raw","data":{"data":"hello\n"}}"#);
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_finished_fields() {
        let msg = ServerMessage::Finished {
            exit_code: 0,
            duration_ns: 1_500_000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"finished","data":{"exit_code":0,"duration_ns":1500000}}"#);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"reboot","data":{}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_uvarint_round_trip_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, value);
            let (decoded, used) = get_uvarint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_encode_frame_prefixes_length() {
        let frame = encode_frame(&ServerMessage::Ok {}).unwrap();
        let (len, used) = get_uvarint(&frame).unwrap();
        assert_eq!(len as usize, frame.len() - used);
        let value: ServerMessage = serde_json::from_slice(&frame[used..]).unwrap();
        assert_eq!(value, ServerMessage::Ok {});
    }

    #[tokio::test]
    async fn test_frame_stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &ClientMessage::Wait { turn_id: 9 }).await.unwrap();
        write_frame(&mut a, &ClientMessage::Cancel {}).await.unwrap();
        drop(a);

        let first: ClientMessage = read_frame(&mut b).await.unwrap().unwrap();
        let second: ClientMessage = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first, ClientMessage::Wait { turn_id: 9 });
        assert_eq!(second, ClientMessage::Cancel {});

        // Clean EOF at a frame boundary
        let done: Option<ClientMessage> = read_frame(&mut b).await.unwrap();
        assert!(done.is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = encode_frame(&ServerMessage::Ok {}).unwrap();
        a.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(a);

        let err = read_frame::<_, ServerMessage>(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut buf = Vec::new();
        put_uvarint(&mut buf, MAX_FRAME + 1);
        a.write_all(&buf).await.unwrap();
        drop(a);

        let err = read_frame::<_, ServerMessage>(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn uvarint_round_trips(value: u64) {
                let mut buf = Vec::new();
                put_uvarint(&mut buf, value);
                let (decoded, used) = get_uvarint(&buf).unwrap();
                prop_assert_eq!(decoded, value);
                prop_assert_eq!(used, buf.len());
            }

            #[test]
            fn envelope_encode_decode_is_identity(data in "[ -~]{0,64}", exit_code: i32) {
                let messages = vec![
                    ServerMessage::Raw { data: data.clone() },
                    ServerMessage::Finished { exit_code, duration_ns: 42 },
                    ServerMessage::Done { error: Some(data) },
                ];
                for msg in messages {
                    let frame = encode_frame(&msg).unwrap();
                    let (len, used) = get_uvarint(&frame).unwrap();
                    prop_assert_eq!(len as usize, frame.len() - used);
                    let back: ServerMessage = serde_json::from_slice(&frame[used..]).unwrap();
                    prop_assert_eq!(back, msg);
                }
            }
        }
    }
}

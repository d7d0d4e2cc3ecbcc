use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use replicator_platform::screen::PixelBuffer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header size: 1 (type) + 4 (payload length) = 5 bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (256 MB)
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Frame payload prefix: 4 (width) + 4 (height) = 8 bytes
pub const FRAME_HEADER_SIZE: usize = 8;

// --- Message Types ---

// Worker -> viewer
pub const FRAME: u8 = 0x01;
pub const NO_FRAME: u8 = 0x02;
pub const UNAVAILABLE: u8 = 0x03;

// Viewer -> worker
pub const STOP: u8 = 0x10;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { size: usize },
    #[error("invalid message type: 0x{0:02x}")]
    InvalidType(u8),
    #[error("malformed frame: {0}")]
    BadFrame(&'static str),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded worker protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

/// Payload of an UNAVAILABLE message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailable {
    pub reason: String,
}

/// What a message means to the receiving side.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Frame(PixelBuffer),
    NoFrame,
    Unavailable(String),
    Stop,
}

impl Message {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Encode into an existing BytesMut buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.msg_type);
        buf.put_u32_le(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
    }

    /// Parse the payload as JSON
    pub fn parse_json<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Interpret the message, validating frame payloads.
    pub fn into_event(self) -> Result<WorkerEvent, ProtocolError> {
        match self.msg_type {
            FRAME => decode_frame(self.payload).map(WorkerEvent::Frame),
            NO_FRAME => Ok(WorkerEvent::NoFrame),
            UNAVAILABLE => {
                let body: Unavailable = self.parse_json()?;
                Ok(WorkerEvent::Unavailable(body.reason))
            }
            STOP => Ok(WorkerEvent::Stop),
            other => Err(ProtocolError::InvalidType(other)),
        }
    }
}

// --- Message builders ---

/// FRAME for a captured buffer, NO_FRAME for `None`.
pub fn frame(frame: Option<&PixelBuffer>) -> Message {
    match frame {
        Some(buffer) => {
            let mut payload = Vec::with_capacity(FRAME_HEADER_SIZE + buffer.data().len());
            payload.put_u32_le(buffer.width());
            payload.put_u32_le(buffer.height());
            payload.extend_from_slice(buffer.data());
            Message::new(FRAME, payload)
        }
        None => Message::new(NO_FRAME, Vec::new()),
    }
}

pub fn unavailable(reason: &str) -> Result<Message, ProtocolError> {
    let payload = serde_json::to_vec(&Unavailable {
        reason: reason.to_string(),
    })?;
    Ok(Message::new(UNAVAILABLE, payload))
}

pub fn stop() -> Message {
    Message::new(STOP, Vec::new())
}

fn decode_frame(mut payload: Vec<u8>) -> Result<PixelBuffer, ProtocolError> {
    if payload.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::BadFrame("missing dimensions"));
    }
    let mut cursor = &payload[..];
    let width = cursor.get_u32_le();
    let height = cursor.get_u32_le();

    let data = payload.split_off(FRAME_HEADER_SIZE);
    PixelBuffer::from_raw(width, height, data)
        .ok_or(ProtocolError::BadFrame("sample count does not match dimensions"))
}

// --- Stream I/O ---

/// Write one message to a blocking stream and flush it.
pub fn write_message<W: Write + ?Sized>(writer: &mut W, msg: &Message) -> std::io::Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = msg.msg_type;
    header[1..].copy_from_slice(&(msg.payload.len() as u32).to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(&msg.payload)?;
    writer.flush()
}

/// Read one message from a blocking stream. `Ok(None)` on a clean end of
/// stream between messages.
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    if reader.read(&mut header[..1])? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..])?;

    let (msg_type, payload_len) = parse_header(&header)?;
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Message::new(msg_type, payload)))
}

/// Async counterpart of [`read_message`].
pub async fn read_message_async<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let (msg_type, payload_len) = parse_header(&header)?;
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Message::new(msg_type, payload)))
}

/// Async counterpart of [`write_message`].
pub async fn write_message_async<W>(writer: &mut W, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    msg.encode_into(&mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await
}

fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(u8, usize), ProtocolError> {
    let mut cursor = &header[..];
    let msg_type = cursor.get_u8();
    let payload_len = cursor.get_u32_le() as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge { size: payload_len });
    }
    Ok((msg_type, payload_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_layout() {
        let mut buf = BytesMut::new();
        Message::new(FRAME, vec![9; 300]).encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE + 300);
        assert_eq!(buf[0], FRAME);
        assert_eq!(&buf[1..5], &300u32.to_le_bytes());
    }

    #[test]
    fn test_read_rejects_oversized_payload() {
        let mut buf = vec![FRAME];
        buf.extend_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes());
        assert!(matches!(
            read_message(&mut &buf[..]),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_multiple_messages_in_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &frame(None)).unwrap();
        write_message(&mut buf, &stop()).unwrap();

        let mut reader = &buf[..];
        assert_eq!(read_message(&mut reader).unwrap().unwrap().msg_type, NO_FRAME);
        assert_eq!(read_message(&mut reader).unwrap().unwrap().msg_type, STOP);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_frame_message_carries_dimensions() {
        let data: Vec<u8> = (0..8 * 2 * 3).map(|i| i as u8).collect();
        let buffer = PixelBuffer::from_raw(8, 2, data).unwrap();

        let msg = frame(Some(&buffer));
        assert_eq!(msg.msg_type, FRAME);
        assert_eq!(msg.payload.len(), FRAME_HEADER_SIZE + 48);

        match msg.into_event().unwrap() {
            WorkerEvent::Frame(decoded) => assert_eq!(decoded, buffer),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_frame_with_wrong_sample_count_rejected() {
        let mut payload = Vec::new();
        payload.put_u32_le(8);
        payload.put_u32_le(2);
        payload.extend_from_slice(&[0; 47]);
        assert!(matches!(
            Message::new(FRAME, payload).into_event(),
            Err(ProtocolError::BadFrame(_))
        ));

        assert!(matches!(
            Message::new(FRAME, vec![1, 2, 3]).into_event(),
            Err(ProtocolError::BadFrame(_))
        ));
    }

    #[test]
    fn test_unavailable_reason() {
        let msg = unavailable("no unique window to capture").unwrap();
        assert_eq!(msg.msg_type, UNAVAILABLE);
        assert_eq!(
            msg.into_event().unwrap(),
            WorkerEvent::Unavailable("no unique window to capture".to_string())
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(matches!(
            Message::new(0x7f, Vec::new()).into_event(),
            Err(ProtocolError::InvalidType(0x7f))
        ));
    }

    #[test]
    fn test_blocking_stream_clean_eof() {
        let mut buf = Vec::new();
        write_message(&mut buf, &stop()).unwrap();

        let mut reader = &buf[..];
        assert_eq!(read_message(&mut reader).unwrap(), Some(stop()));
        assert_eq!(read_message(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_blocking_stream_truncated_payload() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::new(NO_FRAME, vec![0; 10])).unwrap();
        buf.truncate(buf.len() - 3);

        let mut reader = &buf[..];
        assert!(matches!(read_message(&mut reader), Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn test_async_stream_delivers_in_order() {
        let (mut worker_side, mut viewer_side) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            let buffer = PixelBuffer::filled(16, 4, 0xAB);
            write_message_async(&mut worker_side, &frame(Some(&buffer))).await.unwrap();
            write_message_async(&mut worker_side, &frame(None)).await.unwrap();
        });

        let first = read_message_async(&mut viewer_side).await.unwrap().unwrap();
        match first.into_event().unwrap() {
            WorkerEvent::Frame(buffer) => {
                assert_eq!(buffer.dimensions(), (4, 16));
                assert!(buffer.data().iter().all(|&b| b == 0xAB));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let second = read_message_async(&mut viewer_side).await.unwrap().unwrap();
        assert_eq!(second.into_event().unwrap(), WorkerEvent::NoFrame);

        writer.await.unwrap();
        // Writer half dropped: clean end of stream.
        assert!(read_message_async(&mut viewer_side).await.unwrap().is_none());
    }
}

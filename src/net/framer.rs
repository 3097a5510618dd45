//! Message framing.
//!
//! ```text
//! ┌──────────────┬──────────────┬────────┬───────┬─────────────┐
//! │ u32 BE hlen  │ MsgHeader_PI │ struct │ error │ byte stream │
//! └──────────────┴──────────────┴────────┴───────┴─────────────┘
//! ```
//!
//! The header is always packed with the fixed profile. Segment lengths come
//! from the header and are bounded before anything is allocated.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::pack::{PackReader, PackStruct, PackWriter};
use crate::error::{ErrorCode, GridError, Result};

/// Largest accepted packed header.
pub const MAX_HEADER_LEN: usize = 1088;

/// Largest accepted body segment.
pub const MAX_SEGMENT_LEN: usize = 64 * 1024 * 1024;

/// Largest body segment accepted from a peer that has not authenticated.
pub const MAX_UNAUTHENTICATED_SEGMENT_LEN: usize = 64 * 1024;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Client startup
    Connect,
    /// Agent version reply
    Version,
    /// Transport-security negotiation
    CsNeg,
    /// API request
    ApiReq,
    /// API reply
    ApiReply,
    /// Reconnect control
    Reconnect,
    /// Orderly shutdown
    Disconnect,
}

impl MsgType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "RODS_CONNECT",
            Self::Version => "RODS_VERSION",
            Self::CsNeg => "RODS_CS_NEG",
            Self::ApiReq => "RODS_API_REQ",
            Self::ApiReply => "RODS_API_REPLY",
            Self::Reconnect => "RODS_RECONNECT",
            Self::Disconnect => "RODS_DISCONNECT",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgType {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RODS_CONNECT" => Ok(Self::Connect),
            "RODS_VERSION" => Ok(Self::Version),
            "RODS_CS_NEG" => Ok(Self::CsNeg),
            "RODS_API_REQ" => Ok(Self::ApiReq),
            "RODS_API_REPLY" => Ok(Self::ApiReply),
            "RODS_RECONNECT" => Ok(Self::Reconnect),
            "RODS_DISCONNECT" => Ok(Self::Disconnect),
            _ => Err(GridError::framing(
                ErrorCode::SYS_HEADER_TYPE_LEN_ERR,
                format!("unknown message type {s:?}"),
            )),
        }
    }
}

/// Parsed message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    /// Message type
    pub msg_type: MsgType,
    /// Struct segment length
    pub msg_len: usize,
    /// Error segment length
    pub error_len: usize,
    /// Byte-stream segment length
    pub bs_len: usize,
    /// Status or API number
    pub int_info: i32,
}

fn segment_len(reader: &mut PackReader<'_>, name: &str) -> Result<usize> {
    let value = reader.int(name)?;
    usize::try_from(value)
        .ok()
        .filter(|len| *len <= MAX_SEGMENT_LEN)
        .ok_or_else(|| {
            GridError::framing(
                ErrorCode::SYS_HEADER_READ_LEN_ERR,
                format!("{name} out of bounds: {value}"),
            )
        })
}

impl PackStruct for MsgHeader {
    const NAME: &'static str = "MsgHeader_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer
            .str("type", self.msg_type.as_str())
            .int("msgLen", self.msg_len as i64)
            .int("errorLen", self.error_len as i64)
            .int("bsLen", self.bs_len as i64)
            .int("intInfo", self.int_info.into());
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        let msg_type = reader.str("type")?.parse()?;
        Ok(Self {
            msg_type,
            msg_len: segment_len(reader, "msgLen")?,
            error_len: segment_len(reader, "errorLen")?,
            bs_len: segment_len(reader, "bsLen")?,
            int_info: reader.int32("intInfo")?,
        })
    }
}

/// Body segments of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBody {
    /// Packed structure
    pub structure: Bytes,
    /// Packed error message
    pub error: Bytes,
    /// Raw byte stream
    pub byte_stream: Bytes,
}

/// Frame and write one message.
pub async fn send_message<W>(
    writer: &mut W,
    msg_type: MsgType,
    structure: &[u8],
    byte_stream: &[u8],
    error: &[u8],
    int_info: i32,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = MsgHeader {
        msg_type,
        msg_len: structure.len(),
        error_len: error.len(),
        bs_len: byte_stream.len(),
        int_info,
    }
    .pack();

    let mut frame = BytesMut::with_capacity(
        4 + header.len() + structure.len() + error.len() + byte_stream.len(),
    );
    frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(structure);
    frame.extend_from_slice(error);
    frame.extend_from_slice(byte_stream);

    let write_error = |e: std::io::Error| {
        GridError::framing(
            ErrorCode::SYS_HEADER_WRITE_LEN_ERR,
            format!("failed to write {msg_type}: {e}"),
        )
    };
    writer.write_all(&frame).await.map_err(write_error)?;
    writer.flush().await.map_err(write_error)?;

    tracing::trace!(
        "Sent {} (struct={}, error={}, bs={}, int_info={})",
        msg_type,
        structure.len(),
        error.len(),
        byte_stream.len(),
        int_info
    );
    Ok(())
}

fn read_error(e: std::io::Error) -> GridError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        GridError::transport(ErrorCode::SYS_SOCK_READ_ERR, "connection closed by peer")
    } else {
        GridError::transport(ErrorCode::SYS_SOCK_READ_ERR, format!("socket read failed: {e}"))
    }
}

async fn read_header_unbounded<R>(reader: &mut R) -> Result<MsgHeader>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await.map_err(read_error)?;

    let len = i32::from_be_bytes(prefix);
    if len <= 0 || len as usize > MAX_HEADER_LEN {
        return Err(GridError::framing(
            ErrorCode::SYS_HEADER_READ_LEN_ERR,
            format!("header length {len} outside (0, {MAX_HEADER_LEN}]"),
        ));
    }

    let mut header = vec![0u8; len as usize];
    reader.read_exact(&mut header).await.map_err(read_error)?;
    MsgHeader::unpack(&header)
}

/// Read one header, optionally bounded by `deadline`.
pub async fn read_header<R>(reader: &mut R, deadline: Option<Duration>) -> Result<MsgHeader>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, read_header_unbounded(reader))
            .await
            .map_err(|_| {
                GridError::transport(
                    ErrorCode::SYS_SOCK_READ_TIMEDOUT,
                    format!("no header within {}s", limit.as_secs_f32()),
                )
            })?,
        None => read_header_unbounded(reader).await,
    }
}

async fn read_segment<R>(reader: &mut R, len: usize, what: &str) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await.map_err(|e| {
        GridError::framing(
            ErrorCode::SYS_READ_MSG_BODY_LEN_ERR,
            format!("short {what} segment, expected {len} bytes: {e}"),
        )
    })?;
    Ok(buf.freeze())
}

/// Read the segments announced by `header`.
pub async fn read_body<R>(reader: &mut R, header: &MsgHeader) -> Result<MessageBody>
where
    R: AsyncRead + Unpin,
{
    let structure = read_segment(reader, header.msg_len, "struct").await?;
    let error = read_segment(reader, header.error_len, "error").await?;
    let byte_stream = read_segment(reader, header.bs_len, "byte stream").await?;
    Ok(MessageBody {
        structure,
        error,
        byte_stream,
    })
}

/// Read a header and its body; `deadline` bounds the whole message.
pub async fn read_message<R>(
    reader: &mut R,
    deadline: Option<Duration>,
) -> Result<(MsgHeader, MessageBody)>
where
    R: AsyncRead + Unpin,
{
    read_message_within(reader, deadline, MAX_SEGMENT_LEN).await
}

/// Read a header and its body, rejecting any segment over `max_segment`
/// before it is allocated. `deadline` bounds the whole message.
pub async fn read_message_within<R>(
    reader: &mut R,
    deadline: Option<Duration>,
    max_segment: usize,
) -> Result<(MsgHeader, MessageBody)>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let header = read_header_unbounded(reader).await?;
        check_segment_lens(&header, max_segment)?;
        let body = read_body(reader, &header).await?;
        Ok((header, body))
    };
    match deadline {
        Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| {
            GridError::transport(
                ErrorCode::SYS_SOCK_READ_TIMEDOUT,
                format!("no complete message within {}s", limit.as_secs_f32()),
            )
        })?,
        None => read.await,
    }
}

/// Fail if any segment announced by `header` exceeds `max_segment`.
pub fn check_segment_lens(header: &MsgHeader, max_segment: usize) -> Result<()> {
    for (name, len) in [
        ("msgLen", header.msg_len),
        ("errorLen", header.error_len),
        ("bsLen", header.bs_len),
    ] {
        if len > max_segment {
            return Err(GridError::framing(
                ErrorCode::SYS_HEADER_READ_LEN_ERR,
                format!("{name} {len} exceeds {max_segment}"),
            ));
        }
    }
    Ok(())
}

/// Fail unless the header carries `expected`.
pub fn expect_type(header: &MsgHeader, expected: MsgType) -> Result<()> {
    if header.msg_type == expected {
        Ok(())
    } else {
        Err(GridError::framing(
            ErrorCode::SYS_HEADER_TYPE_LEN_ERR,
            format!("expected {expected}, got {}", header.msg_type),
        ))
    }
}

/// Fail unless the struct segment length is within `[1, 2 * max_struct]`.
pub fn check_struct_len(header: &MsgHeader, max_struct: usize) -> Result<()> {
    if header.msg_len == 0 || header.msg_len > max_struct * 2 {
        return Err(GridError::framing(
            ErrorCode::SYS_HEADER_READ_LEN_ERR,
            format!(
                "{} struct length {} outside [1, {}]",
                header.msg_type,
                header.msg_len,
                max_struct * 2
            ),
        ));
    }
    Ok(())
}

/// Log auxiliary segments a control message should not carry.
pub fn warn_unexpected_aux(header: &MsgHeader) {
    if header.error_len > 0 || header.bs_len > 0 {
        tracing::warn!(
            "{} carried unexpected auxiliary data (error={}, bs={})",
            header.msg_type,
            header.error_len,
            header.bs_len
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let mut wire = Vec::new();
        send_message(&mut wire, MsgType::ApiReq, b"struct", b"stream", b"", 713)
            .await
            .unwrap();

        let mut reader = wire.as_slice();
        let (header, body) = read_message(&mut reader, None).await.unwrap();
        assert_eq!(header.msg_type, MsgType::ApiReq);
        assert_eq!(header.int_info, 713);
        assert_eq!(&body.structure[..], b"struct");
        assert_eq!(&body.byte_stream[..], b"stream");
        assert!(body.error.is_empty());
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_segment_order_on_wire() {
        let mut wire = Vec::new();
        send_message(&mut wire, MsgType::ApiReply, b"S", b"B", b"E", -1)
            .await
            .unwrap();
        assert!(wire.ends_with(b"SEB"));
    }

    #[tokio::test]
    async fn test_header_length_bounds() {
        let zero = 0u32.to_be_bytes();
        let err = read_header(&mut &zero[..], None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_HEADER_READ_LEN_ERR);

        let huge = ((MAX_HEADER_LEN + 1) as u32).to_be_bytes();
        let err = read_header(&mut &huge[..], None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_HEADER_READ_LEN_ERR);

        let negative = (-5i32).to_be_bytes();
        let err = read_header(&mut &negative[..], None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_HEADER_READ_LEN_ERR);
    }

    #[tokio::test]
    async fn test_eof_is_read_error() {
        let err = read_header(&mut &b""[..], None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_SOCK_READ_ERR);
    }

    #[tokio::test]
    async fn test_short_body() {
        let mut wire = Vec::new();
        send_message(&mut wire, MsgType::Version, b"0123456789", b"", b"", 0)
            .await
            .unwrap();
        wire.truncate(wire.len() - 3);

        let mut reader = wire.as_slice();
        let header = read_header(&mut reader, None).await.unwrap();
        let err = read_body(&mut reader, &header).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_READ_MSG_BODY_LEN_ERR);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut client, _server) = tokio::io::duplex(64);
        let err = read_header(&mut client, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_SOCK_READ_TIMEDOUT);
    }

    #[tokio::test]
    async fn test_message_deadline_covers_body() {
        let mut wire = Vec::new();
        send_message(&mut wire, MsgType::ApiReq, &[b'x'; 100], b"", b"", 0)
            .await
            .unwrap();
        wire.truncate(wire.len() - 100);

        let (mut client, mut server) = tokio::io::duplex(4096);
        server.write_all(&wire).await.unwrap();
        let err = read_message(&mut client, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_SOCK_READ_TIMEDOUT);
        drop(server);
    }

    #[tokio::test]
    async fn test_segment_cap_checked_before_body() {
        let mut wire = Vec::new();
        send_message(&mut wire, MsgType::ApiReq, &[b'x'; 2048], b"", b"", 0)
            .await
            .unwrap();
        wire.truncate(wire.len() - 2048);

        let mut reader = wire.as_slice();
        let err = read_message_within(&mut reader, None, 1024)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_HEADER_READ_LEN_ERR);
    }

    #[tokio::test]
    async fn test_reads_across_partial_writes() {
        let mut wire = Vec::new();
        send_message(&mut wire, MsgType::CsNeg, b"payload", b"", b"", 1)
            .await
            .unwrap();
        let (head, tail) = wire.split_at(7);

        let mut mock = tokio_test::io::Builder::new().read(head).read(tail).build();
        let (header, body) = read_message(&mut mock, None).await.unwrap();
        assert_eq!(header.msg_type, MsgType::CsNeg);
        assert_eq!(&body.structure[..], b"payload");
    }

    #[test]
    fn test_expect_type_and_struct_len() {
        let header = MsgHeader {
            msg_type: MsgType::Version,
            msg_len: 10,
            error_len: 0,
            bs_len: 0,
            int_info: 0,
        };
        assert!(expect_type(&header, MsgType::Version).is_ok());
        let err = expect_type(&header, MsgType::CsNeg).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_HEADER_TYPE_LEN_ERR);

        assert!(check_struct_len(&header, 5).is_ok());
        assert!(check_struct_len(&header, 4).is_err());

        let empty = MsgHeader { msg_len: 0, ..header };
        assert!(check_struct_len(&empty, 5).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let packed = b"<MsgHeader_PI><type>RODS_BOGUS</type><msgLen>0</msgLen>\
<errorLen>0</errorLen><bsLen>0</bsLen><intInfo>0</intInfo></MsgHeader_PI>";
        let err = MsgHeader::unpack(packed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_HEADER_TYPE_LEN_ERR);
    }
}

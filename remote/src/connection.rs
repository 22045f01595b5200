//! Control connection to the grid server.
//!
//! Every message on the control connection is a frame:
//!
//! ```text
//! +-----------------+-------------------+---------+---------+-------------+
//! | header len (BE) | MsgHeader_PI      | message | error   | byte stream |
//! | 4 bytes         | header len bytes  | msgLen  | errorLen| bsLen       |
//! +-----------------+-------------------+---------+---------+-------------+
//! ```
//!
//! A [`Connection`] owns one socket. Any I/O failure closes it, after which every call fails with
//! [`Error::Connection`]; the owner is expected to drop it.

use bytes::{BufMut, BytesMut};
use common::config::ConnectionConfig;
use common::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::protocol::api::{self, ApiNumber};
use crate::protocol::Tag;
use crate::protocol::messages;

const MAX_HEADER_LEN: u32 = 1024 * 1024;
const MAX_BODY_LEN: u32 = 64 * 1024 * 1024;
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: String,
    pub msg_len: u32,
    pub error_len: u32,
    pub bs_len: u32,
    pub int_info: i32,
}

impl MsgHeader {
    pub fn to_tag(&self) -> Tag {
        Tag::new("MsgHeader_PI")
            .with_leaf("type", &self.msg_type)
            .with_leaf("msgLen", self.msg_len)
            .with_leaf("errorLen", self.error_len)
            .with_leaf("bsLen", self.bs_len)
            .with_leaf("intInfo", self.int_info)
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        if tag.name() != "MsgHeader_PI" {
            return Err(Error::protocol(format!(
                "expected MsgHeader_PI, received {}",
                tag.name()
            )));
        }
        let length = |name: &str| -> Result<u32> {
            u32::try_from(tag.int_field(name)?)
                .map_err(|_| Error::protocol(format!("negative {name} in message header")))
        };
        Ok(Self {
            msg_type: tag.str_field("type")?.to_string(),
            msg_len: length("msgLen")?,
            error_len: length("errorLen")?,
            bs_len: length("bsLen")?,
            int_info: tag.int_field("intInfo")?,
        })
    }
}

/// One received frame.
#[derive(Debug)]
pub struct Message {
    pub header: MsgHeader,
    pub body: Option<Tag>,
    pub error: Option<Tag>,
    pub byte_stream: Vec<u8>,
}

impl Message {
    /// Status of a reply: the header's `intInfo`, negative on failure.
    pub fn status(&self) -> i32 {
        self.header.int_info
    }

    pub fn body(&self) -> Result<&Tag> {
        self.body.as_ref().ok_or_else(|| {
            Error::protocol(format!("{} frame without message body", self.header.msg_type))
        })
    }

    /// Server-provided error text, empty if the frame carries none.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .and_then(|error| messages::parse_rerror(error).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    peer: std::net::SocketAddr,
    config: ConnectionConfig,
    closed: bool,
}

impl Connection {
    #[tracing::instrument(skip(config))]
    pub async fn connect(host: &str, port: u16, config: &ConnectionConfig) -> Result<Self> {
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::connection(
                    format!("failed connecting to {host}:{port}"),
                    source,
                ));
            }
            Err(_) => {
                return Err(Error::connection_closed(format!(
                    "timed out connecting to {host}:{port} after {:?}",
                    config.connect_timeout
                )));
            }
        };
        Self::from_stream(stream, config)
    }

    pub fn from_stream(stream: TcpStream, config: &ConnectionConfig) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map_err(|source| Error::connection("failed reading peer address", source))?;
        stream
            .set_nodelay(true)
            .map_err(|source| Error::connection("failed setting TCP_NODELAY", source))?;
        let (read_half, write_half) = stream.into_split();
        tracing::debug!("connected to {peer}");
        Ok(Self {
            reader: BufReader::with_capacity(config.io_buffer_size, read_half),
            writer: BufWriter::with_capacity(config.io_buffer_size, write_half),
            peer,
            config: *config,
            closed: false,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::connection_closed(format!(
                "connection to {} is closed",
                self.peer
            )));
        }
        Ok(())
    }

    fn check<T>(&mut self, result: std::io::Result<T>, context: &str) -> Result<T> {
        result.map_err(|source| {
            self.closed = true;
            Error::connection(format!("{context} ({})", self.peer), source)
        })
    }

    /// Writes raw bytes (buffered, call [`Connection::flush`] to push them out).
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let result = self.writer.write_all(bytes).await;
        self.check(result, "failed writing to server")
    }

    pub async fn send_header(
        &mut self,
        msg_type: &str,
        msg_len: u32,
        error_len: u32,
        bs_len: u32,
        int_info: i32,
    ) -> Result<()> {
        let header = MsgHeader {
            msg_type: msg_type.to_string(),
            msg_len,
            error_len,
            bs_len,
            int_info,
        };
        tracing::trace!("sending header {header:?}");
        let encoded = header.to_tag().to_wire();
        let mut frame = BytesMut::with_capacity(4 + encoded.len());
        frame.put_u32(encoded.len() as u32);
        frame.put_slice(encoded.as_bytes());
        self.send(&frame).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.writer.flush().await;
        self.check(result, "failed flushing to server")
    }

    async fn send_frame(
        &mut self,
        msg_type: &str,
        body: Option<&Tag>,
        error: Option<&Tag>,
        bs_len: u64,
        int_info: i32,
    ) -> Result<()> {
        let body = body.map(Tag::to_wire).unwrap_or_default();
        let error = error.map(Tag::to_wire).unwrap_or_default();
        let bs_len = u32::try_from(bs_len).map_err(|_| {
            Error::invalid_argument(format!(
                "byte stream of {bs_len} bytes does not fit in a frame"
            ))
        })?;
        self.send_header(msg_type, body.len() as u32, error.len() as u32, bs_len, int_info)
            .await?;
        self.send(body.as_bytes()).await?;
        self.send(error.as_bytes()).await
    }

    /// Sends a complete frame without byte stream and flushes it.
    pub async fn send_message(
        &mut self,
        msg_type: &str,
        body: Option<&Tag>,
        int_info: i32,
    ) -> Result<()> {
        self.send_frame(msg_type, body, None, 0, int_info).await?;
        self.flush().await
    }

    /// Sends a complete frame including an error stack and an in-memory byte stream.
    pub async fn send_reply(
        &mut self,
        msg_type: &str,
        body: Option<&Tag>,
        error: Option<&Tag>,
        byte_stream: &[u8],
        int_info: i32,
    ) -> Result<()> {
        self.send_frame(msg_type, body, error, byte_stream.len() as u64, int_info)
            .await?;
        self.send(byte_stream).await?;
        self.flush().await
    }

    /// Sends a frame whose byte stream is `length` bytes read from `reader`.
    ///
    /// A reader that ends early fails with [`Error::Transfer`]; the frame is then incomplete and
    /// the connection is closed.
    pub async fn send_message_with_stream<R: AsyncRead + Unpin>(
        &mut self,
        msg_type: &str,
        body: Option<&Tag>,
        int_info: i32,
        reader: &mut R,
        length: u64,
    ) -> Result<u64> {
        self.send_frame(msg_type, body, None, length, int_info).await?;
        let mut buffer = vec![0u8; STREAM_CHUNK.min(length as usize).max(1)];
        let mut remaining = length;
        while remaining > 0 {
            let want = buffer.len().min(remaining as usize);
            let read = match reader.read(&mut buffer[..want]).await {
                Ok(0) => {
                    self.closed = true;
                    return Err(Error::transfer(format!(
                        "local data ended after {} of {length} bytes",
                        length - remaining
                    )));
                }
                Ok(read) => read,
                Err(source) => {
                    self.closed = true;
                    return Err(Error::transfer_io("failed reading local data", source));
                }
            };
            self.send(&buffer[..read]).await?;
            remaining -= read as u64;
        }
        self.flush().await?;
        Ok(length)
    }

    async fn read_exact_vec(&mut self, len: u32, what: &str) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len as usize];
        let result = self.reader.read_exact(&mut buffer).await;
        self.check(result, &format!("failed reading {what}"))?;
        Ok(buffer)
    }

    async fn read_frame_head(&mut self) -> Result<(MsgHeader, Option<Tag>, Option<Tag>)> {
        self.ensure_open()?;
        let result = self.reader.read_u32().await;
        let header_len = self.check(result, "failed reading frame length")?;
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            self.closed = true;
            return Err(Error::protocol(format!("invalid header length {header_len}")));
        }
        let header_bytes = self.read_exact_vec(header_len, "message header").await?;
        let parsed = Tag::from_bytes(&header_bytes).and_then(|tag| MsgHeader::from_tag(&tag));
        let header = match parsed {
            Ok(header) => header,
            Err(error) => {
                self.closed = true;
                return Err(error);
            }
        };
        tracing::trace!("received header {header:?}");
        if header.msg_len > MAX_BODY_LEN || header.error_len > MAX_BODY_LEN {
            self.closed = true;
            return Err(Error::protocol(format!(
                "message body too large: {} / {} bytes",
                header.msg_len, header.error_len
            )));
        }
        let body = self.read_tag(header.msg_len, "message body").await?;
        let error = self.read_tag(header.error_len, "error body").await?;
        Ok((header, body, error))
    }

    async fn read_tag(&mut self, len: u32, what: &str) -> Result<Option<Tag>> {
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.read_exact_vec(len, what).await?;
        match Tag::from_bytes(&bytes) {
            Ok(tag) => Ok(Some(tag)),
            Err(error) => {
                self.closed = true;
                Err(error)
            }
        }
    }

    /// Reads one complete frame, buffering its byte stream in memory.
    ///
    /// Byte streams above 64 MiB are refused; use [`Connection::read_message_into`] for data.
    pub async fn read_message(&mut self) -> Result<Message> {
        let (header, body, error) = self.read_frame_head().await?;
        if header.bs_len > MAX_BODY_LEN {
            self.closed = true;
            return Err(Error::protocol(format!(
                "byte stream of {} bytes is too large to buffer",
                header.bs_len
            )));
        }
        let byte_stream = self.read_exact_vec(header.bs_len, "byte stream").await?;
        Ok(Message {
            header,
            body,
            error,
            byte_stream,
        })
    }

    /// Reads one frame, copying its byte stream into `writer`. Returns the frame (with an empty
    /// `byte_stream`) and the number of bytes written.
    pub async fn read_message_into<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
    ) -> Result<(Message, u64)> {
        let (header, body, error) = self.read_frame_head().await?;
        let length = u64::from(header.bs_len);
        let mut buffer = vec![0u8; STREAM_CHUNK.min(length as usize).max(1)];
        let mut remaining = length;
        while remaining > 0 {
            let want = buffer.len().min(remaining as usize);
            let result = self.reader.read(&mut buffer[..want]).await;
            let read = self.check(result, "failed reading byte stream")?;
            if read == 0 {
                self.closed = true;
                return Err(Error::connection_closed(format!(
                    "server closed the connection with {remaining} byte stream bytes outstanding"
                )));
            }
            if let Err(source) = writer.write_all(&buffer[..read]).await {
                // the rest of the byte stream is still on the wire
                self.closed = true;
                return Err(Error::transfer_io("failed writing local data", source));
            }
            remaining -= read as u64;
        }
        writer
            .flush()
            .await
            .map_err(|source| Error::transfer_io("failed flushing local data", source))?;
        Ok((
            Message {
                header,
                body,
                error,
                byte_stream: Vec::new(),
            },
            length,
        ))
    }

    /// Sends an API request and reads its reply.
    ///
    /// A negative reply status is returned as [`Error::Server`]; the connection stays usable.
    #[tracing::instrument(level = "debug", skip(self, body), fields(peer = %self.peer))]
    pub async fn api_request(
        &mut self,
        api_number: ApiNumber,
        body: Option<&Tag>,
    ) -> Result<Message> {
        self.send_message(api::RODS_API_REQ, body, api_number.code())
            .await?;
        let reply = self.read_message().await?;
        self.check_reply(reply, api_number)
    }

    /// Like [`Connection::api_request`], with `length` bytes of `reader` as the byte stream.
    #[tracing::instrument(level = "debug", skip(self, body, reader), fields(peer = %self.peer))]
    pub async fn api_request_with_stream<R: AsyncRead + Unpin>(
        &mut self,
        api_number: ApiNumber,
        body: Option<&Tag>,
        reader: &mut R,
        length: u64,
    ) -> Result<Message> {
        self.send_message_with_stream(api::RODS_API_REQ, body, api_number.code(), reader, length)
            .await?;
        let reply = self.read_message().await?;
        self.check_reply(reply, api_number)
    }

    /// Like [`Connection::api_request`], copying the reply's byte stream into `writer`.
    #[tracing::instrument(level = "debug", skip(self, body, writer), fields(peer = %self.peer))]
    pub async fn api_request_into<W: AsyncWrite + Unpin>(
        &mut self,
        api_number: ApiNumber,
        body: Option<&Tag>,
        writer: &mut W,
    ) -> Result<(Message, u64)> {
        self.send_message(api::RODS_API_REQ, body, api_number.code())
            .await?;
        let (reply, written) = self.read_message_into(writer).await?;
        Ok((self.check_reply(reply, api_number)?, written))
    }

    fn check_reply(&mut self, reply: Message, api_number: ApiNumber) -> Result<Message> {
        if reply.header.msg_type != api::RODS_API_REPLY {
            self.closed = true;
            return Err(Error::protocol(format!(
                "expected {} for {api_number}, received {}",
                api::RODS_API_REPLY,
                reply.header.msg_type
            )));
        }
        if reply.status() < 0 {
            let details = reply.error_message();
            let message = if details.is_empty() {
                format!("{api_number} failed")
            } else {
                format!("{api_number} failed: {details}")
            };
            tracing::debug!("{message} (status {})", reply.status());
            return Err(Error::Server {
                code: reply.status(),
                message,
            });
        }
        Ok(reply)
    }

    /// Shuts the socket down. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        tracing::debug!("closing connection to {}", self.peer);
        let _ = self.writer.flush().await;
        self.writer
            .shutdown()
            .await
            .map_err(|source| Error::connection("failed closing connection", source))
    }
}

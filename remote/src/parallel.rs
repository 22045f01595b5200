//! Parallel transfer streams.
//!
//! For large files the server opens a portal and the client connects `num_threads` auxiliary
//! sockets to it. Each socket authenticates by writing the 4-byte big-endian cookie from the
//! portal, then executes directives sent by the server:
//!
//! ```text
//! +-----------+---------+------------+------------+
//! | operation | flags   | offset     | length     |
//! | i32 (BE)  | i32 (BE)| i64 (BE)   | i64 (BE)   |
//! +-----------+---------+------------+------------+
//! ```
//!
//! For a PUT directive the client streams `length` bytes of the local file starting at `offset`;
//! for GET it reads `length` bytes and writes them at `offset`. `DONE` ends the stream.
//!
//! Directives on one socket cover increasing ranges, sockets progress independently of each
//! other. Every stream is a tokio task owning its socket, file handle and buffer.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use common::control::TransferControlBlock;
use common::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::messages::PortalOprOut;

pub const PUT_OPERATION: i32 = 1;
pub const GET_OPERATION: i32 = 2;
pub const DONE_OPERATION: i32 = 9999;
pub const DIRECTIVE_LEN: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Put,
    Get,
    Done,
}

impl Operation {
    pub fn code(self) -> i32 {
        match self {
            Operation::Put => PUT_OPERATION,
            Operation::Get => GET_OPERATION,
            Operation::Done => DONE_OPERATION,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            PUT_OPERATION => Ok(Operation::Put),
            GET_OPERATION => Ok(Operation::Get),
            DONE_OPERATION => Ok(Operation::Done),
            other => Err(Error::protocol(format!("unknown transfer directive {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Directive {
    pub operation: Operation,
    pub flags: i32,
    pub offset: i64,
    pub length: i64,
}

impl Directive {
    pub fn done() -> Self {
        Self {
            operation: Operation::Done,
            flags: 0,
            offset: 0,
            length: 0,
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; DIRECTIVE_LEN];
        reader
            .read_exact(&mut raw)
            .await
            .map_err(|source| Error::connection("failed reading transfer directive", source))?;
        let mut raw = &raw[..];
        let operation = Operation::from_code(raw.get_i32())?;
        Ok(Self {
            operation,
            flags: raw.get_i32(),
            offset: raw.get_i64(),
            length: raw.get_i64(),
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut raw = BytesMut::with_capacity(DIRECTIVE_LEN);
        raw.put_i32(self.operation.code());
        raw.put_i32(self.flags);
        raw.put_i64(self.offset);
        raw.put_i64(self.length);
        writer
            .write_all(&raw)
            .await
            .map_err(|source| Error::connection("failed writing transfer directive", source))?;
        writer
            .flush()
            .await
            .map_err(|source| Error::connection("failed flushing transfer directive", source))
    }

    /// `(offset, length)` as unsigned values.
    fn range(&self) -> Result<(u64, u64)> {
        match (u64::try_from(self.offset), u64::try_from(self.length)) {
            (Ok(offset), Ok(length)) => Ok((offset, length)),
            _ => Err(Error::protocol(format!(
                "negative range in directive {self:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// local file -> grid
    Put,
    /// grid -> local file
    Get,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Put => f.write_str("put"),
            Direction::Get => f.write_str("get"),
        }
    }
}

/// Where and how to run the parallel streams of one file transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParallelTransferStrategy {
    pub host: String,
    pub port: u16,
    /// One-time password written by every stream after connecting.
    pub cookie: i32,
    pub local_file: std::path::PathBuf,
    pub transfer_length: u64,
    pub num_threads: usize,
}

impl ParallelTransferStrategy {
    /// Builds the strategy from the server's portal reply. An empty portal host means the host of
    /// the control connection (`default_host`).
    pub fn from_portal(
        portal: &PortalOprOut,
        default_host: &str,
        local_file: &std::path::Path,
        transfer_length: u64,
    ) -> Result<Self> {
        let port = u16::try_from(portal.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| Error::protocol(format!("invalid portal port {}", portal.port)))?;
        let num_threads = usize::try_from(portal.num_threads)
            .ok()
            .filter(|threads| *threads > 0)
            .ok_or_else(|| {
                Error::protocol(format!("invalid portal thread count {}", portal.num_threads))
            })?;
        let host = if portal.host.is_empty() {
            default_host.to_string()
        } else {
            portal.host.clone()
        };
        Ok(Self {
            host,
            port,
            cookie: portal.cookie,
            local_file: local_file.to_path_buf(),
            transfer_length,
            num_threads,
        })
    }
}

/// Per-stream result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    pub stream_id: usize,
    pub bytes: u64,
    pub directives: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParallelSummary {
    pub bytes_transferred: u64,
    /// Sorted by stream id.
    pub streams: Vec<StreamOutcome>,
}

enum StreamMode {
    Put { file: tokio::fs::File },
    Get { file: tokio::fs::File },
}

impl StreamMode {
    fn direction(&self) -> Direction {
        match self {
            StreamMode::Put { .. } => Direction::Put,
            StreamMode::Get { .. } => Direction::Get,
        }
    }
}

/// One auxiliary socket and the local file handle it reads from or writes to.
pub struct ParallelTransferStream {
    id: usize,
    socket: TcpStream,
    buffer: Vec<u8>,
    position: u64,
    mode: StreamMode,
    control: Option<Arc<TransferControlBlock>>,
}

impl ParallelTransferStream {
    /// Connects to the portal, sends the cookie and opens the local file for `direction`.
    ///
    /// For [`Direction::Get`] the local file must already exist.
    pub async fn open(
        id: usize,
        strategy: &ParallelTransferStrategy,
        direction: Direction,
        buffer_size: usize,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<Self> {
        let address = format!("{}:{}", strategy.host, strategy.port);
        let mut socket = TcpStream::connect(address.as_str()).await.map_err(|source| {
            Error::connection(format!("failed connecting to portal {address}"), source)
        })?;
        socket.write_i32(strategy.cookie).await.map_err(|source| {
            Error::connection(format!("failed sending cookie to {address}"), source)
        })?;
        let path = &strategy.local_file;
        let mode = match direction {
            Direction::Put => StreamMode::Put {
                file: tokio::fs::File::open(path).await.map_err(|source| {
                    Error::transfer_io(format!("cannot open {path:?} for reading"), source)
                })?,
            },
            Direction::Get => StreamMode::Get {
                file: tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(path)
                    .await
                    .map_err(|source| {
                        Error::transfer_io(format!("cannot open {path:?} for writing"), source)
                    })?,
            },
        };
        tracing::debug!("stream {id} connected to {address} for {direction}");
        Ok(Self {
            id,
            socket,
            buffer: vec![0u8; buffer_size.max(1)],
            position: 0,
            mode,
            control,
        })
    }

    /// Executes directives until `DONE`. Socket and file are closed when the stream is dropped,
    /// whichever way this returns.
    #[tracing::instrument(level = "debug", skip(self), fields(stream = self.id))]
    pub async fn run(mut self) -> Result<StreamOutcome> {
        let mut outcome = StreamOutcome {
            stream_id: self.id,
            ..Default::default()
        };
        loop {
            let directive = Directive::read_from(&mut self.socket).await?;
            tracing::trace!("directive {directive:?}");
            let (offset, length) = directive.range()?;
            let direction = self.mode.direction();
            let moved = match (directive.operation, &mut self.mode) {
                (Operation::Done, _) => break,
                (Operation::Put, StreamMode::Put { file }) => {
                    put_range(
                        file,
                        &mut self.position,
                        &mut self.socket,
                        &mut self.buffer,
                        offset,
                        length,
                    )
                    .await?
                }
                (Operation::Get, StreamMode::Get { file }) => {
                    get_range(
                        file,
                        &mut self.position,
                        &mut self.socket,
                        &mut self.buffer,
                        offset,
                        length,
                    )
                    .await?
                }
                (operation, _) => {
                    return Err(Error::protocol(format!(
                        "{operation:?} directive received on stream {} opened for {direction}",
                        self.id
                    )));
                }
            };
            outcome.bytes += moved;
            outcome.directives += 1;
            if let Some(control) = &self.control {
                control.add_bytes_transferred(moved);
            }
        }
        if let StreamMode::Get { file } = &mut self.mode {
            file.flush()
                .await
                .map_err(|source| Error::transfer_io("failed flushing local file", source))?;
        }
        if let Err(error) = self.socket.shutdown().await {
            tracing::debug!("stream {} shutdown: {error}", self.id);
        }
        tracing::debug!(
            "stream {} done: {} in {} directives",
            self.id,
            bytesize::ByteSize(outcome.bytes),
            outcome.directives
        );
        Ok(outcome)
    }
}

async fn seek_to(file: &mut tokio::fs::File, position: &mut u64, offset: u64) -> Result<()> {
    if *position == offset {
        return Ok(());
    }
    let reached = file
        .seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|source| {
            Error::transfer_io(format!("failed seeking to offset {offset}"), source)
        })?;
    if reached != offset {
        return Err(Error::transfer(format!(
            "seek to offset {offset} ended at {reached}"
        )));
    }
    *position = offset;
    Ok(())
}

async fn put_range(
    file: &mut tokio::fs::File,
    position: &mut u64,
    socket: &mut TcpStream,
    buffer: &mut [u8],
    offset: u64,
    length: u64,
) -> Result<u64> {
    seek_to(file, position, offset).await?;
    let mut remaining = length;
    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let read = file
            .read(&mut buffer[..want])
            .await
            .map_err(|source| Error::transfer_io("failed reading local file", source))?;
        if read == 0 {
            return Err(Error::transfer(format!(
                "local file ended after {} of {length} bytes requested at offset {offset}",
                length - remaining
            )));
        }
        socket
            .write_all(&buffer[..read])
            .await
            .map_err(|source| Error::connection("failed sending file data", source))?;
        remaining -= read as u64;
        *position += read as u64;
    }
    socket
        .flush()
        .await
        .map_err(|source| Error::connection("failed flushing file data", source))?;
    Ok(length)
}

async fn get_range(
    file: &mut tokio::fs::File,
    position: &mut u64,
    socket: &mut TcpStream,
    buffer: &mut [u8],
    offset: u64,
    length: u64,
) -> Result<u64> {
    seek_to(file, position, offset).await?;
    let mut remaining = length;
    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let read = socket
            .read(&mut buffer[..want])
            .await
            .map_err(|source| Error::connection("failed receiving file data", source))?;
        if read == 0 {
            return Err(Error::transfer(format!(
                "server closed stream after {} of {length} bytes at offset {offset}",
                length - remaining
            )));
        }
        file.write_all(&buffer[..read])
            .await
            .map_err(|source| Error::transfer_io("failed writing local file", source))?;
        remaining -= read as u64;
        *position += read as u64;
    }
    Ok(length)
}

/// Runs all streams of `strategy` and waits for every one of them.
///
/// Returns the first stream error, if any, once all streams have finished.
#[tracing::instrument(
    skip(strategy, control),
    fields(host = %strategy.host, port = strategy.port, threads = strategy.num_threads)
)]
pub async fn execute(
    strategy: &ParallelTransferStrategy,
    direction: Direction,
    buffer_size: usize,
    control: Option<Arc<TransferControlBlock>>,
) -> Result<ParallelSummary> {
    let mut join_set = tokio::task::JoinSet::new();
    for id in 0..strategy.num_threads {
        let strategy = strategy.clone();
        let control = control.clone();
        join_set.spawn(async move {
            let stream =
                ParallelTransferStream::open(id, &strategy, direction, buffer_size, control).await?;
            stream.run().await
        });
    }
    let mut summary = ParallelSummary::default();
    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(outcome)) => {
                summary.bytes_transferred += outcome.bytes;
                summary.streams.push(outcome);
            }
            Ok(Err(error)) => {
                tracing::error!("parallel {direction} stream failed: {error}");
                first_error.get_or_insert(error);
            }
            Err(join_error) => {
                tracing::error!("parallel {direction} stream task failed: {join_error}");
                first_error.get_or_insert(Error::transfer(format!(
                    "parallel stream task failed: {join_error}"
                )));
            }
        }
    }
    if let Some(error) = first_error {
        return Err(error);
    }
    if summary.bytes_transferred != strategy.transfer_length {
        return Err(Error::transfer(format!(
            "parallel streams moved {} of {} bytes",
            summary.bytes_transferred, strategy.transfer_length
        )));
    }
    summary.streams.sort_by_key(|stream| stream.stream_id);
    Ok(summary)
}

//! Cache Entry Module
//!
//! A streaming handle returned by the backends: a seekable body reader plus a
//! metadata snapshot taken at read time.

use std::io::{self, Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, Chain, ReadBuf, Take};

use crate::cache::EntryMetadata;

// == Entry Reader ==
/// Body of a cached entry.
///
/// The memory variant is a view onto a shared, immutable buffer; the disk
/// variant is a freshly opened file handle owned by the caller.
#[derive(Debug)]
pub enum EntryReader {
    Memory(Cursor<Bytes>),
    File(File),
}

impl EntryReader {
    /// Reads `len` bytes starting at `offset`, leaving the cursor after them.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Limits the reader to the inclusive byte range `start..=end`.
    pub async fn into_slice(mut self, start: u64, end: u64) -> io::Result<Take<EntryReader>> {
        self.seek(SeekFrom::Start(start)).await?;
        Ok(self.take(end - start + 1))
    }

    /// Drains the remaining body into memory.
    pub async fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl AsyncRead for EntryReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EntryReader::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            EntryReader::File(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for EntryReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        match self.get_mut() {
            EntryReader::Memory(cursor) => Pin::new(cursor).start_seek(position),
            EntryReader::File(file) => Pin::new(file).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match self.get_mut() {
            EntryReader::Memory(cursor) => Pin::new(cursor).poll_complete(cx),
            EntryReader::File(file) => Pin::new(file).poll_complete(cx),
        }
    }
}

// == Entry ==
/// A cached response as returned by `Cache::get` and `Cache::cache`.
#[derive(Debug)]
pub struct Entry<P> {
    pub data: EntryReader,
    pub metadata: EntryMetadata<P>,
    /// `now >= expires` at the time of the read; advisory only
    pub stale: bool,
}

impl<P> Entry<P> {
    /// Body length in bytes.
    pub fn size(&self) -> u64 {
        self.metadata.size.max(0) as u64
    }
}

// == Consumed ==
/// Body bytes a failed `Cache::cache` already took from its source, in order.
///
/// Chaining [`Consumed::into_reader`] with the rest of the source yields the
/// complete body again without asking the origin twice.
#[derive(Debug)]
pub struct Consumed {
    /// Bytes that reached the backend before the failure
    stored: EntryReader,
    /// How many bytes of `stored` belong to the body
    stored_len: u64,
    /// Bytes read from the source but never written
    pending: Bytes,
}

impl Consumed {
    /// Bytes buffered in memory.
    pub fn buffered(data: Bytes) -> Self {
        Self {
            stored_len: data.len() as u64,
            stored: EntryReader::Memory(Cursor::new(data)),
            pending: Bytes::new(),
        }
    }

    /// The first `written` bytes of `file`, followed by `pending`.
    ///
    /// # Arguments
    /// * `file` - Handle positioned at the start of the partial body
    /// * `written` - Bytes confirmed written to `file`
    /// * `pending` - Bytes read after the last confirmed write
    pub fn spilled(file: File, written: u64, pending: Bytes) -> Self {
        Self {
            stored: EntryReader::File(file),
            stored_len: written,
            pending,
        }
    }

    /// Total bytes replayed by [`Consumed::into_reader`].
    pub fn len(&self) -> u64 {
        self.stored_len + self.pending.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_reader(self) -> Chain<Take<EntryReader>, Cursor<Bytes>> {
        self.stored
            .take(self.stored_len)
            .chain(Cursor::new(self.pending))
    }
}

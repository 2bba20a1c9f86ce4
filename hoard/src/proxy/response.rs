//! The response handed from a target back to the HTTP edge.

use crate::store::blob::BlobReader;
use std::collections::BTreeMap;
use std::io;
use std::io::{Read, Seek, SeekFrom};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

pub const CACHE_HIT: &str = "HIT";
pub const CACHE_MISS: &str = "MISS";
pub const CACHE_WAIT: &str = "WAIT";

/// A response decided by a [Target](crate::proxy::Target): status, flat
/// header map and a body that releases its locks when dropped.
pub struct ResponseWrapper {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

impl ResponseWrapper {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_owned(), value.into());
    }
}

/// Response payload.
///
/// Cache hits are seekable so the HTTP edge can serve byte ranges from them;
/// everything else is a plain forward-only stream.
pub enum Body {
    Seekable(BlobBody),
    Stream(Box<dyn Read + Send>),
    Empty,
}

impl Body {
    pub fn is_seekable(&self) -> bool {
        matches!(self, Body::Seekable(_))
    }

    /// Degrades the body to a forward-only stream (used when a streaming
    /// transform is layered on top).
    pub fn into_stream(self) -> Box<dyn Read + Send> {
        match self {
            Body::Seekable(blob) => Box::new(blob),
            Body::Stream(reader) => reader,
            Body::Empty => Box::new(io::empty()),
        }
    }
}

/// Guard on the per-path lock a response body keeps alive while it is being
/// consumed.
pub(crate) enum PathGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Seekable cache-hit body: the open blob plus the per-path lock guard.
pub struct BlobBody {
    pub(crate) reader: BlobReader,
    pub(crate) _path_guard: Option<PathGuard>,
}

impl BlobBody {
    pub fn len(&self) -> io::Result<u64> {
        self.reader.len()
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Read for BlobBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for BlobBody {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

/// A forward-only stream that keeps a per-path lock guard alive until the
/// client is done with the body.
pub(crate) struct GuardedStream<R> {
    pub(crate) inner: R,
    pub(crate) _path_guard: PathGuard,
}

impl<R: Read> Read for GuardedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Case-insensitive lookup in a list of request header pairs.
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

//! Bridges the blocking proxy core onto the async HTTP edge.

use bytes::Bytes;
use futures_core::Stream;
use std::io;
use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::Receiver;
use tokio::task::spawn_blocking;
use tracing::debug;

const CHUNK_SIZE: usize = 256 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// Async byte stream fed by a proxied response body.
///
/// Bodies coming out of the worker are blocking readers — an open blob, an
/// origin socket, or the transparent tee that populates the store. A blocking
/// task pumps the body through a bounded channel, so origin, store and client
/// all advance at the pace the client consumes. Dropping the stream closes
/// the channel; the pump then stops and drops the body mid-stream, which is
/// what aborts an unfinished cache write.
pub struct BodyStream {
    rx: Receiver<io::Result<Bytes>>,
}

impl BodyStream {
    /// Starts pumping `body` on a blocking task; `path` labels the transfer
    /// in logs.
    pub fn pump<R: Read + Send + 'static>(path: String, body: R) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        spawn_blocking(move || match pump_chunks(body, &tx) {
            Ok(bytes) => debug!(path = %path, bytes, "response body streamed"),
            Err(PumpStop::ClientGone(bytes)) => {
                debug!(path = %path, bytes, "client went away mid-stream")
            }
            Err(PumpStop::Read(err)) => {
                debug!(path = %path, error = %err, "response body failed");
                let _ = tx.blocking_send(Err(err));
            }
        });
        Self { rx }
    }
}

enum PumpStop {
    /// The receiving side hung up after this many bytes.
    ClientGone(u64),
    Read(io::Error),
}

/// Copies `body` chunk by chunk into the channel until end of stream,
/// returning the number of bytes forwarded.
fn pump_chunks<R: Read>(
    mut body: R,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> Result<u64, PumpStop> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = body.read(&mut buf).map_err(PumpStop::Read)?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if tx
            .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
            .is_err()
        {
            return Err(PumpStop::ClientGone(total));
        }
    }
}

impl Stream for BodyStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

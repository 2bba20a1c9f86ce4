//! A scripted HTTP origin for exercising targets against real sockets.
//!
//! The server answers every request with whatever the supplied handler
//! returns, counts the requests it saw, and optionally delays responses to
//! widen race windows in concurrency tests.

use std::io;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

/// The request line and headers the mock origin saw.
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A scripted response.
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Option<Duration>,
}

impl MockResponse {
    pub fn ok(body: &[u8]) -> Self {
        MockResponse {
            status: 200,
            headers: Vec::new(),
            body: body.to_vec(),
            delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        MockResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            delay: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    /// Sleep this long before sending anything, to hold concurrent callers
    /// in flight.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A mock origin listening on a loopback port until dropped.
pub struct UpstreamServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    accept_loop: Option<JoinHandle<()>>,
}

impl UpstreamServer {
    pub fn start<F>(handler: F) -> io::Result<Self>
    where
        F: Fn(&ParsedRequest) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(handler);

        let accept_loop = {
            let hits = hits.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    let hits = hits.clone();
                    let handler = handler.clone();
                    thread::spawn(move || {
                        let _ = serve_connection(stream, &hits, handler.as_ref());
                    });
                }
            })
        };

        Ok(UpstreamServer {
            addr,
            hits,
            shutdown,
            accept_loop: Some(accept_loop),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of requests the origin has fully received.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for UpstreamServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.accept_loop.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connection<F>(stream: TcpStream, hits: &AtomicUsize, handler: &F) -> io::Result<()>
where
    F: Fn(&ParsedRequest) -> MockResponse,
{
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Ok(()); // e.g. the shutdown wake-up connection
    };
    let request = ParsedRequest {
        method: method.to_owned(),
        path: path.to_owned(),
        headers: read_headers(&mut reader)?,
    };
    hits.fetch_add(1, Ordering::SeqCst);

    let response = handler(&request);
    if let Some(delay) = response.delay {
        thread::sleep(delay);
    }

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    )?;
    let mut has_length = false;
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("Content-Length") {
            has_length = true;
        }
        write!(stream, "{name}: {value}\r\n")?;
    }
    if !has_length {
        write!(stream, "Content-Length: {}\r\n", response.body.len())?;
    }
    stream.write_all(b"Connection: close\r\n\r\n")?;
    if request.method != "HEAD" {
        stream.write_all(&response.body)?;
    }
    stream.flush()
}

fn read_headers(reader: &mut impl BufRead) -> io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        304 => "Not Modified",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

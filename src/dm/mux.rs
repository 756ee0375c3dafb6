//! Control socket plumbing: newline framing, a bounded set of accepted
//! connections with oldest-first eviction, and deferred close.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;

/// Longest line accepted before it is dispatched without a newline.
pub const MAX_LINE: usize = 4096;
/// Accepted connections kept per listener.
pub const MAX_CONNECTIONS: usize = 15;

/// Accumulates bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `bytes`; returns every line completed by them.
    ///
    /// CRs are dropped, blank lines produce nothing, and a line reaching
    /// [`MAX_LINE`] bytes is dispatched as-is.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in bytes {
            match b {
                b'\r' => {}
                b'\n' => self.flush_into(&mut out),
                _ => {
                    self.buf.push(b);
                    if self.buf.len() >= MAX_LINE {
                        self.flush_into(&mut out);
                    }
                }
            }
        }
        out
    }

    /// Whatever is left once the peer stops sending.
    pub fn finish(&mut self) -> Option<String> {
        let mut out = Vec::new();
        self.flush_into(&mut out);
        out.pop()
    }

    fn flush_into(&mut self, out: &mut Vec<String>) {
        if self.buf.is_empty() {
            return;
        }
        out.push(String::from_utf8_lossy(&self.buf).into_owned());
        self.buf.clear();
    }
}

/// Ids of live accepted connections, oldest first.
#[derive(Debug)]
pub struct ConnectionSet {
    cap: usize,
    next_id: u64,
    live: VecDeque<u64>,
}

impl ConnectionSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            next_id: 1,
            live: VecDeque::new(),
        }
    }

    /// Registers a new connection. Returns its id and the id evicted to make room, if any.
    pub fn admit(&mut self) -> (u64, Option<u64>) {
        let id = self.next_id;
        self.next_id += 1;
        self.live.push_back(id);
        let evicted = if self.live.len() > self.cap {
            self.live.pop_front()
        } else {
            None
        };
        (id, evicted)
    }

    pub fn remove(&mut self, id: u64) -> bool {
        match self.live.iter().position(|x| *x == id) {
            Some(i) => {
                self.live.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.live.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// More than half the slots are taken; new flexi requests get turned away.
    pub fn is_busy(&self) -> bool {
        self.live.len() > self.cap / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRequest {
    Now,
    /// A handler is running; the close happens when it returns.
    Deferred,
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnState {
    pub authenticated: bool,
    pub auth_global: bool,
    /// Display this connection authenticated against (lookup only).
    pub display: Option<u32>,
    pub messages: u32,
    pub(crate) dispatching: bool,
    pub(crate) close_requested: bool,
}

impl ConnState {
    pub fn begin_dispatch(&mut self) {
        self.dispatching = true;
        self.messages += 1;
    }

    pub fn request_close(&mut self) -> CloseRequest {
        if self.dispatching {
            // Repeated requests stay latched until end_dispatch.
            self.close_requested = true;
            CloseRequest::Deferred
        } else {
            CloseRequest::Now
        }
    }

    /// Ends the current dispatch; `true` means a close was requested meanwhile.
    pub fn end_dispatch(&mut self) -> bool {
        self.dispatching = false;
        std::mem::take(&mut self.close_requested)
    }

    pub fn close_pending(&self) -> bool {
        self.close_requested
    }
}

#[derive(Debug)]
struct Shared {
    set: ConnectionSet,
    closers: HashMap<u64, oneshot::Sender<()>>,
}

/// Listening control socket with a bounded set of accepted connections.
pub struct Listener {
    inner: UnixListener,
    shared: Arc<Mutex<Shared>>,
}

impl Listener {
    pub fn bind(path: &Path) -> io::Result<Self> {
        Ok(Self::from_listener(UnixListener::bind(path)?, MAX_CONNECTIONS))
    }

    pub fn from_listener(inner: UnixListener, cap: usize) -> Self {
        Self {
            inner,
            shared: Arc::new(Mutex::new(Shared {
                set: ConnectionSet::new(cap),
                closers: HashMap::new(),
            })),
        }
    }

    /// Accepts one connection, evicting the oldest one when the set is full.
    pub async fn accept(&self) -> io::Result<Connection> {
        let (stream, _) = self.inner.accept().await?;
        let (tx, rx) = oneshot::channel();
        let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        let (id, evicted) = sh.set.admit();
        sh.closers.insert(id, tx);
        if let Some(old) = evicted {
            tracing::info!("control connection {old} evicted by {id}");
            if let Some(closer) = sh.closers.remove(&old) {
                let _ = closer.send(());
            }
        }
        Ok(Connection {
            id,
            stream,
            state: ConnState::default(),
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
            eof: false,
            evict: rx,
            evicted: false,
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.shared.lock().unwrap_or_else(|p| p.into_inner()).set.is_busy()
    }

    pub fn live(&self) -> usize {
        self.shared.lock().unwrap_or_else(|p| p.into_inner()).set.len()
    }

    /// A cheap handle for asking "is busy?" from other tasks.
    pub fn busy_probe(&self) -> BusyProbe {
        BusyProbe {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[derive(Clone)]
pub struct BusyProbe {
    shared: Arc<Mutex<Shared>>,
}

impl BusyProbe {
    pub fn is_busy(&self) -> bool {
        self.shared.lock().unwrap_or_else(|p| p.into_inner()).set.is_busy()
    }
}

pub struct Connection {
    pub id: u64,
    stream: UnixStream,
    pub state: ConnState,
    lines: LineBuffer,
    pending: VecDeque<String>,
    eof: bool,
    evict: oneshot::Receiver<()>,
    evicted: bool,
    shared: Arc<Mutex<Shared>>,
}

impl Connection {
    /// Next framed line; `None` once the peer hung up or the connection was evicted.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = [0u8; 1024];
        loop {
            if self.evicted {
                return Ok(None);
            }
            if let Some(l) = self.pending.pop_front() {
                return Ok(Some(l));
            }
            if self.eof {
                return Ok(self.lines.finish());
            }
            tokio::select! {
                _ = &mut self.evict => {
                    self.evicted = true;
                }
                r = self.stream.read(&mut buf) => {
                    let n = r?;
                    if n == 0 {
                        self.eof = true;
                    } else {
                        self.pending.extend(self.lines.push(&buf[..n]));
                    }
                }
            }
        }
    }

    pub async fn reply(&mut self, line: &str) -> io::Result<()> {
        if self.evicted {
            return Ok(());
        }
        let mut out = Vec::with_capacity(line.len() + 1);
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
        self.stream.write_all(&out).await?;
        self.stream.flush().await
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        sh.set.remove(self.id);
        sh.closers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn crlf_prefix_then_two_lines() {
        let mut lb = LineBuffer::new();
        let mut got = lb.push(b"\r\nfoo\nbar");
        got.extend(lb.finish());
        assert_eq!(got, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn blank_and_cr_only_input_dispatches_nothing() {
        let mut lb = LineBuffer::new();
        assert!(lb.push(b"\r\n\n\r\r\n").is_empty());
        assert_eq!(lb.finish(), None);
    }

    #[test]
    fn long_line_is_dispatched_at_the_cap() {
        let mut lb = LineBuffer::new();
        let big = vec![b'x'; MAX_LINE + 10];
        let got = lb.push(&big);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].len(), MAX_LINE);
        assert_eq!(lb.finish().map(|s| s.len()), Some(10));
    }

    proptest! {
        #[test]
        fn split_points_do_not_change_framing(
            lines in proptest::collection::vec("[a-zA-Z0-9 _]{1,40}", 1..8),
            cut in 0usize..400,
        ) {
            let joined: String = lines.iter().map(|l| format!("{l}\r\n")).collect();
            let bytes = joined.as_bytes();
            let cut = cut.min(bytes.len());
            let mut lb = LineBuffer::new();
            let mut got = lb.push(&bytes[..cut]);
            got.extend(lb.push(&bytes[cut..]));
            let expect: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
            prop_assert_eq!(got, expect);
        }
    }

    #[test]
    fn overflow_evicts_exactly_the_oldest_survivor() {
        let mut set = ConnectionSet::new(3);
        let a = set.admit().0;
        let b = set.admit().0;
        let c = set.admit().0;
        set.remove(a);
        let (d, ev) = set.admit();
        assert_eq!(ev, None);
        let (e, ev) = set.admit();
        assert_eq!(ev, Some(b));
        assert!(set.contains(c) && set.contains(d) && set.contains(e));
    }

    #[test]
    fn busy_above_half() {
        let mut set = ConnectionSet::new(MAX_CONNECTIONS);
        for _ in 0..7 {
            set.admit();
        }
        assert!(!set.is_busy());
        set.admit();
        assert!(set.is_busy());
    }

    #[test]
    fn close_during_dispatch_is_deferred_and_latched() {
        let mut st = ConnState::default();
        assert_eq!(st.request_close(), CloseRequest::Now);
        st.begin_dispatch();
        assert_eq!(st.request_close(), CloseRequest::Deferred);
        assert_eq!(st.request_close(), CloseRequest::Deferred);
        assert!(st.close_pending());
        assert!(st.end_dispatch());
        st.begin_dispatch();
        assert!(!st.end_dispatch());
        assert_eq!(st.messages, 2);
    }

    #[tokio::test]
    async fn listener_frames_lines_and_evicts_oldest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ctl.sock");
        let listener = Listener::from_listener(UnixListener::bind(&path).unwrap(), 2);

        let mut c1 = UnixStream::connect(&path).await.unwrap();
        let mut s1 = listener.accept().await.unwrap();
        c1.write_all(b"\r\nVERSION\nCLO").await.unwrap();
        assert_eq!(s1.next_line().await.unwrap().as_deref(), Some("VERSION"));

        let _c2 = UnixStream::connect(&path).await.unwrap();
        let _s2 = listener.accept().await.unwrap();
        assert_eq!(listener.live(), 2);
        let _c3 = UnixStream::connect(&path).await.unwrap();
        let _s3 = listener.accept().await.unwrap();

        // The oldest connection is gone; its partial line never dispatches.
        assert_eq!(s1.next_line().await.unwrap(), None);
        assert!(s1.is_evicted());
        assert_eq!(listener.live(), 2);
        drop(s1);
        assert_eq!(listener.live(), 2);
    }

    #[tokio::test]
    async fn eof_flushes_the_unterminated_tail() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ctl.sock");
        let listener = Listener::bind(&path).unwrap();
        let mut c = UnixStream::connect(&path).await.unwrap();
        let mut s = listener.accept().await.unwrap();
        c.write_all(b"foo\nbar").await.unwrap();
        drop(c);
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("foo"));
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("bar"));
        assert_eq!(s.next_line().await.unwrap(), None);
        s.reply("OK").await.ok();
        drop(s);
        assert_eq!(listener.live(), 0);
    }
}

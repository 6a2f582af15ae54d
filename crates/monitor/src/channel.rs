// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Transport, framing and request/reply correlation of the QMP channel.

use std::io::{IoSlice, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde_json::Value;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep, timeout_at, Instant};

use crate::error::MonitorError;
use crate::events::{dispatch_event, DomainEventHandler, QmpEvent};
use crate::logfile;

/// How long to keep retrying the connect while the hypervisor starts up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTransportKind {
    Unix,
    Pty,
}

impl MonitorTransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorTransportKind::Unix => "unix",
            MonitorTransportKind::Pty => "pty",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub path: PathBuf,
    pub kind: MonitorTransportKind,
    /// Hypervisor pid; used to tell "still starting" from "already dead"
    /// while the socket refuses connections.
    pub pid: i32,
    /// The per-VM log file, mined for an error message when the channel
    /// fails.
    pub log_path: Option<PathBuf>,
}

struct PtyFile(std::fs::File);

impl AsRawFd for PtyFile {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

enum Transport {
    Unix(UnixStream),
    Pty(AsyncFd<PtyFile>),
}

impl Transport {
    fn supports_fd_passing(&self) -> bool {
        matches!(self, Transport::Unix(_))
    }

    /// Append whatever is readable to `buf`. Returns the number of bytes
    /// read; zero means EOF.
    async fn read_append(&self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        let mut chunk = [0u8; 1024];
        loop {
            match self {
                Transport::Unix(stream) => {
                    stream.readable().await?;
                    match stream.try_read(&mut chunk) {
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            return Ok(n);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
                Transport::Pty(afd) => {
                    let mut guard = afd.readable().await?;
                    match guard.try_io(|inner| (&inner.get_ref().0).read(&mut chunk)) {
                        Ok(Ok(n)) => {
                            buf.extend_from_slice(&chunk[..n]);
                            return Ok(n);
                        }
                        Ok(Err(e)) => return Err(e),
                        Err(_would_block) => continue,
                    }
                }
            }
        }
    }

    /// Write the whole frame. A descriptor, if any, rides as ancillary data
    /// on the first byte actually written.
    async fn write_frame(&self, data: &[u8], mut fd: Option<RawFd>) -> std::io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let written = match self {
                Transport::Unix(stream) => {
                    stream.writable().await?;
                    let res = if let Some(raw) = fd {
                        stream.try_io(Interest::WRITABLE, || {
                            let iov = [IoSlice::new(&data[offset..])];
                            let cmsgs = [ControlMessage::ScmRights(&[raw])];
                            sendmsg::<UnixAddr>(
                                stream.as_raw_fd(),
                                &iov,
                                &cmsgs,
                                MsgFlags::empty(),
                                None,
                            )
                            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
                        })
                    } else {
                        stream.try_write(&data[offset..])
                    };
                    match res {
                        Ok(n) => {
                            if n > 0 {
                                fd = None;
                            }
                            n
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
                Transport::Pty(afd) => {
                    let mut guard = afd.writable().await?;
                    match guard.try_io(|inner| (&inner.get_ref().0).write(&data[offset..])) {
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => return Err(e),
                        Err(_would_block) => continue,
                    }
                }
            };
            offset += written;
        }
        Ok(())
    }
}

struct Pending {
    serial: u64,
    reply: Option<Result<Value, MonitorError>>,
}

pub(crate) struct ChannelInner {
    transport: Transport,
    kind: MonitorTransportKind,
    log_path: Option<PathBuf>,
    serial: AtomicU64,
    /// Held for the duration of one request/reply exchange: at most one
    /// request is in flight.
    send_lock: Mutex<()>,
    pending: StdMutex<Option<Pending>>,
    reply_cond: Notify,
    sticky: StdMutex<Option<MonitorError>>,
    greeting_seen: AtomicBool,
    greeting_cond: Notify,
    caps_done: AtomicBool,
    closing: AtomicBool,
    handler: Arc<dyn DomainEventHandler>,
    event_tx: StdMutex<Option<mpsc::UnboundedSender<QmpEvent>>>,
    reader: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    pub(crate) options_cache: StdMutex<Option<Value>>,
    pub(crate) balloon_path: StdMutex<Option<String>>,
}

/// A reference-counted handle to the monitor channel of one hypervisor.
pub struct QmpChannel {
    inner: Arc<ChannelInner>,
}

impl QmpChannel {
    /// Connect to the hypervisor monitor and complete the QMP handshake:
    /// consume the greeting, then negotiate capabilities exactly once.
    pub async fn open(
        config: MonitorConfig,
        handler: Arc<dyn DomainEventHandler>,
    ) -> Result<Arc<QmpChannel>, MonitorError> {
        let transport = match config.kind {
            MonitorTransportKind::Unix => {
                let deadline = Instant::now() + CONNECT_TIMEOUT;
                loop {
                    match UnixStream::connect(&config.path).await {
                        Ok(stream) => break Transport::Unix(stream),
                        Err(e) => {
                            if config.pid > 0 && !process_alive(config.pid) {
                                let detail = config
                                    .log_path
                                    .as_deref()
                                    .and_then(logfile::read_log_error)
                                    .unwrap_or_else(|| e.to_string());
                                return Err(MonitorError::Connect(format!(
                                    "hypervisor process exited while connecting to monitor: {}",
                                    detail
                                )));
                            }
                            if Instant::now() >= deadline {
                                return Err(MonitorError::Connect(format!(
                                    "monitor socket did not show up in time: {}",
                                    e
                                )));
                            }
                            sleep(CONNECT_RETRY).await;
                        }
                    }
                }
            }
            MonitorTransportKind::Pty => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&config.path)
                    .map_err(|e| MonitorError::Connect(e.to_string()))?;
                Transport::Pty(
                    AsyncFd::new(PtyFile(file)).map_err(|e| MonitorError::Connect(e.to_string()))?,
                )
            }
        };

        let channel = Self::from_transport(transport, config.kind, config.log_path, handler);
        channel.handshake().await?;
        Ok(channel)
    }

    /// Build a channel over an already-connected stream. The caller drives
    /// `handshake` itself. Used for reconnect paths and tests.
    pub fn connect_stream(
        stream: UnixStream,
        log_path: Option<PathBuf>,
        handler: Arc<dyn DomainEventHandler>,
    ) -> Arc<QmpChannel> {
        Self::from_transport(
            Transport::Unix(stream),
            MonitorTransportKind::Unix,
            log_path,
            handler,
        )
    }

    fn from_transport(
        transport: Transport,
        kind: MonitorTransportKind,
        log_path: Option<PathBuf>,
        handler: Arc<dyn DomainEventHandler>,
    ) -> Arc<QmpChannel> {
        let inner = Arc::new(ChannelInner {
            transport,
            kind,
            log_path,
            serial: AtomicU64::new(0),
            send_lock: Mutex::new(()),
            pending: StdMutex::new(None),
            reply_cond: Notify::new(),
            sticky: StdMutex::new(None),
            greeting_seen: AtomicBool::new(false),
            greeting_cond: Notify::new(),
            caps_done: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            handler,
            event_tx: StdMutex::new(None),
            reader: StdMutex::new(None),
            options_cache: StdMutex::new(None),
            balloon_path: StdMutex::new(None),
        });

        // Ordered event dispatch, decoupled from the reader so a handler
        // blocking on the domain lock cannot stall the parser.
        let (tx, mut rx) = mpsc::unbounded_channel::<QmpEvent>();
        *inner.event_tx.lock().unwrap() = Some(tx);
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    dispatch_event(inner.handler.as_ref(), &event).await;
                }
                if !inner.closing.load(Ordering::SeqCst) {
                    inner.handler.eof().await;
                }
            });
        }

        let reader = {
            let inner = inner.clone();
            tokio::spawn(async move {
                inner.read_loop().await;
            })
        };
        *inner.reader.lock().unwrap() = Some(reader);

        Arc::new(QmpChannel { inner })
    }

    /// Wait for the greeting, then issue `qmp_capabilities` exactly once.
    pub async fn handshake(&self) -> Result<(), MonitorError> {
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let notified = self.inner.greeting_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.greeting_seen.load(Ordering::SeqCst) {
                break;
            }
            if let Some(e) = self.sticky_error() {
                return Err(e);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(MonitorError::Connect(
                    "timed out waiting for monitor greeting".to_string(),
                ));
            }
        }

        if !self.inner.caps_done.swap(true, Ordering::SeqCst) {
            self.send("qmp_capabilities", None, None).await?;
        }
        Ok(())
    }

    pub(crate) fn inner(&self) -> &ChannelInner {
        &self.inner
    }

    pub fn kind(&self) -> MonitorTransportKind {
        self.inner.kind
    }

    pub fn supports_fd_passing(&self) -> bool {
        self.inner.transport.supports_fd_passing()
    }

    pub fn sticky_error(&self) -> Option<MonitorError> {
        self.inner.sticky.lock().unwrap().clone()
    }

    /// Whether the channel can still carry requests.
    pub fn is_usable(&self) -> bool {
        self.sticky_error().is_none()
    }

    /// Issue one command and wait for its correlated reply. Blocks while an
    /// earlier request is still in flight. A set `fd` rides along as
    /// `SCM_RIGHTS` ancillary data and requires a UNIX-socket transport.
    pub async fn send(
        &self,
        cmd: &str,
        args: Option<Value>,
        fd: Option<RawFd>,
    ) -> Result<Value, MonitorError> {
        if let Some(e) = self.sticky_error() {
            return Err(e);
        }
        if fd.is_some() && !self.supports_fd_passing() {
            return Err(MonitorError::Unsupported(
                "file descriptor passing is not supported on this monitor".to_string(),
            ));
        }

        let _permit = self.inner.send_lock.lock().await;
        // The channel may have failed while this sender was queued.
        if let Some(e) = self.sticky_error() {
            return Err(e);
        }

        let serial = self.inner.serial.fetch_add(1, Ordering::SeqCst);
        let mut msg = serde_json::json!({
            "execute": cmd,
            "id": serial.to_string(),
        });
        if let Some(args) = args {
            msg["arguments"] = args;
        }
        let mut frame = serde_json::to_vec(&msg)
            .map_err(|e| MonitorError::Protocol(format!("encoding request: {}", e)))?;
        frame.push(b'\n');

        *self.inner.pending.lock().unwrap() = Some(Pending {
            serial,
            reply: None,
        });
        debug!(sl!(), "monitor send"; "cmd" => cmd, "id" => serial);

        if let Err(e) = self.inner.transport.write_frame(&frame, fd).await {
            self.inner.pending.lock().unwrap().take();
            return Err(self.inner.fail(MonitorError::Io(e.to_string())));
        }

        loop {
            let notified = self.inner.reply_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut pending = self.inner.pending.lock().unwrap();
                if let Some(p) = pending.as_mut() {
                    if let Some(reply) = p.reply.take() {
                        *pending = None;
                        return reply;
                    }
                }
            }
            if let Some(e) = self.sticky_error() {
                self.inner.pending.lock().unwrap().take();
                return Err(e);
            }
            notified.await;
        }
    }

    /// Tear the channel down: stop the I/O task, fail any blocked sender,
    /// and make the close reason the sticky error if none is set yet.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        {
            let mut sticky = self.inner.sticky.lock().unwrap();
            if sticky.is_none() {
                *sticky = Some(MonitorError::Closed("monitor was closed".to_string()));
            }
        }
        self.inner.reply_cond.notify_waiters();
        self.inner.greeting_cond.notify_waiters();
        if let Some(reader) = self.inner.reader.lock().unwrap().take() {
            reader.abort();
        }
        // Dropping the queue ends the dispatcher once drained.
        self.inner.event_tx.lock().unwrap().take();
    }
}

impl Drop for QmpChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.inner.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

impl ChannelInner {
    async fn read_loop(self: Arc<Self>) {
        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        loop {
            match self.transport.read_append(&mut buf).await {
                Ok(0) => {
                    self.fail(MonitorError::Closed("end of file from monitor".to_string()));
                    break;
                }
                Ok(_) => {
                    if let Err(e) = self.drain_frames(&mut buf) {
                        self.fail(e);
                        break;
                    }
                }
                Err(e) => {
                    self.fail(MonitorError::Io(e.to_string()));
                    break;
                }
            }
        }
        // End the dispatcher queue; it reports EOF to the handler unless
        // this was a deliberate close.
        self.event_tx.lock().unwrap().take();
    }

    /// Split complete lines out of the receive buffer and route them.
    fn drain_frames(&self, buf: &mut Vec<u8>) -> Result<(), MonitorError> {
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(trimmed).map_err(|e| {
                MonitorError::Protocol(format!("malformed monitor message: {}", e))
            })?;
            self.route(value)?;
        }
        Ok(())
    }

    fn route(&self, value: Value) -> Result<(), MonitorError> {
        if value.get("QMP").is_some() {
            self.greeting_seen.store(true, Ordering::SeqCst);
            self.greeting_cond.notify_waiters();
            return Ok(());
        }

        if value.get("event").is_some() {
            if let Some(event) = QmpEvent::from_value(&value) {
                trace!(sl!(), "monitor event"; "event" => &event.name);
                if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
                    let _ = tx.send(event);
                }
            }
            return Ok(());
        }

        if value.get("return").is_some() || value.get("error").is_some() {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<u64>().ok());
            let reply = if let Some(err) = value.get("error") {
                Err(MonitorError::Qmp {
                    class: err
                        .get("class")
                        .and_then(Value::as_str)
                        .unwrap_or("GenericError")
                        .to_string(),
                    desc: err
                        .get("desc")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                })
            } else {
                Ok(value.get("return").cloned().unwrap_or(Value::Null))
            };

            let mut pending = self.pending.lock().unwrap();
            match (pending.as_mut(), id) {
                (Some(p), Some(id)) if p.serial == id => {
                    p.reply = Some(reply);
                    self.reply_cond.notify_waiters();
                }
                _ => {
                    warn!(sl!(), "dropping uncorrelated monitor reply"; "id" => format!("{:?}", id));
                }
            }
            return Ok(());
        }

        warn!(sl!(), "unrecognized monitor message");
        Ok(())
    }

    /// Put the channel into failed state. The first fatal error wins and is
    /// upgraded with a log-file excerpt when one is available.
    fn fail(&self, raw: MonitorError) -> MonitorError {
        let out = {
            let mut sticky = self.sticky.lock().unwrap();
            if sticky.is_none() {
                let polished = match &raw {
                    MonitorError::Io(_) | MonitorError::Closed(_) => self
                        .log_path
                        .as_deref()
                        .and_then(logfile::read_log_error)
                        .map(MonitorError::Closed)
                        .unwrap_or_else(|| raw.clone()),
                    _ => raw.clone(),
                };
                warn!(sl!(), "monitor channel failed"; "error" => polished.to_string());
                *sticky = Some(polished);
            }
            sticky.clone().unwrap()
        };
        self.reply_cond.notify_waiters();
        self.greeting_cond.notify_waiters();
        out
    }
}

fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct NullHandler;

    #[async_trait::async_trait]
    impl DomainEventHandler for NullHandler {}

    async fn greeted_pair() -> (Arc<QmpChannel>, tokio::net::unix::OwnedWriteHalf, BufReader<tokio::net::unix::OwnedReadHalf>) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let channel = QmpChannel::connect_stream(ours, None, Arc::new(NullHandler));
        let (rx, mut tx) = theirs.into_split();
        tx.write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();
        let mut reader = BufReader::new(rx);

        // Answer the qmp_capabilities handshake.
        let channel2 = channel.clone();
        let handshake = tokio::spawn(async move { channel2.handshake().await });
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["execute"], "qmp_capabilities");
        let id = req["id"].as_str().unwrap();
        tx.write_all(format!("{{\"return\": {{}}, \"id\": \"{}\"}}\n", id).as_bytes())
            .await
            .unwrap();
        handshake.await.unwrap().unwrap();

        (channel, tx, reader)
    }

    #[tokio::test]
    async fn test_send_correlates_reply() {
        let (channel, mut tx, mut reader) = greeted_pair().await;

        let peer = tokio::spawn(async move {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["execute"], "query-status");
            let id = req["id"].as_str().unwrap().to_string();
            // An unsolicited event between request and reply must not
            // confuse the correlation.
            tx.write_all(b"{\"event\": \"RTC_CHANGE\", \"data\": {\"offset\": 5}}\n")
                .await
                .unwrap();
            tx.write_all(
                format!(
                    "{{\"return\": {{\"status\": \"running\", \"running\": true}}, \"id\": \"{}\"}}\n",
                    id
                )
                .as_bytes(),
            )
            .await
            .unwrap();
            (tx, reader)
        });

        let reply = channel.send("query-status", None, None).await.unwrap();
        assert_eq!(reply["status"], "running");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_qmp_error_is_not_sticky() {
        let (channel, mut tx, mut reader) = greeted_pair().await;

        let peer = tokio::spawn(async move {
            for _ in 0..2 {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let req: Value = serde_json::from_str(&line).unwrap();
                let id = req["id"].as_str().unwrap().to_string();
                if req["execute"] == "device_del" {
                    tx.write_all(format!("{{\"error\": {{\"class\": \"DeviceNotFound\", \"desc\": \"no device\"}}, \"id\": \"{}\"}}\n", id).as_bytes()).await.unwrap();
                } else {
                    tx.write_all(format!("{{\"return\": {{}}, \"id\": \"{}\"}}\n", id).as_bytes())
                        .await
                        .unwrap();
                }
            }
            (tx, reader)
        });

        let err = channel
            .send("device_del", Some(serde_json::json!({"id": "nope"})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Qmp { .. }));
        assert!(channel.is_usable());
        channel.send("query-kvm", None, None).await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_hangup_makes_error_sticky() {
        let (channel, tx, reader) = greeted_pair().await;
        drop(tx);
        drop(reader);

        // Allow the reader task to observe EOF.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = channel.send("query-status", None, None).await.unwrap_err();
        assert!(first.is_fatal());
        let second = channel.send("query-kvm", None, None).await.unwrap_err();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_events_dispatch_in_order() {
        use std::sync::Mutex as SyncMutex;

        #[derive(Default)]
        struct Collect {
            offsets: SyncMutex<Vec<i64>>,
            notify: Notify,
        }

        #[async_trait::async_trait]
        impl DomainEventHandler for Collect {
            async fn rtc_change(&self, offset: i64) {
                self.offsets.lock().unwrap().push(offset);
                self.notify.notify_waiters();
            }
        }

        let (ours, theirs) = UnixStream::pair().unwrap();
        let handler = Arc::new(Collect::default());
        let _channel = QmpChannel::connect_stream(ours, None, handler.clone());
        let (_rx, mut tx) = theirs.into_split();
        tx.write_all(b"{\"QMP\": {}}\n").await.unwrap();
        for offset in [1i64, 2, 3] {
            tx.write_all(
                format!(
                    "{{\"event\": \"RTC_CHANGE\", \"data\": {{\"offset\": {}}}}}\n",
                    offset
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        }

        for _ in 0..100 {
            if handler.offsets.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*handler.offsets.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_sticky_error_takes_precedence_over_send() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let channel = QmpChannel::connect_stream(ours, None, Arc::new(NullHandler));
        assert!(channel.supports_fd_passing());
        drop(theirs);
        channel.close();
        let err = channel.send("getfd", None, Some(0)).await.unwrap_err();
        assert!(err.is_fatal());
    }
}

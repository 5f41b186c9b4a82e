//! The duplex channel.

use std::io::{self, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use employee_protocol::{encode_frame, keys, names, Message, Meta, Report};
use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};
use crate::fdpass;
use crate::reader::MessageReader;

/// Work for the send loop.
enum Outbound {
    /// An encoded frame and the descriptor that follows it.
    Frame {
        frame: Vec<u8>,
        descriptor: Option<OwnedFd>,
    },
    /// Acknowledged once every earlier frame has been written.
    Flush(Sender<()>),
}

/// How long dropping a channel waits for queued frames.
const DROP_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Full-duplex transport over one socket.
///
/// `send` never blocks on I/O; `read` blocks until a message or a transport
/// failure is available.
pub struct Channel {
    socket: Arc<UnixStream>,
    outbound: Sender<Outbound>,
    inbound: Receiver<Message>,
    failure: OnceLock<String>,
}

impl Channel {
    /// Take ownership of a connected socket and start both transport loops.
    ///
    /// The loop threads are detached: they never keep the process alive.
    pub fn open(socket: UnixStream) -> ChannelResult<Self> {
        let socket = Arc::new(socket);
        let (outbound_tx, outbound_rx) = unbounded::<Outbound>();
        let (inbound_tx, inbound_rx) = unbounded::<Message>();

        {
            let socket = Arc::clone(&socket);
            let inbound = inbound_tx.clone();
            thread::Builder::new()
                .name("employee-send".to_string())
                .spawn(move || {
                    let died = inbound.clone();
                    guarded("send", &died, || send_loop(socket, outbound_rx, inbound))
                })?;
        }
        {
            let socket = Arc::clone(&socket);
            let outbound = outbound_tx.clone();
            thread::Builder::new()
                .name("employee-recv".to_string())
                .spawn(move || {
                    let died = inbound_tx.clone();
                    guarded("receive", &died, || receive_loop(socket, inbound_tx, outbound))
                })?;
        }

        Ok(Self {
            socket,
            outbound: outbound_tx,
            inbound: inbound_rx,
            failure: OnceLock::new(),
        })
    }

    /// Queue a message.
    ///
    /// The frame is encoded here, so an oversized meta fails before anything
    /// reaches the socket. A descriptor is closed locally once sent.
    pub fn send(&self, meta: &Meta, payload: &[u8], descriptor: Option<OwnedFd>) -> ChannelResult<()> {
        if let Some(reason) = self.failure.get() {
            return Err(ChannelError::ConnectionLost(reason.clone()));
        }
        let frame = encode_frame(meta, payload, descriptor.is_some())?;
        self.outbound
            .send(Outbound::Frame { frame, descriptor })
            .map_err(|_| ChannelError::Closed)
    }

    /// Queue a typed report.
    pub fn report(&self, report: Report) -> ChannelResult<()> {
        let (meta, payload) = report.into_parts();
        self.send(&meta, &payload, None)
    }

    /// Block until the next message.
    ///
    /// A transport failure queued by either loop is returned as
    /// [`ChannelError::ConnectionLost`], and every later call returns it too.
    pub fn read(&self) -> ChannelResult<Message> {
        if let Some(reason) = self.failure.get() {
            return Err(ChannelError::ConnectionLost(reason.clone()));
        }

        let message = self.inbound.recv().map_err(|_| ChannelError::Closed)?;
        match message.raised() {
            Some(reason) => {
                let reason = self.failure.get_or_init(|| reason.to_string()).clone();
                Err(ChannelError::ConnectionLost(reason))
            }
            None => Ok(message),
        }
    }

    /// Wait until every message queued so far has been written.
    ///
    /// Returns `Ok(false)` if `timeout` passed first.
    pub fn flush(&self, timeout: Duration) -> ChannelResult<bool> {
        let (ack_tx, ack_rx) = bounded(1);
        self.outbound
            .send(Outbound::Flush(ack_tx))
            .map_err(|_| ChannelError::Closed)?;
        match ack_rx.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => match self.failure.get() {
                Some(reason) => Err(ChannelError::ConnectionLost(reason.clone())),
                None => Err(ChannelError::Closed),
            },
        }
    }

    /// A handle that queues reports from another thread.
    pub fn reporter(&self) -> Reporter {
        Reporter {
            outbound: self.outbound.clone(),
        }
    }

    /// The socket descriptor, for handles that must be closed in forked children.
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Sending half of a [`Channel`], usable while the owner is busy.
///
/// It does not see failures the owner has already read; a dead send loop
/// shows up as [`ChannelError::Closed`].
#[derive(Clone)]
pub struct Reporter {
    outbound: Sender<Outbound>,
}

impl Reporter {
    /// Queue a typed report.
    pub fn report(&self, report: Report) -> ChannelResult<()> {
        let (meta, payload) = report.into_parts();
        let frame = encode_frame(&meta, &payload, false)?;
        self.outbound
            .send(Outbound::Frame {
                frame,
                descriptor: None,
            })
            .map_err(|_| ChannelError::Closed)
    }

    /// Wait until every report queued so far has been written.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = bounded(1);
        if self.outbound.send(Outbound::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for Channel {
    /// Write out what is queued, then shut the socket down so both loops end.
    fn drop(&mut self) {
        if let Ok(false) = self.flush(DROP_FLUSH_TIMEOUT) {
            tracing::warn!("dropping channel with unsent messages");
        }
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

fn connection_died(reason: String) -> Message {
    Message::new(Meta::typed(names::DIE).with(keys::RAISE, reason))
}

/// Run a loop body; if it panics, still unblock the reader.
fn guarded(name: &str, inbound: &Sender<Message>, body: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(body)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(%reason, "{} loop panicked", name);
        let _ = inbound.send(connection_died(format!("{} loop panicked: {}", name, reason)));
    }
}

fn send_loop(socket: Arc<UnixStream>, outbound: Receiver<Outbound>, inbound: Sender<Message>) {
    for item in outbound.iter() {
        let (frame, descriptor) = match item {
            Outbound::Frame { frame, descriptor } => (frame, descriptor),
            Outbound::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };
        if let Err(e) = write_outbound(&socket, &frame, descriptor.as_ref()) {
            tracing::warn!(error = %e, "send loop failed, closing connection");
            // queued ahead of the receive loop's EOF, so the send error is what read() reports
            let _ = inbound.send(connection_died(format!("send failed: {}", e)));
            let _ = socket.shutdown(Shutdown::Both);
            return;
        }
    }
    tracing::debug!("outbound queue closed, send loop exiting");
}

fn write_outbound(socket: &UnixStream, frame: &[u8], descriptor: Option<&OwnedFd>) -> io::Result<()> {
    let mut writer = socket;
    writer.write_all(frame)?;
    if let Some(descriptor) = descriptor {
        fdpass::send_descriptor(socket.as_fd(), descriptor.as_fd())?;
    }
    Ok(())
}

fn receive_loop(socket: Arc<UnixStream>, inbound: Sender<Message>, outbound: Sender<Outbound>) {
    let mut reader = MessageReader::new(socket);

    loop {
        let message = match reader.read_message() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "receive loop failed");
                let _ = inbound.send(connection_died(format!("receive failed: {}", e)));
                return;
            }
        };

        if message.kind() == names::HEARTBEAT {
            let seq = message.meta.get("seq").and_then(Value::as_u64);
            let (meta, payload) = Report::Heartbeat { seq }.into_parts();
            match encode_frame(&meta, &payload, false) {
                Ok(frame) => {
                    if outbound.send(Outbound::Frame { frame, descriptor: None }).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::error!(error = %e, "could not encode heartbeat reply"),
            }
            continue;
        }

        if inbound.send(message).is_err() {
            tracing::debug!("inbound queue closed, receive loop exiting");
            return;
        }
    }
}

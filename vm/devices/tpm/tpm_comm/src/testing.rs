// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory I/O and clock doubles for unit tests.

use crate::io::AsyncIo;
use crate::io::IoCallbacks;
use crate::io::SendId;
use crate::tick::TickSource;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

/// Installs a tracing subscriber that writes through the test harness.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// A tick source that advances by a fixed step on every reading.
pub(crate) struct StepTicks {
    now: Cell<u64>,
    step: u64,
}

impl StepTicks {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            now: Cell::new(start),
            step,
        }
    }
}

impl TickSource for StepTicks {
    fn now_ms(&self) -> u64 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(self.step));
        now
    }
}

#[derive(Default)]
struct Shared {
    pumps: usize,
    opens: usize,
    open_call_fails: bool,
    refuse_open: bool,
    pending_open: Option<io::Result<()>>,
    pending_error: bool,
    reject_sends: bool,
    stall_sends: bool,
    sends: Vec<Vec<u8>>,
    unacked: VecDeque<SendId>,
    acked: usize,
    replies: Vec<(usize, Vec<Vec<u8>>)>,
    inbound: VecDeque<Vec<u8>>,
    closed: bool,
    close_pending: bool,
}

/// A scripted peer. Every pump completes all queued sends and then delivers
/// at most one inbound chunk, so multi-chunk replies arrive as partial
/// deliveries. A scripted connection error fails the sends still queued.
pub(crate) struct ScriptedIo {
    shared: Arc<Mutex<Shared>>,
}

/// Test-side handle for scripting and inspecting a [`ScriptedIo`].
#[derive(Clone)]
pub(crate) struct IoProbe {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedIo {
    pub fn new() -> (Self, IoProbe) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                shared: shared.clone(),
            },
            IoProbe { shared },
        )
    }
}

enum Event {
    Open(io::Result<()>),
    Error,
    SendComplete(SendId),
    SendFailed(SendId),
    Bytes(Vec<u8>),
    Closed,
}

impl AsyncIo for ScriptedIo {
    fn open(&mut self) -> io::Result<()> {
        let mut shared = self.shared.lock();
        if shared.open_call_fails {
            return Err(io::ErrorKind::AddrNotAvailable.into());
        }
        shared.opens += 1;
        shared.pending_open = Some(if shared.refuse_open {
            Err(io::ErrorKind::ConnectionRefused.into())
        } else {
            Ok(())
        });
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<SendId> {
        let mut shared = self.shared.lock();
        if shared.reject_sends || shared.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let id = SendId(shared.sends.len() as u64);
        shared.sends.push(data.to_vec());
        shared.unacked.push_back(id);
        Ok(id)
    }

    fn do_work(&mut self, callbacks: &mut dyn IoCallbacks) {
        let mut events = Vec::new();
        {
            let mut shared = self.shared.lock();
            let shared = &mut *shared;
            shared.pumps += 1;
            if let Some(result) = shared.pending_open.take() {
                events.push(Event::Open(result));
            }
            if std::mem::take(&mut shared.pending_error) {
                events.extend(shared.unacked.drain(..).map(Event::SendFailed));
                events.push(Event::Error);
            }
            if !shared.stall_sends {
                while let Some(id) = shared.unacked.pop_front() {
                    shared.acked += 1;
                    let acked = shared.acked;
                    if let Some(i) = shared.replies.iter().position(|(n, _)| *n == acked) {
                        let (_, chunks) = shared.replies.remove(i);
                        shared.inbound.extend(chunks);
                    }
                    events.push(Event::SendComplete(id));
                }
            }
            if let Some(chunk) = shared.inbound.pop_front() {
                events.push(Event::Bytes(chunk));
            }
            if std::mem::take(&mut shared.close_pending) {
                events.push(Event::Closed);
            }
        }

        for event in events {
            match event {
                Event::Open(result) => callbacks.on_open_complete(result),
                Event::Error => callbacks.on_error(io::ErrorKind::ConnectionReset.into()),
                Event::SendComplete(id) => callbacks.on_send_complete(id, Ok(())),
                Event::SendFailed(id) => {
                    callbacks.on_send_complete(id, Err(io::ErrorKind::ConnectionReset.into()))
                }
                Event::Bytes(data) => callbacks.on_bytes_received(&data),
                Event::Closed => callbacks.on_close_complete(),
            }
        }
    }

    fn close(&mut self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        shared.close_pending = true;
    }
}

impl IoProbe {
    /// Queues `data` for delivery on a later pump.
    pub fn deliver(&self, data: &[u8]) {
        self.shared.lock().inbound.push_back(data.to_vec());
    }

    /// Queues `chunks` for delivery once the `nth` send (1-based, counted
    /// over the connection's lifetime) completes.
    pub fn reply_after_send(&self, nth: usize, chunks: &[&[u8]]) {
        self.shared
            .lock()
            .replies
            .push((nth, chunks.iter().map(|c| c.to_vec()).collect()));
    }

    /// Reports a connection error on the next pump.
    pub fn fail_connection(&self) {
        self.shared.lock().pending_error = true;
    }

    /// Makes the next open complete with an error.
    pub fn refuse_open(&self) {
        self.shared.lock().refuse_open = true;
    }

    /// Makes the open call itself fail.
    pub fn fail_open_call(&self) {
        self.shared.lock().open_call_fails = true;
    }

    /// Stops completing sends.
    pub fn stall_sends(&self) {
        self.shared.lock().stall_sends = true;
    }

    /// Makes subsequent sends fail to queue.
    pub fn reject_sends(&self) {
        self.shared.lock().reject_sends = true;
    }

    pub fn pumps(&self) -> usize {
        self.shared.lock().pumps
    }

    pub fn opens(&self) -> usize {
        self.shared.lock().opens
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// How many sends have been written to the peer. Queued sends that were
    /// never pumped out are not counted.
    pub fn acked(&self) -> usize {
        self.shared.lock().acked
    }

    /// Every send, in order.
    pub fn sends(&self) -> Vec<Vec<u8>> {
        self.shared.lock().sends.clone()
    }

    /// Every byte sent, concatenated.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.shared.lock().sends.concat()
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A non-blocking TCP socket driven through [`AsyncIo`].

use crate::io::AsyncIo;
use crate::io::IoCallbacks;
use crate::io::SendId;
use socket2::Domain;
use socket2::Protocol;
use socket2::SockAddr;
use socket2::Socket;
use socket2::Type;
use std::collections::VecDeque;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;

const READ_CHUNK: usize = 4096;

/// How long an idle pump blocks the calling thread before returning, to
/// yield the CPU while a blocking wait spins on `do_work`.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

enum State {
    Idle,
    Connecting(Socket),
    Open(TcpStream),
    Closed,
}

struct QueuedSend {
    id: SendId,
    data: Vec<u8>,
    written: usize,
}

/// A TCP client socket that performs its I/O from [`AsyncIo::do_work`].
pub struct TcpSocketIo {
    addr: SocketAddr,
    state: State,
    queue: VecDeque<QueuedSend>,
    next_id: u64,
    open_error: Option<io::Error>,
    close_pending: bool,
}

impl TcpSocketIo {
    /// Resolves `host:port`, using the first address found.
    pub fn new(host: &str, port: u16) -> io::Result<Self> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{host} did not resolve to any address"),
            )
        })?;
        Ok(Self::from_addr(addr))
    }

    /// Creates a socket that will connect to `addr`.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: State::Idle,
            queue: VecDeque::new(),
            next_id: 0,
            open_error: None,
            close_pending: false,
        }
    }

    fn start_connect(&self) -> io::Result<Socket> {
        let socket = Socket::new(
            Domain::for_address(self.addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Advances a pending connect. Returns true if anything happened.
    fn poll_connect(&mut self, callbacks: &mut dyn IoCallbacks) -> bool {
        if let Some(err) = self.open_error.take() {
            self.fail_queued(callbacks);
            callbacks.on_open_complete(Err(err));
            return true;
        }

        let mut progress = false;
        self.state = match std::mem::replace(&mut self.state, State::Closed) {
            State::Connecting(socket) => match connect_status(&socket) {
                Ok(false) => State::Connecting(socket),
                Ok(true) => {
                    progress = true;
                    let stream = TcpStream::from(socket);
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!(
                            error = &err as &dyn std::error::Error,
                            "failed to disable nagle"
                        );
                    }
                    tracing::debug!(addr = %self.addr, "socket connected");
                    callbacks.on_open_complete(Ok(()));
                    State::Open(stream)
                }
                Err(err) => {
                    progress = true;
                    self.fail_queued(callbacks);
                    callbacks.on_open_complete(Err(err));
                    State::Closed
                }
            },
            state => state,
        };
        progress
    }

    /// Writes as much of the queue as the socket accepts.
    fn flush(&mut self, callbacks: &mut dyn IoCallbacks) -> io::Result<bool> {
        let State::Open(stream) = &mut self.state else {
            return Ok(false);
        };
        let mut progress = false;
        while let Some(front) = self.queue.front_mut() {
            if front.written == front.data.len() {
                let id = front.id;
                self.queue.pop_front();
                callbacks.on_send_complete(id, Ok(()));
                progress = true;
                continue;
            }
            match stream.write(&front.data[front.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    front.written += n;
                    progress = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(progress)
    }

    /// Delivers everything the socket has buffered.
    fn receive(&mut self, callbacks: &mut dyn IoCallbacks) -> io::Result<bool> {
        let State::Open(stream) = &mut self.state else {
            return Ok(false);
        };
        let mut progress = false;
        let mut buf = [0; READ_CHUNK];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                Ok(n) => {
                    callbacks.on_bytes_received(&buf[..n]);
                    progress = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(progress)
    }

    fn transfer(&mut self, callbacks: &mut dyn IoCallbacks) -> io::Result<bool> {
        let wrote = self.flush(callbacks)?;
        let read = self.receive(callbacks)?;
        Ok(wrote || read)
    }

    fn fail_queued(&mut self, callbacks: &mut dyn IoCallbacks) {
        for send in self.queue.drain(..) {
            callbacks.on_send_complete(send.id, Err(io::ErrorKind::NotConnected.into()));
        }
    }

    fn fail(&mut self, err: io::Error, callbacks: &mut dyn IoCallbacks) {
        tracing::debug!(
            addr = %self.addr,
            error = &err as &dyn std::error::Error,
            "socket failed"
        );
        self.state = State::Closed;
        self.fail_queued(callbacks);
        callbacks.on_error(err);
    }
}

impl AsyncIo for TcpSocketIo {
    fn open(&mut self) -> io::Result<()> {
        if !matches!(self.state, State::Idle | State::Closed) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "socket is already open",
            ));
        }
        let socket = self.start_connect()?;
        self.close_pending = false;
        match socket.connect(&SockAddr::from(self.addr)) {
            Ok(()) => self.state = State::Connecting(socket),
            Err(err) if connect_in_progress(&err) => self.state = State::Connecting(socket),
            Err(err) => {
                self.state = State::Closed;
                self.open_error = Some(err);
            }
        }
        tracing::trace!(addr = %self.addr, "socket connecting");
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<SendId> {
        if !matches!(self.state, State::Connecting(_) | State::Open(_)) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let id = SendId(self.next_id);
        self.next_id += 1;
        self.queue.push_back(QueuedSend {
            id,
            data: data.to_vec(),
            written: 0,
        });
        Ok(id)
    }

    fn do_work(&mut self, callbacks: &mut dyn IoCallbacks) {
        let mut progress = self.poll_connect(callbacks);

        match self.transfer(callbacks) {
            Ok(moved) => progress |= moved,
            Err(err) => {
                self.fail(err, callbacks);
                progress = true;
            }
        }

        if std::mem::take(&mut self.close_pending) {
            callbacks.on_close_complete();
            progress = true;
        }

        if !progress {
            std::thread::sleep(IDLE_BACKOFF);
        }
    }

    fn close(&mut self) {
        if let State::Open(stream) = &self.state {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = State::Closed;
        self.queue.clear();
        self.open_error = None;
        self.close_pending = true;
    }
}

/// Whether a non-blocking connect has finished: `Ok(false)` while it is
/// still in flight.
fn connect_status(socket: &Socket) -> io::Result<bool> {
    if let Some(err) = socket.take_error()? {
        return Err(err);
    }
    match socket.peer_addr() {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

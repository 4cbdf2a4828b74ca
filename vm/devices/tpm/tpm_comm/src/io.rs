// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The callback-driven I/O surface that the simulator transport is built on.
//!
//! An [`AsyncIo`] never blocks. Work is only performed, and callbacks are
//! only invoked, from inside [`AsyncIo::do_work`], which the caller pumps
//! until whatever it is waiting for has happened.

use std::io;

/// Identifies a send queued with [`AsyncIo::send`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SendId(pub u64);

/// Notifications delivered by [`AsyncIo::do_work`].
pub trait IoCallbacks {
    /// The open started by [`AsyncIo::open`] finished.
    fn on_open_complete(&mut self, result: io::Result<()>);

    /// Bytes arrived from the peer, in order.
    fn on_bytes_received(&mut self, data: &[u8]);

    /// The send identified by `id` was fully handed to the transport, or
    /// failed.
    fn on_send_complete(&mut self, id: SendId, result: io::Result<()>);

    /// The connection failed. No further data will be delivered.
    fn on_error(&mut self, error: io::Error);

    /// The close started by [`AsyncIo::close`] finished.
    fn on_close_complete(&mut self) {}
}

/// A non-blocking, callback-driven byte stream.
pub trait AsyncIo {
    /// Starts opening the stream. Completion is reported through
    /// [`IoCallbacks::on_open_complete`].
    fn open(&mut self) -> io::Result<()>;

    /// Queues `data` for sending. Fails only if the send could not be queued
    /// at all; transfer failures are reported through
    /// [`IoCallbacks::on_send_complete`].
    fn send(&mut self, data: &[u8]) -> io::Result<SendId>;

    /// Performs any pending work without blocking, invoking `callbacks` for
    /// everything that completed.
    fn do_work(&mut self, callbacks: &mut dyn IoCallbacks);

    /// Starts closing the stream. Queued sends are discarded.
    fn close(&mut self);
}

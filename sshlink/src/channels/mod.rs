// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Logical channels multiplexed over a session (RFC 4254).
//!
//! A [`Channel`] is created by one of the session's channel factories,
//! which reserves a local channel number in the session's table. It is
//! opened by [`Channel::open`], which waits for the server's
//! confirmation. Messages the server sends on the channel are read with
//! [`Channel::wait`].
//!
//! Flow control: the remote window is the number of bytes we may still
//! send. [`Channel::data`] splits its input into packets that fit both
//! the window and the server's maximum packet size, waiting for window
//! adjustments when needed. The local window is replenished once half
//! of it has been consumed by [`Channel::wait`].
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use log::{debug, trace, warn};
use ssh_encoding::Encode;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Notify};

use crate::client::Handle;
use crate::{msg, ChannelId, Error, Sig};

/// What a channel connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// An interactive shell, a command or a subsystem.
    Session,
    /// A connection made by the server on our behalf (local and dynamic
    /// forwarding).
    DirectTcpip {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
    },
    /// A connection accepted by the server on a remotely forwarded port.
    ForwardedTcpip {
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
}

impl ChannelKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
        }
    }

    /// Type-specific fields of SSH_MSG_CHANNEL_OPEN.
    fn encode_open(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            ChannelKind::Session => {}
            ChannelKind::DirectTcpip {
                host_to_connect: a,
                port_to_connect: p,
                originator_address: oa,
                originator_port: op,
            }
            | ChannelKind::ForwardedTcpip {
                connected_address: a,
                connected_port: p,
                originator_address: oa,
                originator_port: op,
            } => {
                a.encode(buf)?;
                p.encode(buf)?;
                oa.encode(buf)?;
                op.encode(buf)?;
            }
        }
        Ok(())
    }
}

/// Messages the server sends on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelMsg {
    Data {
        data: Bytes,
    },
    /// `ext` is 1 for stderr.
    ExtendedData {
        data: Bytes,
        ext: u32,
    },
    Eof,
    Close,
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    /// The server increased our sending window, which is now `new_size`.
    WindowAdjusted {
        new_size: u32,
    },
}

/// Terminal modes for [`Channel::request_pty`] (RFC 4254, section 8).
#[allow(non_camel_case_types, missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pty {
    VINTR = 1,
    VQUIT = 2,
    VERASE = 3,
    VKILL = 4,
    VEOF = 5,
    VSUSP = 10,
    ISIG = 50,
    ICANON = 51,
    ECHO = 53,
    ECHOE = 54,
    ECHOK = 55,
    ECHONL = 56,
    ONLCR = 72,
    CS8 = 91,
    TTY_OP_ISPEED = 128,
    TTY_OP_OSPEED = 129,
}

const TTY_OP_END: u8 = 0;

/// Largest data chunk that fits a packet: room is left for the
/// CHANNEL_EXTENDED_DATA header, the packet framing and the MAC.
pub(crate) const MAX_CHUNK_LEN: usize = crate::cipher::MAXIMUM_PACKET_LEN - 64 - 13;

/// State shared by a channel handle and the session's event loop.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub remote_id: OnceLock<u32>,
    /// Bytes we may still send.
    pub remote_window: Mutex<u32>,
    pub window_changed: Notify,
    pub max_packet: AtomicU32,
    /// Bytes the server may still send.
    pub local_window: AtomicU32,
    pub closed: AtomicBool,
}

impl ChannelState {
    pub fn new(local_window: u32) -> Self {
        ChannelState {
            remote_id: OnceLock::new(),
            remote_window: Mutex::new(0),
            window_changed: Notify::new(),
            max_packet: AtomicU32::new(0),
            local_window: AtomicU32::new(local_window),
            closed: AtomicBool::new(false),
        }
    }

    /// Record the server's side of the channel, from a confirmation or
    /// an incoming open.
    pub fn confirm(&self, remote_id: u32, window: u32, max_packet: u32) {
        let _ = self.remote_id.set(remote_id);
        self.max_packet.store(max_packet, Ordering::SeqCst);
        if let Ok(mut w) = self.remote_window.lock() {
            *w = window;
        }
        self.window_changed.notify_waiters();
    }

    pub fn adjust_remote_window(&self, n: u32) -> u32 {
        let new_size = match self.remote_window.lock() {
            Ok(mut w) => {
                *w = w.saturating_add(n);
                *w
            }
            Err(_) => 0,
        };
        self.window_changed.notify_waiters();
        new_size
    }

    /// Account for `n` received bytes, returning how many of them fit
    /// in the window.
    pub fn consume_local_window(&self, n: usize) -> usize {
        let mut accepted = 0;
        let _ = self
            .local_window
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                accepted = (w as usize).min(n);
                Some(w - accepted as u32)
            });
        accepted
    }

    /// Give back window taken by [`ChannelState::reserve`] but not sent.
    fn unreserve(&self, n: usize) {
        if let Ok(mut w) = self.remote_window.lock() {
            *w = w.saturating_add(n as u32);
        }
        self.window_changed.notify_waiters();
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.window_changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take up to `wanted` bytes of the remote window, waiting until
    /// some is available.
    async fn reserve(&self, wanted: usize) -> Result<usize, Error> {
        loop {
            let notified = self.window_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return Err(Error::ChannelClosed);
            }
            {
                let mut window = self.remote_window.lock().map_err(|_| Error::Inconsistent)?;
                if *window > 0 {
                    let max_packet = self.max_packet.load(Ordering::SeqCst).max(1);
                    let n = (*window).min(max_packet) as usize;
                    let n = n.min(wanted).min(MAX_CHUNK_LEN);
                    *window -= n as u32;
                    return Ok(n);
                }
            }
            trace!("waiting for the remote window");
            notified.await;
        }
    }
}

/// A slot of the session's channel table.
#[derive(Debug)]
pub(crate) struct ChannelEntry {
    pub kind: &'static str,
    pub state: Arc<ChannelState>,
    pub sender: UnboundedSender<ChannelMsg>,
    pub open_reply: Option<oneshot::Sender<Result<(), Error>>>,
    /// Replies to channel requests, in the order they were sent.
    pub pending: VecDeque<oneshot::Sender<bool>>,
}

/// The channels of a session, by local number.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    next_id: u32,
    entries: HashMap<ChannelId, ChannelEntry>,
}

impl ChannelTable {
    /// Register a channel under a fresh local number. Numbers increase
    /// monotonically, so a late message for a released channel cannot
    /// reach a newer one.
    pub fn allocate(
        &mut self,
        kind: &'static str,
        state: Arc<ChannelState>,
        sender: UnboundedSender<ChannelMsg>,
    ) -> ChannelId {
        let mut id = ChannelId(self.next_id);
        while self.entries.contains_key(&id) {
            id = ChannelId(id.0.wrapping_add(1));
        }
        self.next_id = id.0.wrapping_add(1);
        self.entries.insert(
            id,
            ChannelEntry {
                kind,
                state,
                sender,
                open_reply: None,
                pending: VecDeque::new(),
            },
        );
        id
    }

    pub fn get(&self, id: ChannelId) -> Option<&ChannelEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut ChannelEntry> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<ChannelEntry> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty the table, waking everything that waits on a channel.
    pub fn clear(&mut self) {
        for (id, entry) in self.entries.drain() {
            debug!("releasing channel {id} ({})", entry.kind);
            entry.state.mark_closed();
            if let Some(reply) = entry.open_reply {
                let _ = reply.send(Err(Error::ChannelClosed));
            }
        }
    }
}

/// A channel, from the application's side.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    state: Arc<ChannelState>,
    receiver: UnboundedReceiver<ChannelMsg>,
    handle: Handle,
    window_size: u32,
    /// Received bytes not yet returned to the server's window.
    consumed: u32,
}

impl Channel {
    /// Reserve a slot in the session's table for a channel we will open.
    pub(crate) fn new(handle: Handle, kind: ChannelKind) -> Result<Self, Error> {
        if !handle.is_alive() {
            return Err(Error::NotConnected);
        }
        let window_size = handle.shared.window_size;
        let state = Arc::new(ChannelState::new(window_size));
        let (sender, receiver) = unbounded_channel();
        let id = handle
            .shared
            .channels
            .lock()
            .map_err(|_| Error::Inconsistent)?
            .allocate(kind.type_name(), state.clone(), sender);
        debug!("allocated channel {id} ({})", kind.type_name());
        Ok(Channel {
            id,
            kind,
            state,
            receiver,
            handle,
            window_size,
            consumed: 0,
        })
    }

    /// A channel the server opened, already confirmed on the server's side.
    pub(crate) fn accepted(
        handle: Handle,
        kind: ChannelKind,
        remote_id: u32,
        remote_window: u32,
        max_packet: u32,
    ) -> Result<Self, Error> {
        let channel = Self::new(handle, kind)?;
        channel.state.confirm(remote_id, remote_window, max_packet);
        Ok(channel)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub fn is_open(&self) -> bool {
        self.state.remote_id.get().is_some() && !self.state.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Bytes we may send before the server adjusts the window.
    pub fn remote_window(&self) -> u32 {
        self.state.remote_window.lock().map(|w| *w).unwrap_or(0)
    }

    /// Bytes the server may send before we adjust the window.
    pub fn local_window(&self) -> u32 {
        self.state.local_window.load(Ordering::SeqCst)
    }

    fn remote_id(&self) -> Result<u32, Error> {
        if self.state.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.state.remote_id.get().copied().ok_or(Error::WrongChannel)
    }

    /// Send SSH_MSG_CHANNEL_OPEN and wait for the server's answer, at
    /// most for the session timeout.
    pub async fn open(&mut self) -> Result<(), Error> {
        if self.state.remote_id.get().is_some() {
            return Ok(());
        }
        if self.state.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let (reply, confirmation) = oneshot::channel();
        self.handle
            .shared
            .channels
            .lock()
            .map_err(|_| Error::Inconsistent)?
            .get_mut(self.id)
            .ok_or(Error::ChannelClosed)?
            .open_reply = Some(reply);

        let mut buf = vec![msg::CHANNEL_OPEN];
        self.kind.type_name().encode(&mut buf)?;
        self.id.encode(&mut buf)?;
        self.window_size.encode(&mut buf)?;
        self.handle.shared.maximum_packet_size.encode(&mut buf)?;
        self.kind.encode_open(&mut buf)?;
        self.handle.send(buf).await?;

        match tokio::time::timeout(self.handle.shared.timeout, confirmation).await {
            Ok(Ok(result)) => {
                if result.is_err() {
                    self.state.mark_closed();
                }
                result
            }
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                debug!("channel {} open timed out", self.id);
                self.release();
                Err(Error::ConnectionTimeout)
            }
        }
    }

    /// Send data, respecting the server's window and maximum packet size.
    pub async fn data(&self, data: &[u8]) -> Result<(), Error> {
        self.send_data(None, data).await
    }

    /// Send extended data; `ext` 1 is stderr.
    pub async fn extended_data(&self, ext: u32, data: &[u8]) -> Result<(), Error> {
        self.send_data(Some(ext), data).await
    }

    async fn send_data(&self, ext: Option<u32>, mut data: &[u8]) -> Result<(), Error> {
        let remote_id = self.remote_id()?;
        while !data.is_empty() {
            let n = self.state.reserve(data.len()).await?;
            let (chunk, rest) = data.split_at(n);
            let mut buf = Vec::with_capacity(n + 13);
            match ext {
                None => {
                    buf.push(msg::CHANNEL_DATA);
                    remote_id.encode(&mut buf)?;
                }
                Some(ext) => {
                    buf.push(msg::CHANNEL_EXTENDED_DATA);
                    remote_id.encode(&mut buf)?;
                    ext.encode(&mut buf)?;
                }
            }
            chunk.encode(&mut buf)?;
            if let Err(e) = self.handle.send(buf).await {
                self.state.unreserve(n);
                return Err(e);
            }
            data = rest;
        }
        Ok(())
    }

    /// The next message from the server, or `None` once the channel and
    /// its session are gone.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        let msg = self.receiver.recv().await?;
        match &msg {
            ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                self.consumed(data.len()).await
            }
            _ => {}
        }
        Some(msg)
    }

    async fn consumed(&mut self, n: usize) {
        self.consumed = self.consumed.saturating_add(n as u32);
        if self.consumed < self.window_size / 2 {
            return;
        }
        let Ok(remote_id) = self.remote_id() else {
            return;
        };
        let adjust = std::mem::take(&mut self.consumed);
        let mut buf = vec![msg::CHANNEL_WINDOW_ADJUST];
        if remote_id.encode(&mut buf).is_err() || adjust.encode(&mut buf).is_err() {
            return;
        }
        if self.handle.send(buf).await.is_ok() {
            trace!("channel {}: window adjusted by {adjust}", self.id);
            self.state.local_window.fetch_add(adjust, Ordering::SeqCst);
        }
    }

    async fn request(&self, name: &str, want_reply: bool, extra: &[u8]) -> Result<(), Error> {
        let remote_id = self.remote_id()?;
        let reply = if want_reply {
            let (reply, receiver) = oneshot::channel();
            self.handle
                .shared
                .channels
                .lock()
                .map_err(|_| Error::Inconsistent)?
                .get_mut(self.id)
                .ok_or(Error::ChannelClosed)?
                .pending
                .push_back(reply);
            Some(receiver)
        } else {
            None
        };

        let mut buf = vec![msg::CHANNEL_REQUEST];
        remote_id.encode(&mut buf)?;
        name.encode(&mut buf)?;
        (want_reply as u8).encode(&mut buf)?;
        buf.extend_from_slice(extra);
        self.handle.send(buf).await?;

        let Some(reply) = reply else {
            return Ok(());
        };
        match tokio::time::timeout(self.handle.shared.timeout, reply).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(Error::RequestDenied),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::ConnectionTimeout),
        }
    }

    /// Request a pseudo-terminal with the given characteristics.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_pty(
        &self,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(Pty, u32)],
    ) -> Result<(), Error> {
        let mut modes = Vec::with_capacity(terminal_modes.len() * 5 + 1);
        for (opcode, value) in terminal_modes {
            modes.push(*opcode as u8);
            value.encode(&mut modes)?;
        }
        modes.push(TTY_OP_END);

        let mut extra = Vec::new();
        term.encode(&mut extra)?;
        col_width.encode(&mut extra)?;
        row_height.encode(&mut extra)?;
        pix_width.encode(&mut extra)?;
        pix_height.encode(&mut extra)?;
        modes.encode(&mut extra)?;
        self.request("pty-req", want_reply, &extra).await
    }

    pub async fn request_shell(&self, want_reply: bool) -> Result<(), Error> {
        self.request("shell", want_reply, &[]).await
    }

    pub async fn exec<A: Into<Vec<u8>>>(&self, want_reply: bool, command: A) -> Result<(), Error> {
        let mut extra = Vec::new();
        command.into().encode(&mut extra)?;
        self.request("exec", want_reply, &extra).await
    }

    pub async fn request_subsystem(&self, want_reply: bool, name: &str) -> Result<(), Error> {
        let mut extra = Vec::new();
        name.encode(&mut extra)?;
        self.request("subsystem", want_reply, &extra).await
    }

    pub async fn set_env(&self, want_reply: bool, name: &str, value: &str) -> Result<(), Error> {
        let mut extra = Vec::new();
        name.encode(&mut extra)?;
        value.encode(&mut extra)?;
        self.request("env", want_reply, &extra).await
    }

    /// Tell the server the terminal was resized.
    pub async fn window_change(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        let mut extra = Vec::new();
        col_width.encode(&mut extra)?;
        row_height.encode(&mut extra)?;
        pix_width.encode(&mut extra)?;
        pix_height.encode(&mut extra)?;
        self.request("window-change", false, &extra).await
    }

    /// Deliver a signal to the remote process.
    pub async fn signal(&self, signal: Sig) -> Result<(), Error> {
        let mut extra = Vec::new();
        signal.name().encode(&mut extra)?;
        self.request("signal", false, &extra).await
    }

    /// Tell the server we will not send more data.
    pub async fn eof(&self) -> Result<(), Error> {
        let mut buf = vec![msg::CHANNEL_EOF];
        self.remote_id()?.encode(&mut buf)?;
        self.handle.send(buf).await
    }

    /// Close the channel and release its slot. Closing twice, or after
    /// the session is gone, does nothing.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.window_changed.notify_waiters();
        if let Some(remote_id) = self.state.remote_id.get() {
            let mut buf = vec![msg::CHANNEL_CLOSE];
            remote_id.encode(&mut buf)?;
            if let Err(e) = self.handle.send(buf).await {
                debug!("channel {}: not sending close: {e}", self.id);
            }
        }
        self.release();
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut table) = self.handle.shared.channels.lock() {
            table.remove(self.id);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            if let Some(remote_id) = self.state.remote_id.get() {
                let mut buf = vec![msg::CHANNEL_CLOSE];
                if remote_id.encode(&mut buf).is_ok() && !self.handle.try_send(buf) {
                    warn!("channel {}: dropped without sending close", self.id);
                }
            }
            self.state.window_changed.notify_waiters();
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_not_reused() {
        let mut table = ChannelTable::default();
        let (sender, _receiver) = unbounded_channel();
        let state = Arc::new(ChannelState::new(100));
        let a = table.allocate("session", state.clone(), sender.clone());
        let b = table.allocate("session", state.clone(), sender.clone());
        table.remove(a);
        let c = table.allocate("session", state, sender);
        assert_eq!((a.0, b.0, c.0), (0, 1, 2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn clearing_the_table_fails_pending_opens() {
        let mut table = ChannelTable::default();
        let (sender, _receiver) = unbounded_channel();
        let state = Arc::new(ChannelState::new(100));
        let id = table.allocate("session", state.clone(), sender);
        let (reply, mut confirmation) = oneshot::channel();
        table.get_mut(id).unwrap().open_reply = Some(reply);
        table.clear();
        assert!(table.is_empty());
        assert!(state.is_closed());
        assert!(matches!(
            confirmation.try_recv(),
            Ok(Err(Error::ChannelClosed))
        ));
    }

    #[test]
    fn local_window_never_goes_negative() {
        let state = ChannelState::new(10);
        assert_eq!(state.consume_local_window(4), 4);
        assert_eq!(state.consume_local_window(10), 6);
        assert_eq!(state.local_window.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reserve_waits_for_window() {
        let state = Arc::new(ChannelState::new(0));
        state.confirm(7, 0, 4);
        let s = state.clone();
        let waiting = tokio::spawn(async move { s.reserve(10).await });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        assert_eq!(state.adjust_remote_window(6), 6);
        // Bounded by the maximum packet size.
        assert_eq!(waiting.await.unwrap().unwrap(), 4);
        assert_eq!(*state.remote_window.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn chunks_fit_in_a_packet() {
        let state = ChannelState::new(0);
        state.confirm(7, 4 << 20, 1 << 20);
        let n = state.reserve(600_000).await.unwrap();
        assert_eq!(n, MAX_CHUNK_LEN);
        assert_eq!(*state.remote_window.lock().unwrap(), (4 << 20) - n as u32);
        state.unreserve(n);
        assert_eq!(*state.remote_window.lock().unwrap(), 4 << 20);
    }

    #[tokio::test]
    async fn reserve_fails_once_closed() {
        let state = Arc::new(ChannelState::new(0));
        state.confirm(7, 0, 4);
        let s = state.clone();
        let waiting = tokio::spawn(async move { s.reserve(10).await });
        tokio::task::yield_now().await;
        state.mark_closed();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(Error::ChannelClosed)
        ));
    }
}

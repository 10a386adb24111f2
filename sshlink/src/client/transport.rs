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

use std::collections::VecDeque;
use std::num::Wrapping;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};
use ssh_encoding::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::pin;
use tokio::sync::mpsc::{self, WeakSender};
use tokio::sync::oneshot;

use super::kex::{ClientKex, KexConfig, KexProgress};
use super::{Msg, SessionEvent, Shared};
use crate::cipher::{self, OpeningKey};
use crate::compression::Decompress;
use crate::msg::{self, MessageKind};
use crate::negotiation::Names;
use crate::session::{KexCause, NewKeys};
use crate::sshbuffer::{PacketWriter, SSHBuffer};
use crate::{Disconnect, Error, Limits};

async fn start_reading<R: AsyncRead + Unpin>(
    mut stream_read: R,
    mut buffer: SSHBuffer,
    mut cipher: Box<dyn OpeningKey + Send>,
) -> Result<(usize, R, SSHBuffer, Box<dyn OpeningKey + Send>), Error> {
    buffer.buffer.clear();
    let n = cipher::read(&mut stream_read, &mut buffer, &mut *cipher).await?;
    Ok((n, stream_read, buffer, cipher))
}

/// The event loop of a session. It owns the stream: reads packets and
/// dispatches them, writes what the handles send, and runs the key
/// exchanges.
pub(crate) struct Transport {
    pub(super) config: Arc<KexConfig>,
    pub(super) shared: Arc<Shared>,
    /// Used to build handles for channels the server opens.
    pub(super) sender: WeakSender<Msg>,
    limits: Limits,
    kex_done: Option<oneshot::Sender<()>>,
    writer: PacketWriter,
    kex: Option<ClientKex>,
    names: Option<Names>,
    authenticated: bool,
    decompress: Decompress,
    decompress_buffer: Vec<u8>,
    last_kex: Instant,
    read_bytes: usize,
    /// Packets produced while a key exchange is running.
    deferred: Vec<Vec<u8>>,
    acks: Vec<oneshot::Sender<()>>,
    pub(super) global_replies: VecDeque<oneshot::Sender<Option<Vec<u8>>>>,
    disconnect_sent: Option<(Disconnect, String)>,
}

impl Transport {
    pub fn new(
        config: Arc<KexConfig>,
        shared: Arc<Shared>,
        sender: WeakSender<Msg>,
        limits: Limits,
        kex_done: oneshot::Sender<()>,
    ) -> Self {
        Transport {
            config,
            shared,
            sender,
            limits,
            kex_done: Some(kex_done),
            writer: PacketWriter::clear(),
            kex: None,
            names: None,
            authenticated: false,
            decompress: Decompress::None,
            decompress_buffer: Vec::new(),
            last_kex: Instant::now(),
            read_bytes: 0,
            deferred: Vec::new(),
            acks: Vec::new(),
            global_replies: VecDeque::new(),
            disconnect_sent: None,
        }
    }

    pub async fn run<S>(mut self, stream: S, mut receiver: mpsc::Receiver<Msg>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (reader, mut write) = tokio::io::split(stream);
        let result = self.main_loop(reader, &mut write, &mut receiver).await;
        if let Err(ref e) = result {
            debug!("session ended with: {e}");
            if let Some(reason) = e.disconnect_reason() {
                if self.write_disconnect(reason, &e.to_string()).is_ok() {
                    let _ = self.flush(&mut write).await;
                }
            }
        }
        let _ = write.shutdown().await;
        receiver.close();
        self.teardown(&result);
        result
    }

    async fn main_loop<R, W>(
        &mut self,
        reader: R,
        write: &mut W,
        receiver: &mut mpsc::Receiver<Msg>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut kex = ClientKex::new(self.config.clone(), KexCause::Initial, None);
        kex.kexinit(&mut self.writer)?;
        self.kex = Some(kex);
        self.flush(write).await?;

        let reading = start_reading(
            reader,
            SSHBuffer::new(),
            Box::new(cipher::clear::Key) as Box<dyn OpeningKey + Send>,
        );
        pin!(reading);

        loop {
            let rekey_at =
                tokio::time::Instant::from_std(self.last_kex + self.limits.rekey_time_limit);
            #[allow(clippy::panic)] // false positive in select! macro
            {
                tokio::select! {
                    r = &mut reading => {
                        let (n, reader, mut buffer, mut opening) = r?;
                        self.read_bytes += n;
                        let seqn = (buffer.seqn - Wrapping(1)).0;
                        let packet = buffer.buffer.get(5..n).ok_or(Error::Inconsistent)?;
                        let mut out = std::mem::take(&mut self.decompress_buffer);
                        let payload = self.decompress.decompress(packet, &mut out)?;
                        let newkeys = self.process(payload, seqn);
                        self.decompress_buffer = out;
                        if let Some((key, reset_seqn)) = newkeys? {
                            opening = key;
                            if reset_seqn {
                                buffer.seqn = Wrapping(0);
                            }
                        }
                        reading.set(start_reading(reader, buffer, opening));
                    }
                    msg = receiver.recv(), if self.kex.is_none() => {
                        let Some(msg) = msg else {
                            debug!("all handles dropped, disconnecting");
                            self.write_disconnect(Disconnect::ByApplication, "")?;
                            self.flush(write).await?;
                            return Ok(());
                        };
                        self.handle_msg(msg)?;
                        // Batch whatever else is already queued.
                        while self.kex.is_none() && self.disconnect_sent.is_none() {
                            match receiver.try_recv() {
                                Ok(next) => self.handle_msg(next)?,
                                Err(_) => break,
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(rekey_at), if self.kex.is_none() => {
                        debug!("rekey time limit reached");
                        self.start_rekey()?;
                    }
                }
            }

            if self.kex.is_none()
                && (self.writer.bytes() >= self.limits.rekey_write_limit
                    || self.read_bytes >= self.limits.rekey_read_limit)
            {
                debug!("rekey data limit reached");
                self.start_rekey()?;
            }
            self.flush(write).await?;
            if self.disconnect_sent.is_some() {
                return Ok(());
            }
        }
    }

    async fn flush<W: AsyncWrite + Unpin>(&mut self, write: &mut W) -> Result<(), Error> {
        let out = self.writer.take();
        if !out.is_empty() {
            trace!("writing to stream: {:?} bytes", out.len());
            write.write_all(&out).await?;
            write.flush().await?;
        }
        for ack in self.acks.drain(..) {
            let _ = ack.send(());
        }
        Ok(())
    }

    fn handle_msg(&mut self, msg: Msg) -> Result<(), Error> {
        match msg {
            Msg::Packet { payload, ack } => {
                self.writer.packet(&payload)?;
                if let Some(ack) = ack {
                    self.acks.push(ack);
                }
            }
            Msg::GlobalRequest { payload, reply } => {
                self.writer.packet(&payload)?;
                if let Some(reply) = reply {
                    self.global_replies.push_back(reply);
                }
            }
            Msg::Rekey => {
                if self.kex.is_none() {
                    self.start_rekey()?;
                }
            }
            Msg::Disconnect {
                reason,
                description,
            } => self.write_disconnect(reason, &description)?,
        }
        Ok(())
    }

    /// Queue a packet produced while handling the server's messages.
    pub(super) fn send(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        if self.kex.is_some() {
            self.deferred.push(payload);
            Ok(())
        } else {
            self.writer.packet(&payload)
        }
    }

    fn write_disconnect(&mut self, reason: Disconnect, description: &str) -> Result<(), Error> {
        if self.disconnect_sent.is_some() {
            return Ok(());
        }
        let mut payload = vec![msg::DISCONNECT];
        (reason as u32).encode(&mut payload)?;
        description.encode(&mut payload)?;
        "".encode(&mut payload)?; // language tag
        self.writer.packet(&payload)?;
        self.disconnect_sent = Some((reason, description.to_string()));
        Ok(())
    }

    fn start_rekey(&mut self) -> Result<(), Error> {
        let Some(session_id) = self.shared.session_id.get().cloned() else {
            return Ok(());
        };
        let strict = self.names.as_ref().is_some_and(|n| n.strict_kex);
        debug!("starting key re-exchange");
        let mut kex = ClientKex::new(
            self.config.clone(),
            KexCause::Rekey { strict },
            Some(session_id),
        );
        kex.kexinit(&mut self.writer)?;
        self.kex = Some(kex);
        Ok(())
    }

    /// Handle one decrypted payload. Returns the server's new key once
    /// its NEWKEYS is read, and whether the read sequence number restarts.
    fn process(
        &mut self,
        payload: &[u8],
        seqn: u32,
    ) -> Result<Option<(Box<dyn OpeningKey + Send>, bool)>, Error> {
        let Some(&number) = payload.first() else {
            return Err(Error::Inconsistent);
        };
        let kind = MessageKind::from_u8(number);
        let strict = self.kex.as_ref().is_some_and(|k| k.is_strict_initial());
        trace!("received {} (seqn {seqn})", kind.map(|k| k.name()).unwrap_or("unknown message"));

        match number {
            msg::DISCONNECT => Err(read_disconnect(payload)),
            msg::IGNORE | msg::DEBUG | msg::UNIMPLEMENTED if !strict => {
                match number {
                    msg::DEBUG => log_debug_message(payload),
                    msg::UNIMPLEMENTED => {
                        let mut r = payload.get(1..).unwrap_or_default();
                        let rejected = u32::decode(&mut r).unwrap_or_default();
                        warn!("server did not implement our packet {rejected}");
                    }
                    _ => {}
                }
                Ok(None)
            }
            msg::KEXINIT | msg::NEWKEYS | 30..=49 => {
                if number == msg::KEXINIT && self.kex.is_none() {
                    debug!("server started a key re-exchange");
                    self.start_rekey()?;
                }
                let kex = self.kex.take().ok_or(Error::Kex)?;
                match kex.step(payload, seqn, &mut self.writer, &self.shared.events)? {
                    KexProgress::NeedsReply(kex) => {
                        self.kex = Some(kex);
                        Ok(None)
                    }
                    KexProgress::Done {
                        newkeys,
                        reset_seqn,
                    } => self.finish_kex(newkeys, reset_seqn).map(Some),
                }
            }
            _ => {
                let name = kind.map(|k| k.name()).unwrap_or("unknown message");
                if strict {
                    warn!("strict kex violation: {name} during the initial key exchange");
                    return Err(Error::UnexpectedMessage(name));
                }
                if self.shared.session_id.get().is_none()
                    || self.kex.as_ref().is_some_and(|k| !k.accepts_other_messages())
                {
                    return Err(Error::UnexpectedMessage(name));
                }
                self.dispatch(payload, seqn)?;
                Ok(None)
            }
        }
    }

    fn finish_kex(
        &mut self,
        newkeys: NewKeys,
        reset_seqn: bool,
    ) -> Result<(Box<dyn OpeningKey + Send>, bool), Error> {
        let NewKeys {
            names,
            session_id,
            remote_to_local,
        } = newkeys;
        if self.shared.session_id.set(session_id).is_ok() {
            debug!("initial key exchange done");
        } else {
            debug!("key re-exchange done");
        }
        self.writer.compress = names.client_compression.init_compress(self.authenticated);
        self.decompress = names.server_compression.init_decompress(self.authenticated);
        self.writer.buffer.bytes = 0;
        self.read_bytes = 0;
        self.last_kex = Instant::now();
        self.names = Some(names);

        for payload in std::mem::take(&mut self.deferred) {
            self.writer.packet(&payload)?;
        }
        if let Some(done) = self.kex_done.take() {
            let _ = done.send(());
        }
        Ok((remote_to_local, reset_seqn))
    }

    /// Start delayed compression, once the server has accepted us.
    pub(super) fn on_authenticated(&mut self) {
        self.authenticated = true;
        let Some(names) = &self.names else {
            return;
        };
        if !self.writer.compress.is_active() && names.client_compression.active(true) {
            debug!("starting delayed compression");
            self.writer.compress = names.client_compression.init_compress(true);
        }
        if matches!(self.decompress, Decompress::None) && names.server_compression.active(true) {
            self.decompress = names.server_compression.init_decompress(true);
        }
    }

    fn teardown(&mut self, result: &Result<(), Error>) {
        self.shared.teardown();
        self.acks.clear();
        self.global_replies.clear();
        let events = &self.shared.events;
        let (reason, description) = match result {
            Ok(()) => match self.disconnect_sent.take() {
                Some((reason, description)) => (Some(reason), description),
                None => (None, String::new()),
            },
            Err(Error::DisconnectByPeer {
                reason,
                description,
            }) => (Some(*reason), description.clone()),
            Err(e) => {
                events.notify(&SessionEvent::ErrorOccurred(e.to_string()));
                (e.disconnect_reason(), e.to_string())
            }
        };
        events.notify(&SessionEvent::Disconnected {
            reason,
            description,
        });
    }
}

fn read_disconnect(payload: &[u8]) -> Error {
    let mut r = payload.get(1..).unwrap_or_default();
    let reason = u32::decode(&mut r)
        .ok()
        .and_then(|r| Disconnect::try_from(r).ok())
        .unwrap_or(Disconnect::ByApplication);
    let description = String::decode(&mut r).unwrap_or_default();
    debug!("disconnected by server: {reason:?} {description:?}");
    Error::DisconnectByPeer {
        reason,
        description,
    }
}

fn log_debug_message(payload: &[u8]) {
    let mut r = payload.get(1..).unwrap_or_default();
    let Ok(always_display) = u8::decode(&mut r).map(|b| b != 0) else {
        return;
    };
    let message = String::decode(&mut r).unwrap_or_default();
    if always_display {
        log::info!("server: {message}");
    } else {
        debug!("server: {message}");
    }
}

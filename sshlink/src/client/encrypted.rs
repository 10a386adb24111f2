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

//! Dispatch of the messages that arrive outside of key exchanges.
use std::sync::atomic::Ordering;

use bytes::Bytes;
use log::{debug, trace, warn};
use ssh_encoding::{Decode, Encode};

use super::transport::Transport;
use super::{Handle, SessionEvent};
use crate::channels::{Channel, ChannelKind, ChannelMsg};
use crate::msg::{self, MessageKind};
use crate::{ChannelId, ChannelOpenFailure, Error, Sig};

impl Transport {
    pub(super) fn dispatch(&mut self, payload: &[u8], seqn: u32) -> Result<(), Error> {
        let Some((&number, r)) = payload.split_first() else {
            return Err(Error::Inconsistent);
        };
        let Some(kind) = MessageKind::from_u8(number) else {
            self.shared
                .error(format!("unknown message number {number} from the server"));
            return self.unimplemented(seqn);
        };

        if kind == MessageKind::ServiceAccept {
            return self.to_auth_inbox(kind, payload);
        }
        if kind.is_userauth() {
            let registered = self.shared.is_registered(kind);
            match kind {
                MessageKind::UserAuthBanner => {
                    let mut r = r;
                    let banner = String::decode(&mut r)?;
                    self.shared.events.notify(&SessionEvent::AuthBanner(banner));
                    if !registered {
                        return Ok(());
                    }
                }
                MessageKind::UserAuthSuccess if registered => self.on_authenticated(),
                _ => {}
            }
            if registered {
                return self.to_auth_inbox(kind, payload);
            }
            self.shared.error(format!("unexpected {kind}"));
            return Ok(());
        }
        if kind.is_connection() {
            if !self.shared.is_registered(kind) {
                self.shared
                    .error(format!("unexpected {kind} before authentication"));
                return Ok(());
            }
            return self.connection_message(kind, r);
        }
        self.shared.error(format!("unexpected {kind}"));
        self.unimplemented(seqn)
    }

    fn unimplemented(&mut self, seqn: u32) -> Result<(), Error> {
        let mut buf = vec![msg::UNIMPLEMENTED];
        seqn.encode(&mut buf)?;
        self.send(buf)
    }

    fn to_auth_inbox(&mut self, kind: MessageKind, payload: &[u8]) -> Result<(), Error> {
        let inbox = self.shared.auth_inbox.lock().map_err(|_| Error::Inconsistent)?;
        match inbox.as_ref() {
            Some(inbox) if inbox.send(payload.to_vec()).is_ok() => {}
            _ => {
                drop(inbox);
                self.shared.error(format!("{kind} arrived while not authenticating"));
            }
        }
        Ok(())
    }

    fn connection_message(&mut self, kind: MessageKind, mut r: &[u8]) -> Result<(), Error> {
        match kind {
            MessageKind::ChannelOpenConfirmation => {
                let local = ChannelId::decode(&mut r)?;
                let remote = u32::decode(&mut r)?;
                let window = u32::decode(&mut r)?;
                let max_packet = u32::decode(&mut r)?;
                let reply = {
                    let mut channels =
                        self.shared.channels.lock().map_err(|_| Error::Inconsistent)?;
                    channels.get_mut(local).and_then(|entry| {
                        entry.state.confirm(remote, window, max_packet);
                        entry.open_reply.take()
                    })
                };
                match reply {
                    Some(reply) => {
                        debug!("channel {local} confirmed as {remote}");
                        let _ = reply.send(Ok(()));
                    }
                    None => {
                        // The open was given up on: do not leak the server's side.
                        debug!("late confirmation for channel {local}, closing");
                        let mut buf = vec![msg::CHANNEL_CLOSE];
                        remote.encode(&mut buf)?;
                        self.send(buf)?;
                    }
                }
            }
            MessageKind::ChannelOpenFailure => {
                let local = ChannelId::decode(&mut r)?;
                let reason = ChannelOpenFailure::from_u32(u32::decode(&mut r)?)
                    .unwrap_or(ChannelOpenFailure::Unknown);
                let description = String::decode(&mut r).unwrap_or_default();
                debug!("channel {local} open failed: {reason:?} {description:?}");
                let entry = self
                    .shared
                    .channels
                    .lock()
                    .map_err(|_| Error::Inconsistent)?
                    .remove(local);
                if let Some(entry) = entry {
                    entry.state.mark_closed();
                    if let Some(reply) = entry.open_reply {
                        let _ = reply.send(Err(Error::ChannelOpenFailure(reason)));
                    }
                }
            }
            MessageKind::ChannelWindowAdjust => {
                let local = ChannelId::decode(&mut r)?;
                let n = u32::decode(&mut r)?;
                self.with_channel(local, |entry| {
                    let new_size = entry.state.adjust_remote_window(n);
                    trace!("channel {local}: window adjusted to {new_size}");
                    let _ = entry.sender.send(ChannelMsg::WindowAdjusted { new_size });
                })?;
            }
            MessageKind::ChannelData | MessageKind::ChannelExtendedData => {
                let local = ChannelId::decode(&mut r)?;
                let ext = if kind == MessageKind::ChannelExtendedData {
                    Some(u32::decode(&mut r)?)
                } else {
                    None
                };
                let data = Vec::<u8>::decode(&mut r)?;
                self.with_channel(local, |entry| {
                    let accepted = entry.state.consume_local_window(data.len());
                    if accepted < data.len() {
                        warn!(
                            "channel {local}: server exceeded the window by {} bytes",
                            data.len() - accepted
                        );
                    }
                    let data = Bytes::copy_from_slice(data.get(..accepted).unwrap_or_default());
                    let msg = match ext {
                        Some(ext) => ChannelMsg::ExtendedData { data, ext },
                        None => ChannelMsg::Data { data },
                    };
                    let _ = entry.sender.send(msg);
                })?;
            }
            MessageKind::ChannelEof => {
                let local = ChannelId::decode(&mut r)?;
                self.with_channel(local, |entry| {
                    let _ = entry.sender.send(ChannelMsg::Eof);
                })?;
            }
            MessageKind::ChannelClose => {
                let local = ChannelId::decode(&mut r)?;
                let entry = self
                    .shared
                    .channels
                    .lock()
                    .map_err(|_| Error::Inconsistent)?
                    .remove(local);
                let Some(entry) = entry else {
                    debug!("close for unknown channel {local}");
                    return Ok(());
                };
                debug!("channel {local} closed by the server");
                let already_closed = entry.state.closed.swap(true, Ordering::SeqCst);
                entry.state.window_changed.notify_waiters();
                if !already_closed {
                    if let Some(remote) = entry.state.remote_id.get() {
                        let mut buf = vec![msg::CHANNEL_CLOSE];
                        remote.encode(&mut buf)?;
                        self.send(buf)?;
                    }
                }
                let _ = entry.sender.send(ChannelMsg::Close);
            }
            MessageKind::ChannelRequest => self.channel_request(r)?,
            MessageKind::ChannelSuccess | MessageKind::ChannelFailure => {
                let local = ChannelId::decode(&mut r)?;
                let success = kind == MessageKind::ChannelSuccess;
                self.with_channel(local, |entry| match entry.pending.pop_front() {
                    Some(reply) => {
                        let _ = reply.send(success);
                    }
                    None => warn!("channel {local}: reply to no request"),
                })?;
            }
            MessageKind::GlobalRequest => {
                let name = String::decode(&mut r)?;
                let want_reply = u8::decode(&mut r)? != 0;
                debug!("global request {name:?} from the server");
                if want_reply {
                    self.send(vec![msg::REQUEST_FAILURE])?;
                }
            }
            MessageKind::RequestSuccess | MessageKind::RequestFailure => {
                let Some(reply) = self.global_replies.pop_front() else {
                    self.shared.error(format!("{kind} without a pending request"));
                    return Ok(());
                };
                let data = (kind == MessageKind::RequestSuccess).then(|| r.to_vec());
                let _ = reply.send(data);
            }
            MessageKind::ChannelOpen => self.channel_open(r)?,
            _ => {
                self.shared.error(format!("unexpected {kind}"));
            }
        }
        Ok(())
    }

    /// Run `f` on a channel's entry; messages for unknown channels are
    /// reported and dropped.
    fn with_channel<F>(&mut self, id: ChannelId, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut crate::channels::ChannelEntry),
    {
        let mut channels = self.shared.channels.lock().map_err(|_| Error::Inconsistent)?;
        match channels.get_mut(id) {
            Some(entry) => f(entry),
            None => {
                drop(channels);
                debug!("message for unknown channel {id}");
            }
        }
        Ok(())
    }

    fn channel_request(&mut self, mut r: &[u8]) -> Result<(), Error> {
        let local = ChannelId::decode(&mut r)?;
        let request = String::decode(&mut r)?;
        let want_reply = u8::decode(&mut r)? != 0;
        let msg = match request.as_str() {
            "exit-status" => Some(ChannelMsg::ExitStatus {
                exit_status: u32::decode(&mut r)?,
            }),
            "exit-signal" => {
                let signal_name = Sig::from_name(&String::decode(&mut r)?);
                let core_dumped = u8::decode(&mut r)? != 0;
                let error_message = String::decode(&mut r)?;
                let lang_tag = String::decode(&mut r).unwrap_or_default();
                Some(ChannelMsg::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                })
            }
            _ => {
                debug!("channel {local}: unhandled request {request:?}");
                None
            }
        };
        let mut remote = None;
        self.with_channel(local, |entry| {
            remote = entry.state.remote_id.get().copied();
            if let Some(msg) = msg {
                let _ = entry.sender.send(msg);
            }
        })?;
        if want_reply {
            if let Some(remote) = remote {
                let mut buf = vec![msg::CHANNEL_FAILURE];
                remote.encode(&mut buf)?;
                self.send(buf)?;
            }
        }
        Ok(())
    }

    fn channel_open(&mut self, mut r: &[u8]) -> Result<(), Error> {
        let channel_type = String::decode(&mut r)?;
        let remote = u32::decode(&mut r)?;
        let window = u32::decode(&mut r)?;
        let max_packet = u32::decode(&mut r)?;

        if channel_type != "forwarded-tcpip" {
            debug!("refusing a {channel_type:?} channel");
            return self.open_failure(
                remote,
                ChannelOpenFailure::UnknownChannelType,
                "unknown channel type",
            );
        }
        let connected_address = String::decode(&mut r)?;
        let connected_port = u32::decode(&mut r)?;
        let originator_address = String::decode(&mut r)?;
        let originator_port = u32::decode(&mut r)?;
        debug!(
            "forwarded connection to {connected_address}:{connected_port} \
             from {originator_address}:{originator_port}"
        );

        let target = {
            let forwards = self.shared.forwards.lock().map_err(|_| Error::Inconsistent)?;
            forwards
                .get(&(connected_address.clone(), connected_port))
                .or_else(|| {
                    forwards
                        .iter()
                        .find(|((_, port), _)| *port == connected_port)
                        .map(|(_, s)| s)
                })
                .filter(|s| !s.is_closed())
                .cloned()
        };
        let handle = self.sender.upgrade().map(|sender| Handle {
            sender,
            shared: self.shared.clone(),
        });
        let (Some(target), Some(handle)) = (target, handle) else {
            debug!("no forwarding for {connected_address}:{connected_port}");
            return self.open_failure(
                remote,
                ChannelOpenFailure::AdministrativelyProhibited,
                "port not forwarded",
            );
        };

        let kind = ChannelKind::ForwardedTcpip {
            connected_address,
            connected_port,
            originator_address,
            originator_port,
        };
        let channel = match Channel::accepted(handle, kind, remote, window, max_packet) {
            Ok(channel) => channel,
            Err(e) => {
                debug!("not accepting forwarded connection: {e}");
                return self.open_failure(
                    remote,
                    ChannelOpenFailure::ConnectFailed,
                    "session closing",
                );
            }
        };
        let mut buf = vec![msg::CHANNEL_OPEN_CONFIRMATION];
        remote.encode(&mut buf)?;
        channel.id().encode(&mut buf)?;
        self.shared.window_size.encode(&mut buf)?;
        self.shared.maximum_packet_size.encode(&mut buf)?;
        self.send(buf)?;
        if target.send(channel).is_err() {
            debug!("forwarded port stopped before the connection was delivered");
        }
        Ok(())
    }

    fn open_failure(
        &mut self,
        remote: u32,
        reason: ChannelOpenFailure,
        description: &str,
    ) -> Result<(), Error> {
        let mut buf = vec![msg::CHANNEL_OPEN_FAILURE];
        remote.encode(&mut buf)?;
        (reason as u32).encode(&mut buf)?;
        description.encode(&mut buf)?;
        "".encode(&mut buf)?;
        self.send(buf)
    }
}

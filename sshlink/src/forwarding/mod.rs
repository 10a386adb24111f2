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

//! Port forwarding over a connected [`Session`](crate::client::Session).
//!
//! Three kinds of forwarded ports share one lifecycle:
//! [`LocalPort`] listens locally and opens a `direct-tcpip` channel per
//! connection, [`DynamicPort`] does the same for the destination asked
//! by a SOCKS client, and [`RemotePort`] has the server listen and
//! bridges each `forwarded-tcpip` channel to a local target.
//!
//! A port is created, started and stopped any number of times, and
//! finally disposed of. Stopping closes the listener and every tunnel of
//! the port, then raises [`PortEvent::Closing`].
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use ssh_encoding::Encode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

use crate::channels::{Channel, ChannelMsg};
use crate::client::{Handle, Session, Shared};
use crate::observer::Observers;
use crate::Error;

mod dynamic;
mod local;
mod remote;

pub use dynamic::DynamicPort;
pub use local::LocalPort;
pub use remote::RemotePort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Created,
    Started,
    Stopped,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// The port is stopping. Raised once per stop.
    Closing,
    /// A tunnel failed. The port keeps running.
    Exception(String),
    /// A connection to forward, from `host:port`.
    RequestReceived { host: String, port: u32 },
}

/// A `tcpip-forward` to cancel when the port stops.
struct RemoteBinding {
    handle: Handle,
    address: String,
    port: u32,
}

impl RemoteBinding {
    async fn cancel(self) {
        if let Ok(mut forwards) = self.handle.shared.forwards.lock() {
            forwards.remove(&(self.address.clone(), self.port));
        }
        let mut data = Vec::new();
        if self.address.encode(&mut data).is_err() || self.port.encode(&mut data).is_err() {
            return;
        }
        if let Err(e) = self
            .handle
            .global_request("cancel-tcpip-forward", true, &data)
            .await
        {
            debug!("cancel-tcpip-forward {}:{}: {e}", self.address, self.port);
        }
    }
}

/// The lifecycle and tasks of a forwarded port.
pub(crate) struct PortCore {
    state: Mutex<PortState>,
    tasks: Mutex<Option<JoinSet<()>>>,
    binding: Mutex<Option<RemoteBinding>>,
    events: Observers<PortEvent>,
}

impl Debug for PortCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortCore")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PortCore {
    fn new() -> Arc<Self> {
        Arc::new(PortCore {
            state: Mutex::new(PortState::Created),
            tasks: Mutex::new(None),
            binding: Mutex::new(None),
            events: Observers::new(),
        })
    }

    fn state(&self) -> PortState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(PortState::Disposed)
    }

    /// Enter the started state, if the session is connected.
    fn begin(self: &Arc<Self>, session: &Session) -> Result<Handle, Error> {
        let mut state = self.state.lock().map_err(|_| Error::Inconsistent)?;
        match *state {
            PortState::Started => return Err(Error::AlreadyStarted),
            PortState::Disposed => return Err(Error::PortDisposed),
            PortState::Created | PortState::Stopped => {}
        }
        let handle = session.handle()?;
        {
            let mut ports = handle.shared.ports.lock().map_err(|_| Error::Inconsistent)?;
            // A restarted port is registered once, dropped ports not at all.
            ports.retain(|p| {
                p.strong_count() > 0 && !std::ptr::eq(p.as_ptr(), Arc::as_ptr(self))
            });
            ports.push(Arc::downgrade(self));
        }
        *self.tasks.lock().map_err(|_| Error::Inconsistent)? = Some(JoinSet::new());
        *state = PortState::Started;
        Ok(handle)
    }

    /// Undo [`PortCore::begin`] after a failed start.
    fn abandon(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = PortState::Stopped;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.take();
        }
    }

    fn bind_remote(&self, binding: RemoteBinding) {
        if let Ok(mut b) = self.binding.lock() {
            *b = Some(binding);
        }
    }

    /// Run `task` until the port stops. Does nothing once stopped.
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(tasks) = tasks.as_mut() {
                while tasks.try_join_next().is_some() {}
                tasks.spawn(task);
            }
        }
    }

    fn exception<E: Display>(&self, e: E) {
        warn!("forwarded port: {e}");
        self.events.notify(&PortEvent::Exception(e.to_string()));
    }

    async fn stop(&self) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if *state != PortState::Started {
                return;
            }
            *state = PortState::Stopped;
        }
        let tasks = self.tasks.lock().ok().and_then(|mut t| t.take());
        if let Some(mut tasks) = tasks {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        let binding = self.binding.lock().ok().and_then(|mut b| b.take());
        if let Some(binding) = binding {
            binding.cancel().await;
        }
        debug!("forwarded port stopped");
        self.events.notify(&PortEvent::Closing);
    }

    async fn dispose(&self) {
        self.stop().await;
        if let Ok(mut state) = self.state.lock() {
            *state = PortState::Disposed;
        }
    }
}

/// Stop every port started on a session, before it disconnects.
pub(crate) async fn stop_all(shared: &Shared) {
    let ports: Vec<Arc<PortCore>> = match shared.ports.lock() {
        Ok(mut ports) => ports.drain(..).filter_map(|p| p.upgrade()).collect(),
        Err(_) => return,
    };
    for port in ports {
        port.stop().await;
    }
}

/// Copy bytes both ways between `socket` and `channel` until either side
/// closes. The end of the socket's input closes the channel.
async fn tunnel<S>(socket: S, mut channel: Channel) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read, mut write) = tokio::io::split(socket);
    let mut buf = vec![0; 32 * 1024];
    loop {
        tokio::select! {
            n = read.read(&mut buf) => {
                match n? {
                    0 => {
                        debug!("channel {}: local side closed", channel.id());
                        channel.eof().await?;
                        break;
                    }
                    n => channel.data(buf.get(..n).unwrap_or_default()).await?,
                }
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => write.write_all(&data).await?,
                Some(ChannelMsg::Eof) => write.shutdown().await?,
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    }
    channel.close().await
}


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

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::debug;
use tokio::net::{TcpListener, TcpStream};

use super::{tunnel, PortCore, PortEvent, PortState};
use crate::channels::{Channel, ChannelKind};
use crate::client::{Handle, Session};
use crate::observer::Observers;
use crate::Error;

/// Forward connections made to a local address to `host:port`, as seen
/// from the server.
///
/// ```no_run
/// # async fn run(session: &sshlink::client::Session) -> Result<(), sshlink::Error> {
/// use sshlink::forwarding::LocalPort;
///
/// let port = LocalPort::new("127.0.0.1", 8080, "intranet.local", 80);
/// port.start(session).await?;
/// // ...
/// port.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LocalPort {
    core: Arc<PortCore>,
    bound_host: String,
    bound_port: u16,
    host: String,
    port: u32,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl LocalPort {
    pub fn new<B: Into<String>, H: Into<String>>(
        bound_host: B,
        bound_port: u16,
        host: H,
        port: u32,
    ) -> Self {
        LocalPort {
            core: PortCore::new(),
            bound_host: bound_host.into(),
            bound_port,
            host: host.into(),
            port,
            local_addr: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &Observers<PortEvent> {
        &self.core.events
    }

    pub fn state(&self) -> PortState {
        self.core.state()
    }

    /// The address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    pub async fn start(&self, session: &Session) -> Result<(), Error> {
        let handle = self.core.begin(session)?;
        let bound = TcpListener::bind((self.bound_host.as_str(), self.bound_port))
            .await
            .and_then(|l| Ok((l.local_addr()?, l)));
        let (addr, listener) = match bound {
            Ok(x) => x,
            Err(e) => {
                self.core.abandon();
                return Err(e.into());
            }
        };
        debug!("forwarding {addr} to {}:{}", self.host, self.port);
        if let Ok(mut a) = self.local_addr.lock() {
            *a = Some(addr);
        }
        let target = (self.host.clone(), self.port);
        self.core.spawn(accept(
            listener,
            Arc::downgrade(&self.core),
            move |handle: Handle, socket: TcpStream, peer: SocketAddr| {
                let (host, port) = target.clone();
                async move {
                    let mut channel = Channel::new(
                        handle,
                        ChannelKind::DirectTcpip {
                            host_to_connect: host,
                            port_to_connect: port,
                            originator_address: peer.ip().to_string(),
                            originator_port: peer.port() as u32,
                        },
                    )?;
                    channel.open().await?;
                    tunnel(socket, channel).await
                }
            },
            handle,
        ));
        Ok(())
    }

    /// Close the listener and every tunnel. Stopping a port that is not
    /// started does nothing.
    pub async fn stop(&self) {
        self.core.stop().await
    }

    pub async fn dispose(&self) {
        self.core.dispose().await
    }
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until the port stops, running `forward` on each.
pub(super) async fn accept<F, Fut>(
    listener: TcpListener,
    core: Weak<PortCore>,
    forward: F,
    handle: Handle,
) where
    F: Fn(Handle, TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
{
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                match core.upgrade() {
                    Some(core) => core.exception(e),
                    None => return,
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let Some(core) = core.upgrade() else {
            return;
        };
        if !handle.is_alive() {
            core.exception(Error::NotConnected);
            return;
        }
        core.events.notify(&PortEvent::RequestReceived {
            host: peer.ip().to_string(),
            port: peer.port() as u32,
        });
        let task = forward(handle.clone(), socket, peer);
        let weak = Arc::downgrade(&core);
        core.spawn(async move {
            if let Err(e) = task.await {
                if let Some(core) = weak.upgrade() {
                    core.exception(e);
                }
            }
        });
    }
}

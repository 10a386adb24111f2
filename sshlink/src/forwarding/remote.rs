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

use std::sync::{Arc, Mutex};

use log::debug;
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;

use super::{tunnel, PortCore, PortEvent, PortState, RemoteBinding};
use crate::channels::{Channel, ChannelKind};
use crate::client::Session;
use crate::observer::Observers;
use crate::Error;

/// Have the server listen on `bound_host:bound_port`, and forward the
/// connections it accepts to `host:port` on this side.
#[derive(Debug)]
pub struct RemotePort {
    core: Arc<PortCore>,
    bound_host: String,
    bound_port: u32,
    host: String,
    port: u16,
    assigned_port: Mutex<Option<u32>>,
}

impl RemotePort {
    /// A `bound_port` of 0 lets the server pick the port, see
    /// [`RemotePort::bound_port`].
    pub fn new<B: Into<String>, H: Into<String>>(
        bound_host: B,
        bound_port: u32,
        host: H,
        port: u16,
    ) -> Self {
        RemotePort {
            core: PortCore::new(),
            bound_host: bound_host.into(),
            bound_port,
            host: host.into(),
            port,
            assigned_port: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &Observers<PortEvent> {
        &self.core.events
    }

    pub fn state(&self) -> PortState {
        self.core.state()
    }

    /// The port the server listens on, once started.
    pub fn bound_port(&self) -> Option<u32> {
        self.assigned_port.lock().ok().and_then(|p| *p)
    }

    pub async fn start(&self, session: &Session) -> Result<(), Error> {
        let handle = self.core.begin(session)?;
        let (sender, mut receiver) = unbounded_channel::<Channel>();
        let register = |port: u32| -> Result<(), Error> {
            handle
                .shared
                .forwards
                .lock()
                .map_err(|_| Error::Inconsistent)?
                .insert((self.bound_host.clone(), port), sender.clone());
            Ok(())
        };
        // Connections may arrive before the reply to a fixed port.
        if self.bound_port != 0 {
            register(self.bound_port)?;
        }
        let port = match session.tcpip_forward(&self.bound_host, self.bound_port).await {
            Ok(port) => port,
            Err(e) => {
                if let Ok(mut forwards) = handle.shared.forwards.lock() {
                    forwards.remove(&(self.bound_host.clone(), self.bound_port));
                }
                self.core.abandon();
                return Err(e);
            }
        };
        if self.bound_port == 0 {
            register(port)?;
        }
        debug!("server forwards {}:{port} to {}:{}", self.bound_host, self.host, self.port);
        if let Ok(mut p) = self.assigned_port.lock() {
            *p = Some(port);
        }
        self.core.bind_remote(RemoteBinding {
            handle: handle.clone(),
            address: self.bound_host.clone(),
            port,
        });

        let core = Arc::downgrade(&self.core);
        let target = (self.host.clone(), self.port);
        let timeout = handle.shared.timeout;
        self.core.spawn(async move {
            while let Some(channel) = receiver.recv().await {
                let Some(core) = core.upgrade() else {
                    return;
                };
                if let ChannelKind::ForwardedTcpip {
                    originator_address,
                    originator_port,
                    ..
                } = channel.kind()
                {
                    core.events.notify(&PortEvent::RequestReceived {
                        host: originator_address.clone(),
                        port: *originator_port,
                    });
                }
                let (host, port) = target.clone();
                let weak = Arc::downgrade(&core);
                core.spawn(async move {
                    let result = async move {
                        let connect = TcpStream::connect((host.as_str(), port));
                        let socket = tokio::time::timeout(timeout, connect)
                            .await
                            .map_err(|_| Error::ConnectionTimeout)??;
                        tunnel(socket, channel).await
                    }
                    .await;
                    if let Err(e) = result {
                        if let Some(core) = weak.upgrade() {
                            core.exception(e);
                        }
                    }
                });
            }
        });
        Ok(())
    }

    /// Cancel the forwarding on the server and close every tunnel.
    pub async fn stop(&self) {
        self.core.stop().await
    }

    pub async fn dispose(&self) {
        self.core.dispose().await
    }
}

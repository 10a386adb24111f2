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

use log::debug;
use ssh_encoding::{Decode, Encode};

use super::Session;
use crate::channels::{Channel, ChannelKind};
use crate::Error;

/// Channels and global requests.
impl Session {
    /// A session channel, not yet opened: see [`Channel::open`].
    pub fn create_channel_session(&self) -> Result<Channel, Error> {
        Channel::new(self.handle()?, ChannelKind::Session)
    }

    /// Create and open a session channel.
    pub async fn channel_open_session(&self) -> Result<Channel, Error> {
        let mut channel = self.create_channel_session()?;
        channel.open().await?;
        Ok(channel)
    }

    /// A channel to `host:port`, connected to by the server. The
    /// originator is the address of the local peer, if any.
    pub fn create_channel_direct_tcpip<H: Into<String>, O: Into<String>>(
        &self,
        host_to_connect: H,
        port_to_connect: u32,
        originator_address: O,
        originator_port: u32,
    ) -> Result<Channel, Error> {
        Channel::new(
            self.handle()?,
            ChannelKind::DirectTcpip {
                host_to_connect: host_to_connect.into(),
                port_to_connect,
                originator_address: originator_address.into(),
                originator_port,
            },
        )
    }

    pub async fn channel_open_direct_tcpip<H: Into<String>, O: Into<String>>(
        &self,
        host_to_connect: H,
        port_to_connect: u32,
        originator_address: O,
        originator_port: u32,
    ) -> Result<Channel, Error> {
        let mut channel = self.create_channel_direct_tcpip(
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        )?;
        channel.open().await?;
        Ok(channel)
    }

    /// Send a global request. With `want_reply`, waits for the answer
    /// and returns the data of SSH_MSG_REQUEST_SUCCESS, or
    /// [`Error::RequestDenied`].
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.handle()?.global_request(name, want_reply, data).await
    }

    /// Ask the server to listen on `address:port`. Returns the bound
    /// port, which the server picks when `port` is 0.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, Error> {
        let mut data = Vec::new();
        address.encode(&mut data)?;
        port.encode(&mut data)?;
        let reply = self.global_request("tcpip-forward", true, &data).await?;
        if port != 0 {
            return Ok(port);
        }
        let bound = u32::decode(&mut reply.as_slice())?;
        debug!("server bound {address}:{bound}");
        Ok(bound)
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), Error> {
        let mut data = Vec::new();
        address.encode(&mut data)?;
        port.encode(&mut data)?;
        self.global_request("cancel-tcpip-forward", true, &data)
            .await
            .map(|_| ())
    }
}

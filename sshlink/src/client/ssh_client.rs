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

use std::future::Future;
use std::time::Duration;

use log::debug;

use super::{keepalive, ConnectionInfo, Session};
use crate::channels::ChannelMsg;
use crate::Error;

/// Something that can be connected and disconnected.
pub trait Connect {
    fn connect(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
    fn disconnect(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
    fn is_connected(&self) -> bool;
}

/// Something that sends keep-alives.
pub trait KeepAliveConfig {
    fn keepalive_interval(&self) -> Option<Duration>;
    /// `None` or a zero duration disables keep-alives.
    fn set_keepalive_interval(&mut self, interval: Option<Duration>);
    /// Send one keep-alive now. Returns `false` when not connected.
    fn send_keepalive(&self) -> impl Future<Output = bool> + Send;
}

/// The result of [`SshClient::run_command`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` if the server reported no exit status, e.g. after a signal.
    pub exit_status: Option<u32>,
}

/// A client over one [`Session`].
#[derive(Debug)]
pub struct SshClient {
    session: Session,
}

impl SshClient {
    pub fn new(info: ConnectionInfo) -> Self {
        SshClient {
            session: Session::new(info),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Run `command` on a new session channel and collect its output.
    pub async fn run_command(&self, command: &str) -> Result<CommandOutput, Error> {
        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;
        let mut output = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    debug!("{command:?} killed by {signal_name:?}")
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        channel.close().await?;
        Ok(output)
    }
}

impl Connect for SshClient {
    async fn connect(&mut self) -> Result<(), Error> {
        self.session.connect().await
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        self.session.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }
}

impl KeepAliveConfig for SshClient {
    fn keepalive_interval(&self) -> Option<Duration> {
        self.session.keepalive_interval()
    }

    fn set_keepalive_interval(&mut self, interval: Option<Duration>) {
        self.session.set_keepalive_interval(interval)
    }

    async fn send_keepalive(&self) -> bool {
        self.session
            .try_send_message(keepalive::ignore_message())
            .await
    }
}

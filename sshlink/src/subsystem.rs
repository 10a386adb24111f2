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

//! Subsystems (`sftp`, `netconf`...) over a session channel.
//!
//! A [`SubsystemSession`] opens the channel and requests the subsystem,
//! then hands everything the server sends to a [`SubsystemHandler`].
//! Errors and panics of the handler are reported as
//! [`SubsystemEvent::Error`] and do not stop the subsystem.
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};

use log::{debug, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::channels::{Channel, ChannelMsg};
use crate::client::Session;
use crate::observer::Observers;
use crate::Error;

/// The protocol spoken over a subsystem.
pub trait SubsystemHandler: Send + 'static {
    /// Called once the server accepted the subsystem.
    fn on_channel_open(&mut self, _sender: &SubsystemSender) -> Result<(), Error> {
        Ok(())
    }

    fn on_data_received(&mut self, data: &[u8], sender: &SubsystemSender) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsystemEvent {
    /// The handler failed on a callback.
    Error(String),
    /// The server will send nothing more.
    Eof,
    Closed,
}

#[derive(Debug)]
enum Command {
    Data(Vec<u8>),
    Eof,
    Close,
}

/// Sends on the channel of a subsystem. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SubsystemSender {
    queue: UnboundedSender<Command>,
}

impl SubsystemSender {
    pub fn send_data<D: Into<Vec<u8>>>(&self, data: D) -> Result<(), Error> {
        self.queue
            .send(Command::Data(data.into()))
            .map_err(|_| Error::ChannelClosed)
    }

    pub fn eof(&self) -> Result<(), Error> {
        self.queue.send(Command::Eof).map_err(|_| Error::ChannelClosed)
    }
}

pub struct SubsystemSession<H> {
    name: String,
    handler: Option<H>,
    sender: Option<SubsystemSender>,
    task: Option<JoinHandle<H>>,
    events: Observers<SubsystemEvent>,
}

impl<H> Debug for SubsystemSession<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemSession")
            .field("name", &self.name)
            .field("open", &self.task.is_some())
            .finish()
    }
}

impl<H: SubsystemHandler> SubsystemSession<H> {
    pub fn new<N: Into<String>>(name: N, handler: H) -> Self {
        SubsystemSession {
            name: name.into(),
            handler: Some(handler),
            sender: None,
            task: None,
            events: Observers::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &Observers<SubsystemEvent> {
        &self.events
    }

    pub fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Open a session channel and start the subsystem on it.
    pub async fn connect(&mut self, session: &Session) -> Result<(), Error> {
        match self.task.take() {
            Some(task) if !task.is_finished() => {
                self.task = Some(task);
                return Err(Error::AlreadyStarted);
            }
            // The server closed the channel: the handler is ours again.
            Some(task) => {
                self.sender = None;
                self.recover(task).await;
            }
            None => {}
        }
        let mut handler = self.handler.take().ok_or(Error::AlreadyStarted)?;
        let channel = match self.open(session).await {
            Ok(channel) => channel,
            Err(e) => {
                self.handler = Some(handler);
                return Err(e);
            }
        };
        debug!("subsystem {} started on channel {}", self.name, channel.id());

        let (queue, commands) = unbounded_channel();
        let sender = SubsystemSender { queue };
        guarded(&self.events, || handler.on_channel_open(&sender));
        self.task = Some(tokio::spawn(pump(
            channel,
            handler,
            sender.clone(),
            commands,
            self.events.clone(),
        )));
        self.sender = Some(sender);
        Ok(())
    }

    async fn open(&self, session: &Session) -> Result<Channel, Error> {
        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, &self.name).await?;
        Ok(channel)
    }

    /// A sender for the running subsystem.
    pub fn sender(&self) -> Result<SubsystemSender, Error> {
        self.sender.clone().ok_or(Error::NotStarted)
    }

    pub fn send_data<D: Into<Vec<u8>>>(&self, data: D) -> Result<(), Error> {
        self.sender()?.send_data(data)
    }

    /// Close the channel. The handler is kept, so the subsystem can be
    /// connected again. Does nothing when not connected.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        if let Some(sender) = self.sender.take() {
            let _ = sender.queue.send(Command::Close);
        }
        self.recover(task).await;
        Ok(())
    }

    async fn recover(&mut self, task: JoinHandle<H>) {
        match task.await {
            Ok(handler) => self.handler = Some(handler),
            Err(e) => warn!("subsystem {} task failed: {e}", self.name),
        }
    }
}

/// Run a handler callback, reporting its errors and panics.
fn guarded<F>(events: &Observers<SubsystemEvent>, f: F)
where
    F: FnOnce() -> Result<(), Error>,
{
    let message = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".into()),
    };
    warn!("subsystem handler: {message}");
    events.notify(&SubsystemEvent::Error(message));
}

async fn pump<H: SubsystemHandler>(
    mut channel: Channel,
    mut handler: H,
    sender: SubsystemSender,
    mut commands: UnboundedReceiver<Command>,
    events: Observers<SubsystemEvent>,
) -> H {
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    guarded(&events, || handler.on_data_received(&data, &sender))
                }
                Some(ChannelMsg::Eof) => events.notify(&SubsystemEvent::Eof),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            command = commands.recv() => {
                let result = match command {
                    Some(Command::Data(data)) => channel.data(&data).await,
                    Some(Command::Eof) => channel.eof().await,
                    Some(Command::Close) | None => break,
                };
                if let Err(e) = result {
                    events.notify(&SubsystemEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    }
    if let Err(e) = channel.close().await {
        debug!("closing subsystem channel: {e}");
    }
    events.notify(&SubsystemEvent::Closed);
    handler
}

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

//! Keep-alive messages.
//!
//! A single task per session sends an SSH_MSG_IGNORE every interval.
//! Each send is awaited before the next interval starts, so two
//! keep-alives are never in flight at once, however slow the stream.
use std::time::Duration;

use log::{debug, trace};
use ssh_encoding::Encode;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Handle;
use crate::msg;

/// Something keep-alives can be sent through.
pub trait KeepAliveSender: Send + Sync + 'static {
    /// Send one keep-alive. Returns `false` if it could not be sent.
    fn send_keepalive(&self) -> impl std::future::Future<Output = bool> + Send;
}

pub(crate) fn ignore_message() -> Vec<u8> {
    let mut payload = vec![msg::IGNORE];
    let _ = "".encode(&mut payload);
    payload
}

impl KeepAliveSender for Handle {
    async fn send_keepalive(&self) -> bool {
        self.send_flushed(ignore_message()).await.is_ok()
    }
}

/// The keep-alive driver of a session. Dropping it stops the keep-alives.
#[derive(Debug)]
pub struct KeepAlive {
    interval: watch::Sender<Option<Duration>>,
    task: JoinHandle<()>,
}

impl KeepAlive {
    /// Start sending keep-alives through `sender`. `None` or a zero
    /// interval sends nothing until [`KeepAlive::set_interval`] is called.
    pub fn start<S: KeepAliveSender>(sender: S, interval: Option<Duration>) -> Self {
        let (tx, rx) = watch::channel(interval);
        KeepAlive {
            interval: tx,
            task: tokio::spawn(run(sender, rx)),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        *self.interval.borrow()
    }

    /// Reschedule immediately: the next keep-alive is sent `interval`
    /// from now.
    pub fn set_interval(&self, interval: Option<Duration>) {
        self.interval.send_replace(interval);
    }

    pub fn stop(self) {}
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<S: KeepAliveSender>(sender: S, mut interval: watch::Receiver<Option<Duration>>) {
    loop {
        let period = (*interval.borrow_and_update()).filter(|d| !d.is_zero());
        let Some(period) = period else {
            trace!("keep-alive disabled");
            if interval.changed().await.is_err() {
                return;
            }
            continue;
        };
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                trace!("sending keep-alive");
                if !sender.send_keepalive().await {
                    debug!("keep-alive could not be sent");
                }
            }
            changed = interval.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

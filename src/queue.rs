// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2026 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Bounded FIFO of callers waiting for the client to reach Connected.

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::oneshot;

use crate::{
    connection::Connection,
    error::{RtmError, RtmResult},
};

pub(crate) type ConnectionWaiter = oneshot::Sender<RtmResult<Arc<Connection>>>;

/// Holds `get_connection` callers while the client is disconnected.
///
/// Capacity zero means callers are rejected immediately whenever the client
/// is not connected.
#[derive(Debug)]
pub(crate) struct OfflineQueue {
    capacity: usize,
    waiters: VecDeque<ConnectionWaiter>,
}

impl OfflineQueue {
    pub(crate) const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            waiters: VecDeque::new(),
        }
    }

    /// Enqueues a waiter, handing it back when the queue is full.
    pub(crate) fn push(&mut self, waiter: ConnectionWaiter) -> Result<(), ConnectionWaiter> {
        if self.waiters.len() >= self.capacity {
            return Err(waiter);
        }
        self.waiters.push_back(waiter);
        Ok(())
    }

    /// Resolves every waiter in FIFO order with the live connection.
    pub(crate) fn drain_connected(&mut self, connection: &Arc<Connection>) {
        let drained = self.waiters.len();
        while let Some(waiter) = self.waiters.pop_front() {
            let _ = waiter.send(Ok(Arc::clone(connection)));
        }
        if drained > 0 {
            log::debug!("Resolved {drained} queued connection waiters");
        }
    }

    /// Fails every waiter with the given error.
    pub(crate) fn fail_all(&mut self, error: &RtmError) {
        while let Some(waiter) = self.waiters.pop_front() {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

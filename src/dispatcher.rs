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

//! Serialized executor for user-facing callbacks.
//!
//! A single worker task drains posted jobs strictly in FIFO order and never
//! runs two at once, so observer callbacks see event sequences exactly as the
//! core emitted them. Posting from within a running job enqueues the new job
//! behind everything already queued; it never runs inline.

use std::{future::Future, pin::Pin};

use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to a running dispatch worker.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    job_tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Spawns the worker task and returns a handle to it.
    ///
    /// The worker exits once every handle has been dropped and the remaining
    /// queue has drained.
    #[must_use]
    pub fn start() -> Self {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                job.await;
            }
        });
        Self { job_tx }
    }

    /// Enqueues a job behind everything already posted.
    ///
    /// Returns `false` if the worker has already shut down.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.job_tx.send(Box::pin(job)).is_err() {
            log::debug!("Dispatcher worker gone, job dropped");
            return false;
        }
        true
    }

    /// Runs a future on the dispatcher and awaits its result.
    ///
    /// The future executes in queue order relative to every other posted job,
    /// which makes this the explicit way to sequence work behind pending
    /// event deliveries.
    pub async fn run<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let posted = self.post(async move {
            let _ = tx.send(fut.await);
        });
        if !posted {
            return None;
        }
        rx.await.ok()
    }
}

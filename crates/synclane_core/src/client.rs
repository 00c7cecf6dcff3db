//! The shared execution context.
//!
//! Every transport of a process runs its callbacks on one background worker.
//! The worker is a dedicated thread driving a single-threaded tokio runtime
//! that drains a FIFO job queue.

use crate::config::{ClientConfig, LogLevel};
use crate::error::SyncResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// A unit of work run on the worker.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

type StopListener = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Flush(std_mpsc::SyncSender<()>),
}

/// Identifies a listener registered with [`SyncClient::on_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StopListenerId(u64);

/// The background worker shared by all sessions.
pub struct SyncClient {
    config: ClientConfig,
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    stopped: watch::Sender<bool>,
    listeners: Mutex<Vec<(StopListenerId, StopListener)>>,
    next_listener: AtomicU64,
}

impl SyncClient {
    /// Starts the worker with `config`.
    pub fn start(config: ClientConfig) -> SyncResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();

        let worker = thread::Builder::new()
            .name("synclane-client".into())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(message) = receiver.recv().await {
                        match message {
                            Message::Run(job) => job(),
                            Message::Flush(done) => {
                                let _ = done.send(());
                            }
                        }
                    }
                });
            })?;
        let worker_id = worker.thread().id();

        info!(
            user_agent = %config.user_agent(),
            log_level = ?config.log_level,
            multiplex = config.multiplex_sessions,
            "sync client started"
        );

        let (stopped, _) = watch::channel(false);
        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            worker_id,
            stopped,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        })
    }

    /// Returns the configuration captured at start.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the captured log level.
    pub fn log_level(&self) -> LogLevel {
        self.config.log_level
    }

    /// Returns true when called from the worker thread.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Queues `job` to run on the worker. Returns `false` if the client has
    /// stopped, in which case the job is dropped unrun.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Message::Run(Box::new(job))).is_ok(),
            None => false,
        }
    }

    /// Blocks until every job posted before this call has run. Returns at
    /// once on the worker thread or after [`stop`](Self::stop).
    pub fn flush(&self) {
        if self.is_worker_thread() {
            return;
        }
        let (done, wait) = std_mpsc::sync_channel(1);
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Message::Flush(done)).is_ok(),
            None => false,
        };
        if sent {
            let _ = wait.recv();
        }
    }

    /// Returns true once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Returns a receiver that observes the stopped flag.
    pub fn subscribe_stopped(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }

    /// Registers `listener` to run when the client stops. Runs it at once if
    /// the client has already stopped.
    pub fn on_stop<F>(&self, listener: F) -> StopListenerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = StopListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock();
        if self.is_stopped() {
            drop(listeners);
            listener();
        } else {
            listeners.push((id, Box::new(listener)));
        }
        id
    }

    /// Removes a listener that has not run yet.
    pub fn remove_stop_listener(&self, id: StopListenerId) {
        self.listeners.lock().retain(|(listener, _)| *listener != id);
    }

    /// Stops the worker. Pending stop listeners run on the calling thread.
    /// Jobs queued before the call still run before the worker exits, and
    /// later posts are rejected. Idempotent.
    pub fn stop(&self) {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if self.stopped.send_replace(true) {
                return;
            }
            std::mem::take(&mut *listeners)
        };
        debug!(listeners = listeners.len(), "stopping sync client");

        for (_, listener) in listeners {
            listener();
        }

        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if !self.is_worker_thread() {
                let _ = worker.join();
            }
        }
        info!("sync client stopped");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

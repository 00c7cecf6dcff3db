//! Transport handle abstraction.
//!
//! A transport is the lower-level object that talks to the sync server for
//! one local file. The session state machine drives it; the network code
//! behind it lives elsewhere. [`MockTransport`] is an in-process
//! implementation whose server-side events are triggered by the caller.

use crate::client::{StopListenerId, SyncClient};
use crate::config::SessionConfig;
use crate::protocol::TransportErrorEvent;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::trace;

/// Outcome of an asynchronous wait that did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The wait was cancelled because the transport closed or the client
    /// stopped.
    #[error("operation aborted")]
    Aborted,
    /// The transport failed.
    #[error("transport failed: {0}")]
    Failed(String),
}

/// Invoked once when an upload or download wait resolves.
pub type CompletionHandler = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Receives protocol errors from a transport.
pub type TransportErrorHandler = Arc<dyn Fn(TransportErrorEvent) + Send + Sync + 'static>;

/// Receives `(old_version, new_version)` after a sync transaction.
pub type SyncTransactCallback = Arc<dyn Fn(u64, u64) + Send + Sync + 'static>;

/// One physical session with the sync server.
///
/// Callbacks registered here are invoked on the client worker, except when
/// the client has already stopped, in which case completion handlers may run
/// inline with [`TransportError::Aborted`].
pub trait SessionTransport: Send + Sync {
    /// Binds to `server_url` using `access_token`.
    fn bind(&self, server_url: &str, access_token: &str);

    /// Replaces the access token of a bound transport.
    fn refresh(&self, access_token: &str);

    /// Tears the transport down. Pending waits complete with
    /// [`TransportError::Aborted`].
    fn close(&self);

    /// Sets the protocol error handler.
    fn set_error_handler(&self, handler: TransportErrorHandler);

    /// Sets the sync transaction callback.
    fn set_sync_transact_callback(&self, callback: SyncTransactCallback);

    /// Tells the transport that a local commit produced `version`.
    fn nonsync_transact_notify(&self, version: u64);

    /// Skips any pending reconnect backoff.
    fn cancel_reconnect_delay(&self);

    /// Calls `handler` once all local changes have been uploaded.
    fn async_wait_for_upload_completion(&self, handler: CompletionHandler);

    /// Calls `handler` once all remote changes have been downloaded.
    fn async_wait_for_download_completion(&self, handler: CompletionHandler);

    /// Blocks until uploads complete. Returns `false` if the client stopped
    /// first.
    fn wait_for_upload_complete_or_client_stopped(&self) -> bool;

    /// Blocks until downloads complete. Returns `false` if the client
    /// stopped first.
    fn wait_for_download_complete_or_client_stopped(&self) -> bool;
}

/// Creates transports for sessions.
pub trait TransportFactory: Send + Sync {
    /// Creates an unbound transport for the file at `path`.
    fn make_session(
        &self,
        client: &Arc<SyncClient>,
        path: &Path,
        config: &SessionConfig,
    ) -> Arc<dyn SessionTransport>;
}

#[derive(Default)]
struct MockState {
    bound_url: Option<String>,
    access_token: Option<String>,
    bind_count: usize,
    refresh_count: usize,
    cancel_reconnect_count: usize,
    nonsync_versions: Vec<u64>,
    closed: bool,
    stopped: bool,
    error_handler: Option<TransportErrorHandler>,
    transact_callback: Option<SyncTransactCallback>,
    upload_waiters: Vec<CompletionHandler>,
    download_waiters: Vec<CompletionHandler>,
    upload_generation: u64,
    download_generation: u64,
}

/// In-process transport. Server-side events are triggered with the
/// `simulate_*` and `complete_*` methods.
pub struct MockTransport {
    path: PathBuf,
    client: Weak<SyncClient>,
    state: Mutex<MockState>,
    changed: Condvar,
    stop_listener: Mutex<Option<StopListenerId>>,
}

impl MockTransport {
    /// Creates a transport running callbacks on `client`.
    pub fn new(client: &Arc<SyncClient>, path: &Path) -> Arc<Self> {
        let transport = Arc::new(Self {
            path: path.to_path_buf(),
            client: Arc::downgrade(client),
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
            stop_listener: Mutex::new(None),
        });
        let weak = Arc::downgrade(&transport);
        let id = client.on_stop(move || {
            if let Some(transport) = weak.upgrade() {
                transport.on_client_stopped();
            }
        });
        *transport.stop_listener.lock() = Some(id);
        transport
    }

    /// Returns the file this transport synchronizes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the URL of the last bind.
    pub fn bound_url(&self) -> Option<String> {
        self.state.lock().bound_url.clone()
    }

    /// Returns the most recent access token.
    pub fn access_token(&self) -> Option<String> {
        self.state.lock().access_token.clone()
    }

    /// Returns how many times `bind` was called.
    pub fn bind_count(&self) -> usize {
        self.state.lock().bind_count
    }

    /// Returns how many times `refresh` was called.
    pub fn refresh_count(&self) -> usize {
        self.state.lock().refresh_count
    }

    /// Returns how many times `cancel_reconnect_delay` was called.
    pub fn cancel_reconnect_count(&self) -> usize {
        self.state.lock().cancel_reconnect_count
    }

    /// Returns every version passed to `nonsync_transact_notify`.
    pub fn nonsync_versions(&self) -> Vec<u64> {
        self.state.lock().nonsync_versions.clone()
    }

    /// Returns true once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the number of pending upload waits.
    pub fn pending_upload_waits(&self) -> usize {
        self.state.lock().upload_waiters.len()
    }

    /// Returns the number of pending download waits.
    pub fn pending_download_waits(&self) -> usize {
        self.state.lock().download_waiters.len()
    }

    /// Delivers `event` to the error handler on the client worker.
    pub fn simulate_error(&self, event: TransportErrorEvent) {
        let handler = self.state.lock().error_handler.clone();
        if let Some(handler) = handler {
            self.run_on_client(move || handler(event));
        }
    }

    /// Reports a sync transaction on the client worker.
    pub fn simulate_sync_transact(&self, old_version: u64, new_version: u64) {
        let callback = self.state.lock().transact_callback.clone();
        if let Some(callback) = callback {
            self.run_on_client(move || callback(old_version, new_version));
        }
    }

    /// Resolves every pending upload wait with `result`.
    pub fn complete_uploads(&self, result: Result<(), TransportError>) {
        let waiters = {
            let mut state = self.state.lock();
            state.upload_generation += 1;
            std::mem::take(&mut state.upload_waiters)
        };
        self.changed.notify_all();
        trace!(path = %self.path.display(), waiters = waiters.len(), "uploads complete");
        for waiter in waiters {
            self.deliver(waiter, result.clone());
        }
    }

    /// Resolves only the oldest pending upload wait with `result`.
    pub fn complete_oldest_upload(&self, result: Result<(), TransportError>) {
        let waiter = {
            let mut state = self.state.lock();
            if state.upload_waiters.is_empty() {
                None
            } else {
                Some(state.upload_waiters.remove(0))
            }
        };
        if let Some(waiter) = waiter {
            self.deliver(waiter, result);
        }
    }

    /// Resolves every pending download wait with `result`.
    pub fn complete_downloads(&self, result: Result<(), TransportError>) {
        let waiters = {
            let mut state = self.state.lock();
            state.download_generation += 1;
            std::mem::take(&mut state.download_waiters)
        };
        self.changed.notify_all();
        for waiter in waiters {
            self.deliver(waiter, result.clone());
        }
    }

    fn run_on_client<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(client) = self.client.upgrade() {
            client.post(job);
        }
    }

    fn deliver(&self, waiter: CompletionHandler, result: Result<(), TransportError>) {
        match self.client.upgrade() {
            Some(client) if !client.is_stopped() => {
                client.post(move || waiter(result));
            }
            _ => waiter(Err(TransportError::Aborted)),
        }
    }

    fn abort_waits(&self) {
        let (uploads, downloads) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.upload_waiters),
                std::mem::take(&mut state.download_waiters),
            )
        };
        self.changed.notify_all();
        for waiter in uploads.into_iter().chain(downloads) {
            self.deliver(waiter, Err(TransportError::Aborted));
        }
    }

    fn on_client_stopped(&self) {
        let (uploads, downloads) = {
            let mut state = self.state.lock();
            state.stopped = true;
            (
                std::mem::take(&mut state.upload_waiters),
                std::mem::take(&mut state.download_waiters),
            )
        };
        self.changed.notify_all();
        for waiter in uploads.into_iter().chain(downloads) {
            waiter(Err(TransportError::Aborted));
        }
    }

    fn wait_for(&self, generation: impl Fn(&MockState) -> u64) -> bool {
        let mut state = self.state.lock();
        let start = generation(&state);
        loop {
            if state.stopped || state.closed {
                return false;
            }
            if generation(&state) != start {
                return true;
            }
            self.changed.wait(&mut state);
        }
    }
}

impl SessionTransport for MockTransport {
    fn bind(&self, server_url: &str, access_token: &str) {
        let mut state = self.state.lock();
        state.bound_url = Some(server_url.to_string());
        state.access_token = Some(access_token.to_string());
        state.bind_count += 1;
    }

    fn refresh(&self, access_token: &str) {
        let mut state = self.state.lock();
        state.access_token = Some(access_token.to_string());
        state.refresh_count += 1;
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.abort_waits();
    }

    fn set_error_handler(&self, handler: TransportErrorHandler) {
        self.state.lock().error_handler = Some(handler);
    }

    fn set_sync_transact_callback(&self, callback: SyncTransactCallback) {
        self.state.lock().transact_callback = Some(callback);
    }

    fn nonsync_transact_notify(&self, version: u64) {
        self.state.lock().nonsync_versions.push(version);
    }

    fn cancel_reconnect_delay(&self) {
        self.state.lock().cancel_reconnect_count += 1;
    }

    fn async_wait_for_upload_completion(&self, handler: CompletionHandler) {
        let mut state = self.state.lock();
        if state.stopped || state.closed {
            drop(state);
            self.deliver(handler, Err(TransportError::Aborted));
            return;
        }
        state.upload_waiters.push(handler);
    }

    fn async_wait_for_download_completion(&self, handler: CompletionHandler) {
        let mut state = self.state.lock();
        if state.stopped || state.closed {
            drop(state);
            self.deliver(handler, Err(TransportError::Aborted));
            return;
        }
        state.download_waiters.push(handler);
    }

    fn wait_for_upload_complete_or_client_stopped(&self) -> bool {
        self.wait_for(|state| state.upload_generation)
    }

    fn wait_for_download_complete_or_client_stopped(&self) -> bool {
        self.wait_for(|state| state.download_generation)
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let id = self.stop_listener.lock().take();
        if let (Some(id), Some(client)) = (id, self.client.upgrade()) {
            client.remove_stop_listener(id);
        }
    }
}

/// Factory producing [`MockTransport`]s and remembering each one.
#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    /// Creates a factory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns how many transports were created.
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Returns the most recent transport created for `path`.
    pub fn latest(&self, path: &Path) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|t| t.path() == path)
            .cloned()
    }

    /// Returns every transport created for `path`, oldest first.
    pub fn all_for(&self, path: &Path) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .filter(|t| t.path() == path)
            .cloned()
            .collect()
    }
}

impl TransportFactory for MockTransportFactory {
    fn make_session(
        &self,
        client: &Arc<SyncClient>,
        path: &Path,
        _config: &SessionConfig,
    ) -> Arc<dyn SessionTransport> {
        let transport = MockTransport::new(client, path);
        self.created.lock().push(Arc::clone(&transport));
        transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::protocol::ProtocolError;
    use std::thread;

    fn client() -> Arc<SyncClient> {
        Arc::new(SyncClient::start(ClientConfig::default()).unwrap())
    }

    #[test]
    fn records_bind_and_refresh() {
        let client = client();
        let transport = MockTransport::new(&client, Path::new("/a"));
        transport.bind("sync://host/a", "t1");
        transport.refresh("t2");
        transport.nonsync_transact_notify(7);

        assert_eq!(transport.bound_url().as_deref(), Some("sync://host/a"));
        assert_eq!(transport.access_token().as_deref(), Some("t2"));
        assert_eq!(transport.bind_count(), 1);
        assert_eq!(transport.refresh_count(), 1);
        assert_eq!(transport.nonsync_versions(), vec![7]);
    }

    #[test]
    fn errors_arrive_on_worker() {
        let client = client();
        let transport = MockTransport::new(&client, Path::new("/a"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let worker = Arc::clone(&client);
        transport.set_error_handler(Arc::new(move |event| {
            assert!(worker.is_worker_thread());
            sink.lock().push(event.code);
        }));
        transport.simulate_error(TransportErrorEvent::new(ProtocolError::TokenExpired, "x"));
        client.flush();

        assert_eq!(*seen.lock(), vec![202]);
    }

    #[test]
    fn upload_waits_complete() {
        let client = client();
        let transport = MockTransport::new(&client, Path::new("/a"));
        let results = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let results = Arc::clone(&results);
            transport.async_wait_for_upload_completion(Box::new(move |r| results.lock().push(r)));
        }
        assert_eq!(transport.pending_upload_waits(), 2);

        transport.complete_uploads(Ok(()));
        client.flush();
        assert_eq!(*results.lock(), vec![Ok(()), Ok(())]);
    }

    #[test]
    fn close_aborts_waits() {
        let client = client();
        let transport = MockTransport::new(&client, Path::new("/a"));
        let results = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&results);
        transport.async_wait_for_download_completion(Box::new(move |r| sink.lock().push(r)));
        transport.close();
        client.flush();

        assert_eq!(*results.lock(), vec![Err(TransportError::Aborted)]);
    }

    #[test]
    fn blocking_wait_returns_false_on_stop() {
        let client = client();
        let transport = MockTransport::new(&client, Path::new("/a"));

        let waiter = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || transport.wait_for_upload_complete_or_client_stopped())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        client.stop();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn blocking_wait_returns_true_on_completion() {
        let client = client();
        let transport = MockTransport::new(&client, Path::new("/a"));

        let waiter = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || transport.wait_for_download_complete_or_client_stopped())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        transport.complete_downloads(Ok(()));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn factory_remembers_transports() {
        let client = client();
        let factory = MockTransportFactory::new();
        let user = crate::user::User::detached("alice", "t", "https://auth");
        let config = SessionConfig::new(user, "sync://host/a");

        factory.make_session(&client, Path::new("/a"), &config);
        factory.make_session(&client, Path::new("/a"), &config);
        factory.make_session(&client, Path::new("/b"), &config);

        assert_eq!(factory.created_count(), 3);
        assert_eq!(factory.all_for(Path::new("/a")).len(), 2);
        assert!(factory.latest(Path::new("/c")).is_none());
    }
}

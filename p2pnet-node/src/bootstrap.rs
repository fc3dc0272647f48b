//! Bootstrap coordinator: retry connections to known peers and announce once on first success.
//!
//! A polling task dials every address-book peer that is not connected. The
//! first successful connect wins the `BootstrapGate`; the winner advertises the
//! rendezvous tag once, releases `wait()`ers, and starts periodic directory
//! lookups. Local discovery only feeds the address book.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use p2pnet_core::{BootstrapGate, BootstrapState, PeerRecord};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::connmgr::ConnectionManager;
use crate::directory::DirectoryRouter;

pub struct BootstrapCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    gate: BootstrapGate,
    connmgr: Arc<ConnectionManager>,
    router: Arc<DirectoryRouter>,
    rendezvous: String,
    poll_interval: Duration,
    directory_poll: Option<Duration>,
    done: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BootstrapCoordinator {
    /// `directory_poll` of `None` runs the post-announce lookup once and stops.
    pub fn new(
        connmgr: Arc<ConnectionManager>,
        router: Arc<DirectoryRouter>,
        rendezvous: String,
        poll_interval: Duration,
        directory_poll: Option<Duration>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                gate: BootstrapGate::new(),
                connmgr,
                router,
                rendezvous,
                poll_interval,
                directory_poll,
                done,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.inner.gate.state()
    }

    /// Start the polling task. Later calls are no-ops.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.gate.start_discovery();
        let inner = self.inner.clone();
        self.inner.spawn(async move {
            loop {
                inner.poll_once().await;
                tokio::time::sleep(inner.poll_interval).await;
            }
        });
        debug!(rendezvous = %self.inner.rendezvous, "bootstrap polling started");
    }

    /// Drain a local discovery channel into the address book.
    pub fn consume_local(&self, mut found: mpsc::Receiver<PeerRecord>) {
        let inner = self.inner.clone();
        self.inner.spawn(async move {
            while let Some(record) = found.recv().await {
                inner.connmgr.record_peer(&record);
            }
            debug!("local discovery channel closed");
        });
    }

    /// Resolves once first connectivity is confirmed and the announce was attempted.
    pub async fn wait(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Report a connection made outside the polling task.
    pub fn connection_established(&self) {
        if self.inner.gate.try_connect() {
            let inner = self.inner.clone();
            self.inner.spawn(async move { inner.announce().await });
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Stop polling, local discovery consumption and directory lookups.
    pub fn close(&self) {
        let tasks = std::mem::take(&mut *self.inner.lock_tasks());
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for BootstrapCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock_tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(fut));
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One reconciliation pass. Connects run concurrently; any success may win the gate,
    /// as does a connection that already exists (inbound or dialed by the application).
    async fn poll_once(self: &Arc<Self>) {
        let mut won = false;
        if !self.connmgr.transport().connected_peers().is_empty() {
            won = self.gate.try_connect();
        }
        let peers = self.connmgr.unconnected_peers();
        let mut attempts = JoinSet::new();
        for peer in peers {
            let connmgr = self.connmgr.clone();
            attempts.spawn(async move { (peer, connmgr.connect(peer).await) });
        }
        while let Some(joined) = attempts.join_next().await {
            let Ok((peer, connected)) = joined else { continue };
            if connected {
                debug!(%peer, "bootstrap connect succeeded");
                if self.gate.try_connect() {
                    won = true;
                }
            }
        }
        if won {
            self.announce().await;
        }
    }

    async fn announce(self: &Arc<Self>) {
        info!(rendezvous = %self.rendezvous, "first peer connected, announcing");
        match self.router.advertise(&self.rendezvous).await {
            Ok(()) => {
                self.gate.mark_announced();
                info!(rendezvous = %self.rendezvous, "announced");
            }
            Err(e) => warn!("announce failed, staying connected: {e}"),
        }
        self.done.send_replace(true);

        let inner = self.clone();
        self.spawn(async move {
            loop {
                inner.lookup().await;
                let Some(every) = inner.directory_poll else { break };
                tokio::time::sleep(every).await;
            }
        });
    }

    async fn lookup(&self) {
        let mut found = match self.router.find_peers(&self.rendezvous).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("directory lookup failed: {e}");
                return;
            }
        };
        let mut count = 0usize;
        while let Some(record) = found.recv().await {
            self.connmgr.record_peer(&record);
            count += 1;
        }
        debug!(rendezvous = %self.rendezvous, count, "directory lookup finished");
    }
}

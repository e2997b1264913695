use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Callback invoked when a monitored timeout elapses.
pub trait TimeoutClient: Send + Sync {
    fn on_timeout_monitoring(&self);
}

/// Watches a set of clients, firing periodically while any is registered.
///
/// The executor handle is injected by the service host; monitors sharing a
/// handle share its timer threads. Adding the first client arms the timer,
/// removing the last one disarms it. On fire, clients are invoked through
/// a snapshot, so a client may remove itself from its own callback.
pub struct TimeoutMonitor {
    elapsed: Duration,
    handle: Handle,
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    clients: Vec<Arc<dyn TimeoutClient>>,
    timer: Option<JoinHandle<()>>,
}

impl TimeoutMonitor {
    pub fn new(elapsed: Duration, handle: Handle) -> Self {
        Self {
            elapsed,
            handle,
            inner: Arc::new(Mutex::new(Inner {
                clients: Vec::new(),
                timer: None,
            })),
        }
    }

    /// Registers a client, arming the timer if it was idle.
    pub fn add_client(&self, client: Arc<dyn TimeoutClient>) {
        let mut inner = self.inner.lock().expect("monitor lock");
        inner.clients.push(client);
        if inner.timer.is_none() {
            inner.timer = Some(self.spawn_timer());
        }
    }

    /// Replaces the client set with a single client.
    pub fn set_client(&self, client: Arc<dyn TimeoutClient>) {
        let mut inner = self.inner.lock().expect("monitor lock");
        inner.clients.clear();
        inner.clients.push(client);
        if inner.timer.is_none() {
            inner.timer = Some(self.spawn_timer());
        }
    }

    /// Unregisters a client, disarming the timer when none remain.
    pub fn remove_client(&self, client: &Arc<dyn TimeoutClient>) {
        let mut inner = self.inner.lock().expect("monitor lock");
        inner
            .clients
            .retain(|registered| !Arc::ptr_eq(registered, client));
        if inner.clients.is_empty() {
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
        }
    }

    /// Cooperative shutdown: succeeds only when nothing remains scheduled.
    pub fn shutdown(&self) -> bool {
        let mut inner = self.inner.lock().expect("monitor lock");
        if inner.clients.is_empty() {
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            true
        } else {
            false
        }
    }

    fn spawn_timer(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let elapsed = self.elapsed;
        self.handle.spawn(async move {
            loop {
                tokio::time::sleep(elapsed).await;
                let snapshot = inner.lock().expect("monitor lock").clients.clone();
                if snapshot.is_empty() {
                    break;
                }
                for client in snapshot {
                    client.on_timeout_monitoring();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl TimeoutClient for Counter {
        fn on_timeout_monitoring(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fires_while_a_client_is_registered() {
        let monitor = TimeoutMonitor::new(Duration::from_millis(10), Handle::current());
        let counter = Arc::new(Counter::default());
        let client: Arc<dyn TimeoutClient> = counter.clone();

        monitor.add_client(Arc::clone(&client));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(counter.0.load(Ordering::SeqCst) >= 1);

        monitor.remove_client(&client);
        let fired = counter.0.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.0.load(Ordering::SeqCst) <= fired + 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_is_cooperative() {
        let monitor = TimeoutMonitor::new(Duration::from_millis(10), Handle::current());
        let client: Arc<dyn TimeoutClient> = Arc::new(Counter::default());

        monitor.add_client(Arc::clone(&client));
        assert!(!monitor.shutdown());

        monitor.remove_client(&client);
        assert!(monitor.shutdown());
    }
}

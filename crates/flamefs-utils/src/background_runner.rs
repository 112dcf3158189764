use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owns a set of background tokio tasks and a shared shutdown signal.
///
/// Services spawn their control loops here; `shutdown().await` flips the
/// signal and joins every task.
pub struct BackgroundRunner {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundRunner {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// A receiver that flips to `true` when shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a task that receives the shutdown signal and is expected to
    /// exit promptly once it flips.
    pub fn spawn<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(f(rx)));
    }

    /// Spawn a loop that invokes `f` every `interval` until shutdown.
    pub fn spawn_periodic<F, Fut>(&mut self, interval: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { f().await; }
                    _ = rx.changed() => { break; }
                }
            }
        }));
    }

    /// Number of tasks spawned so far.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and join every task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl Default for BackgroundRunner {
    fn default() -> Self {
        Self::new()
    }
}

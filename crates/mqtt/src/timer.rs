//! Restartable one-shot timer.
//!
//! The session owns exactly one of these. It is armed as a connect watchdog
//! after an explicit connect and re-armed as the hourly health timer once the
//! broker acknowledges the connection. Starting it again replaces the pending
//! run; cancelling it drops the pending run.
//!
//! The callback is handed to its own task when the timer fires, so a callback
//! that cancels or restarts this same timer does not abort itself.

use std::{future::Future, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

type Callback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Timer {
    name: &'static str,
    callback: Callback,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Creates an idle timer that runs `callback` each time it fires.
    pub fn new<F, Fut>(name: &'static str, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            callback: Arc::new(move || Box::pin(callback())),
            task: Mutex::new(None),
        }
    }

    /// Arms the timer, replacing any pending run.
    pub async fn start(&self, timeout: Duration) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }

        debug!("Starting {} timer for {:?}", self.name, timeout);
        let callback = self.callback.clone();
        let name = self.name;
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!("Executing {} timer callback", name);
            tokio::spawn(callback());
        }));
    }

    /// Drops the pending run, if any.
    pub async fn cancel(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    /// True while a run is pending.
    pub async fn is_armed(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_timer() -> (Timer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = Timer::new("test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (timer, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_timeout() {
        let (timer, fired) = counting_timer();
        timer.start(Duration::from_secs(5)).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (timer, fired) = counting_timer();
        timer.start(Duration::from_secs(5)).await;
        assert!(timer.is_armed().await);

        timer.cancel().await;
        assert!(!timer.is_armed().await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_pending_run() {
        let (timer, fired) = counting_timer();
        timer.start(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        timer.start(Duration::from_secs(3600)).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

//! Fixed interval background loops
//!
//! Discovery, the message puller and the start/completion waits all follow
//! the same shape: run a tick, sleep, repeat until told to stop. [`PollTask`]
//! owns the spawned task and gives `stop()` join semantics, so once it
//! returns no tick is running and none will run again.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to a spawned polling loop
pub struct PollTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PollTask {
    /// Spawn a loop calling `tick` every `interval`.
    ///
    /// A tick returning `ControlFlow::Break` ends the loop on its own. When
    /// `drain_on_stop` is set, one last tick runs after the stop signal.
    pub fn spawn<F, Fut>(
        name: &'static str,
        interval: Duration,
        drain_on_stop: bool,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let (stop, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                if tick().await.is_break() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {
                        if drain_on_stop {
                            let _ = tick().await;
                        }
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(task = name, "Poll loop exited");
        });

        Self {
            name,
            stop,
            handle: Some(handle),
        }
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop and wait for the in-flight tick to finish
    pub async fn stop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(task = self.name, "Poll loop panicked");
                }
            }
        }
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_no_tick_after_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut task = PollTask::spawn("test", Duration::from_millis(5), false, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        task.stop().await;
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 1);
        assert!(!task.is_running());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_drain_tick_runs_on_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut task = PollTask::spawn("drain", Duration::from_secs(60), true, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        task.stop().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_break_ends_loop() {
        let mut task = PollTask::spawn("once", Duration::from_millis(1), false, || async {
            ControlFlow::Break(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_running());
        task.stop().await;
    }
}

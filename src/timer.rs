use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs a blocking closure at a fixed period until cancelled or dropped.
///
/// The first run happens right away. Every run executes on the blocking pool
/// and the next tick is scheduled once it returns, so runs never overlap.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
}

impl PeriodicTask {
    pub fn spawn<F>(runtime: &Handle, name: &'static str, period: Duration, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let f = Arc::new(f);

        runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let f = f.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || f()).await {
                    warn!("Periodic task {} panicked: {}", name, e);
                }
            }
            trace!("Periodic task {} stopped", name);
        });

        trace!("Periodic task {} every {:?}", name, period);
        PeriodicTask { name, cancel }
    }

    /// Stop scheduling runs. A run in progress completes.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Cancelling periodic task {}", self.name);
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn runs_until_cancelled() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = PeriodicTask::spawn(rt.handle(), "count", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(200));
        task.cancel();
        assert!(task.is_cancelled());

        // Let a run in progress finish.
        std::thread::sleep(Duration::from_millis(50));
        let after_cancel = count.load(Ordering::SeqCst);
        assert!(after_cancel >= 2);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn drop_cancels() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = PeriodicTask::spawn(rt.handle(), "drop", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(task);
        std::thread::sleep(Duration::from_millis(50));
        let after_drop = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), after_drop);
    }
}

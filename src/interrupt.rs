use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Listens for SIGINT/SIGTERM while a remote command is being waited on.
///
/// The first signal only warns: the command keeps running on the node and its
/// output will be lost. The second signal ends the process through the exit
/// hook (`std::process::exit(1)` when installed with [`InterruptWatch::install`]).
/// The remote operation is never canceled.
///
/// Dropping the watch stops listening.
pub struct InterruptWatch {
    tasks: Vec<JoinHandle<()>>,
}

impl InterruptWatch {
    /// Register the process signal handlers and start watching.
    pub fn install() -> Result<Self> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let (tx, rx) = mpsc::channel(2);

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigterm.recv() => tracing::debug!("received SIGTERM"),
                    _ = sigint.recv() => tracing::debug!("received SIGINT"),
                }
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        let mut watch = Self::from_receiver(rx, || std::process::exit(1));
        watch.tasks.push(forwarder);
        Ok(watch)
    }

    /// Watch an arbitrary stream of interrupt notifications.
    pub fn from_receiver<F>(mut interrupts: mpsc::Receiver<()>, hard_exit: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let policy = tokio::spawn(async move {
            if interrupts.recv().await.is_none() {
                return;
            }
            tracing::warn!(
                "The requested command hasn't finished yet, hit 'Ctrl+C' again to exit anyway."
            );
            tracing::warn!(
                "However, the command will continue running on the node, and you will be unable \
                 to see the output or run another command until it finishes."
            );

            if interrupts.recv().await.is_none() {
                return;
            }
            hard_exit();
        });

        Self {
            tasks: vec![policy],
        }
    }
}

impl Drop for InterruptWatch {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_interrupt_only_warns() {
        let exits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(2);
        let counter = exits.clone();
        let _watch = InterruptWatch::from_receiver(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 0);

        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_watch_never_exits() {
        let exits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(2);
        let counter = exits.clone();
        let watch = InterruptWatch::from_receiver(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(()).await.unwrap();
        drop(watch);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }
}

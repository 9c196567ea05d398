use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Command<T> {
    Push(T),
    Flush(oneshot::Sender<()>),
}

/// Trailing-edge debounce backed by a single task.
///
/// Every `push` replaces the pending value and restarts the quiescence
/// window; when the window closes the latest value is applied. Applies run
/// one at a time on the task, so they complete in the order their windows
/// closed. Dropping the debouncer aborts the task and discards any pending
/// value; call `flush` first to keep it.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn spawn<F, Fut>(window: Duration, mut apply: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<T>>();
        let task = tokio::spawn(async move {
            let mut pending: Option<T> = None;
            let sleep = tokio::time::sleep(window);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(Command::Push(value)) => {
                            pending = Some(value);
                            sleep.as_mut().reset(Instant::now() + window);
                        }
                        Some(Command::Flush(ack)) => {
                            if let Some(value) = pending.take() {
                                apply(value).await;
                            }
                            let _ = ack.send(());
                        }
                        None => break,
                    },
                    () = &mut sleep, if pending.is_some() => {
                        if let Some(value) = pending.take() {
                            apply(value).await;
                        }
                    }
                }
            }
        });
        Self { tx, task }
    }

    pub fn push(&self, value: T) {
        let _ = self.tx.send(Command::Push(value));
    }

    /// Apply the pending value now, if any, and wait until it is done.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

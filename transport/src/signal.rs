//! Shutdown coordination for server tasks.

use futures::{channel::oneshot, future::Shared, FutureExt};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Resolves once its server is told to stop.
///
/// Every task of a server holds a clone. Wait on a reference (`&mut signal`)
/// inside loops and stop polling once it has resolved.
#[derive(Clone)]
pub enum Signal {
    Open(Receiver),
    Closed,
}

impl Future for Signal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut *self {
            // A dropped signaler also means stop.
            Signal::Open(live) => Pin::new(&mut live.inner).poll(cx).map(|_| ()),
            Signal::Closed => Poll::Ready(()),
        }
    }
}

/// An open [Signal]. The last clone to drop completes the stop.
#[derive(Clone)]
pub struct Receiver {
    inner: Shared<oneshot::Receiver<()>>,
    _guard: Arc<Guard>,
}

struct Guard {
    tx: Option<oneshot::Sender<()>>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Stops a group of tasks and waits for all of them to exit.
pub enum Stopper {
    Running {
        tx: Option<oneshot::Sender<()>>,
        completion: Shared<oneshot::Receiver<()>>,
        signal: Signal,
    },
    Stopped {
        completion: Shared<oneshot::Receiver<()>>,
    },
}

impl Stopper {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        Self::Running {
            tx: Some(tx),
            completion: completion_rx.shared(),
            signal: Signal::Open(Receiver {
                inner: rx.shared(),
                _guard: Arc::new(Guard {
                    tx: Some(completion_tx),
                }),
            }),
        }
    }

    /// Returns a signal for a new task to await.
    pub fn stopped(&self) -> Signal {
        match self {
            Self::Running { signal, .. } => signal.clone(),
            Self::Stopped { .. } => Signal::Closed,
        }
    }

    /// Resolves every signal and returns a future that completes once all of
    /// them have been dropped. Later calls return the same future.
    pub fn stop(&mut self) -> Shared<oneshot::Receiver<()>> {
        match self {
            Self::Running { tx, completion, .. } => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
                let completion = completion.clone();

                // Dropping our own signal lets the guard fire once the tasks exit.
                *self = Self::Stopped {
                    completion: completion.clone(),
                };
                completion
            }
            Self::Stopped { completion } => completion.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_waits_for_holders() {
        let mut stopper = Stopper::new();
        let mut signal = stopper.stopped();
        let (exited_tx, mut exited_rx) = oneshot::channel();
        tokio::spawn(async move {
            (&mut signal).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = exited_tx.send(());
            drop(signal);
        });

        stopper.stop().await.unwrap();
        assert_eq!(exited_rx.try_recv(), Ok(Some(())));
        assert!(stopper.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut stopper = Stopper::new();
        stopper.stop().await.unwrap();
        stopper.stop().await.unwrap();
        stopper.stopped().await;
    }

    #[tokio::test]
    async fn test_loop_on_reference() {
        let mut stopper = Stopper::new();
        let mut signal = stopper.stopped();
        let handle = tokio::spawn(async move {
            let mut ticks = 0;
            loop {
                tokio::select! {
                    _ = &mut signal => break,
                    _ = tokio::time::sleep(Duration::from_millis(1)) => ticks += 1,
                }
            }
            ticks
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        stopper.stop().await.unwrap();
        handle.await.unwrap();
    }
}

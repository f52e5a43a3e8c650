//! Task ownership and cooperative cancellation.
//!
//! Every background worker the node spawns (session workers, enumerator
//! pumps, NAT mapping watchers) is owned by one [`TaskOwner`] per node.
//! Stopping the node cancels the owner's token and waits for every
//! spawned task to actually finish, the same "flush the task owner"
//! sequencing `node.rs`'s `stop()` performs at each of its own steps.
//!
//! `tokio_util::sync::CancellationToken` stands in for the original's
//! catchable `Stop` cancellation signal: workers `tokio::select!` against
//! `token.cancelled()` at their suspension points and translate a firing
//! token into `Error::Stop`, the same way a caught `Stop` exception was
//! translated into exactly one `session.failed()`.

use {
  crate::error::{Error, Result},
  std::future::Future,
  tokio::task::JoinHandle,
  tokio_util::sync::CancellationToken,
};

pub struct TaskOwner {
  token: CancellationToken,
  handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskOwner {
  pub fn new() -> Self {
    Self {
      token: CancellationToken::new(),
      handles: parking_lot::Mutex::new(Vec::new()),
    }
  }

  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }

  /// Spawns `fut` under this owner. The future is expected to race its own
  /// suspension points against `self.token().cancelled()` (or use
  /// [`cancellable`]) so it winds down promptly once [`Self::flush`] is
  /// called.
  pub fn spawn<F>(&self, fut: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(fut);
    self.handles.lock().push(handle);
  }

  /// Cancels the token and waits for every task spawned so far to finish.
  /// Idempotent: calling it again with nothing outstanding is a no-op.
  pub async fn flush(&self) {
    self.token.cancel();
    let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
    for handle in handles {
      let _ = handle.await;
    }
  }
}

impl Default for TaskOwner {
  fn default() -> Self {
    Self::new()
  }
}

/// Races `fut` against `token`, translating cancellation into
/// [`Error::Stop`]. Use at every suspension point a worker must be able
/// to unwind from promptly (a pending connect, an await on a channel).
pub async fn cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T>
where
  F: Future<Output = Result<T>>,
{
  tokio::select! {
    _ = token.cancelled() => Err(Error::Stop),
    res = fut => res,
  }
}

#[cfg(test)]
mod tests {
  use {super::*, std::time::Duration, tokio::time::sleep};

  #[tokio::test]
  async fn flush_waits_for_spawned_tasks() {
    let owner = TaskOwner::new();
    let (tx, rx) = tokio::sync::oneshot::channel();
    owner.spawn(async move {
      sleep(Duration::from_millis(5)).await;
      let _ = tx.send(());
    });
    owner.flush().await;
    assert!(rx.await.is_ok());
  }

  #[tokio::test]
  async fn flush_is_idempotent() {
    let owner = TaskOwner::new();
    owner.flush().await;
    owner.flush().await;
  }

  #[tokio::test]
  async fn cancellable_translates_cancellation_into_stop() {
    let token = CancellationToken::new();
    token.cancel();
    let result: Result<()> = cancellable(&token, async {
      sleep(Duration::from_secs(3600)).await;
      Ok(())
    })
    .await;
    assert!(matches!(result, Err(Error::Stop)));
  }

  #[tokio::test]
  async fn cancellable_returns_inner_result_when_not_cancelled() {
    let token = CancellationToken::new();
    let result = cancellable(&token, async { Ok::<_, Error>(42) }).await;
    assert_eq!(result.unwrap(), 42);
  }
}

//! User handler seam.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Record;

/// Processes one consumed record.
///
/// Returning an error (or panicking) counts as a handler failure: the record
/// is retried and eventually dead-lettered. Handlers must be idempotent, as
/// delivery is at-least-once.
///
/// This trait uses `#[async_trait]`, so implementors see an `async fn`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> anyhow::Result<()>;
}

/// Shared handler pointer used by the consumption loops.
pub type HandlerPtr = Arc<dyn MessageHandler>;

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        (**self).handle(record).await
    }
}

/// Handler backed by an async closure; see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        (self.f)(record.clone()).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
///
/// ```
/// use mom_delivery::handler_fn;
///
/// let handler = handler_fn(|record| async move {
///     println!("received {:?}", record.message.value_str());
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

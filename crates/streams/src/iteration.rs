//! The per-item iteration stage.
//!
//! An `IterationStage` pairs an iterator (the per-item function) with a
//! handler that decides what to emit from the iterator's result. The handler
//! policies for map, multimap, filter and each live in `stages::transform`;
//! they all share the sync/async logic here.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;

use crate::error::StageError;
use crate::stage::{Emitter, Stage, Step};

type SyncIter<T, R> = Box<dyn FnMut(&T) -> anyhow::Result<R> + Send>;
type AsyncIter<T, R> = Box<dyn FnMut(&T) -> BoxFuture<'static, anyhow::Result<R>> + Send>;

/// Handles one iterator result: `(result, original item, emitter)`.
pub type Handler<T, R, O> = Box<dyn FnMut(R, T, &mut Emitter<O>) + Send>;

/// The per-item function of an [`IterationStage`].
///
/// The mode is chosen explicitly. In async mode the returned future must own
/// what it needs from the item. Items are still resolved one at a time, but
/// callers must not rely on input order when feeding async results into an
/// order-sensitive reduction.
pub enum IterFn<T, R> {
    Sync(SyncIter<T, R>),
    Async(AsyncIter<T, R>),
}

impl<T, R> IterFn<T, R> {
    /// A fallible synchronous iterator.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnMut(&T) -> anyhow::Result<R> + Send + 'static,
    {
        IterFn::Sync(Box::new(f))
    }

    /// A synchronous iterator that cannot fail.
    pub fn infallible<F>(mut f: F) -> Self
    where
        T: 'static,
        R: 'static,
        F: FnMut(&T) -> R + Send + 'static,
    {
        IterFn::Sync(Box::new(move |item: &T| Ok(f(item))))
    }

    /// An asynchronous iterator; the item counts as done when the future resolves.
    pub fn asynchronous<F, Fut>(mut f: F) -> Self
    where
        T: 'static,
        R: 'static,
        F: FnMut(&T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        IterFn::Async(Box::new(move |item: &T| f(item).boxed()))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, IterFn::Async(_))
    }

    pub(crate) fn start(&mut self, item: &T) -> Step<R> {
        match self {
            IterFn::Sync(f) => Step::Ready(f(item)),
            IterFn::Async(f) => Step::Pending(f(item)),
        }
    }
}

/// A stage that runs an iterator on every item and lets a handler emit.
pub struct IterationStage<T, R, O> {
    id: String,
    iterator: IterFn<T, R>,
    handler: Handler<T, R, O>,
    handled: u64,
}

impl<T, R, O> IterationStage<T, R, O> {
    pub fn builder() -> IterationStageBuilder<T, R, O> {
        IterationStageBuilder::default()
    }

    pub(crate) fn from_parts(id: &str, iterator: IterFn<T, R>, handler: Handler<T, R, O>) -> Self {
        Self {
            id: id.to_string(),
            iterator,
            handler,
            handled: 0,
        }
    }

    /// Number of items whose iteration completed and reached the handler.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    pub fn is_async(&self) -> bool {
        self.iterator.is_async()
    }
}

#[async_trait]
impl<T, R, O> Stage<T, O> for IterationStage<T, R, O>
where
    T: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&mut self, item: T, out: &mut Emitter<O>) -> Result<(), StageError> {
        let step = self.iterator.start(&item);
        let result = step
            .resolve()
            .await
            .map_err(|source| StageError::processing(&self.id, source))?;
        (self.handler)(result, item, out);
        self.handled += 1;
        Ok(())
    }
}

/// Builder for a custom [`IterationStage`].
pub struct IterationStageBuilder<T, R, O> {
    id: Option<String>,
    iterator: Option<IterFn<T, R>>,
    handler: Option<Handler<T, R, O>>,
}

impl<T, R, O> Default for IterationStageBuilder<T, R, O> {
    fn default() -> Self {
        Self {
            id: None,
            iterator: None,
            handler: None,
        }
    }
}

impl<T, R, O> IterationStageBuilder<T, R, O> {
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn iterator(mut self, iterator: IterFn<T, R>) -> Self {
        self.iterator = Some(iterator);
        self
    }

    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: FnMut(R, T, &mut Emitter<O>) + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> Result<IterationStage<T, R, O>, StageError> {
        let iterator = self
            .iterator
            .ok_or_else(|| StageError::InvalidArgument("iterator function required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| StageError::InvalidArgument("handler function required".to_string()))?;
        let id = self.id.unwrap_or_else(|| "iterate".to_string());
        Ok(IterationStage::from_parts(&id, iterator, handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn emit_result() -> impl FnMut(i32, i32, &mut Emitter<i32>) + Send + 'static {
        |result, _item, out| out.push(result)
    }

    #[test]
    fn test_build_without_iterator_fails() {
        let result = IterationStage::<i32, i32, i32>::builder()
            .handler(emit_result())
            .build();
        assert!(matches!(result, Err(StageError::InvalidArgument(_))));
    }

    #[test]
    fn test_build_without_handler_fails() {
        let result = IterationStage::<i32, i32, i32>::builder()
            .iterator(IterFn::infallible(|x: &i32| *x))
            .build();
        assert!(matches!(result, Err(StageError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_sync_iterator_reaches_handler() {
        let mut stage = IterationStage::builder()
            .id("plus_one")
            .iterator(IterFn::infallible(|x: &i32| x + 1))
            .handler(emit_result())
            .build()
            .unwrap();
        assert!(!stage.is_async());

        let mut out = Emitter::new();
        stage.process(1, &mut out).await.unwrap();
        stage.process(2, &mut out).await.unwrap();
        assert_eq!(out.drain().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(stage.handled(), 2);
    }

    #[tokio::test]
    async fn test_async_iterator_reaches_handler() {
        let mut stage = IterationStage::builder()
            .iterator(IterFn::asynchronous(|x: &i32| {
                let x = *x;
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Ok(x * 3)
                }
            }))
            .handler(emit_result())
            .build()
            .unwrap();
        assert!(stage.is_async());

        let mut out = Emitter::new();
        stage.process(4, &mut out).await.unwrap();
        assert_eq!(out.drain().collect::<Vec<_>>(), vec![12]);
    }

    #[tokio::test]
    async fn test_iterator_error_skips_handler() {
        let mut stage = IterationStage::builder()
            .id("strict")
            .iterator(IterFn::sync(|x: &i32| {
                if *x < 0 {
                    anyhow::bail!("negative input {x}");
                }
                Ok(*x)
            }))
            .handler(emit_result())
            .build()
            .unwrap();

        let mut out = Emitter::new();
        let err = stage.process(-1, &mut out).await.unwrap_err();
        assert!(matches!(err, StageError::Processing { ref stage, .. } if stage == "strict"));
        assert!(out.is_empty());
        assert_eq!(stage.handled(), 0);
    }
}

//! Core stage trait and types

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::marker::PhantomData;

use crate::error::StageError;

/// The trait every pipeline stage implements.
///
/// A stage receives items one at a time. Each call to `process` must fully
/// resolve before the next item is delivered; anything pushed to `out` is
/// forwarded downstream (with backpressure) before that happens. `flush` runs
/// once after the upstream signals end-of-stream, and is skipped when the chain
/// was aborted by a failure.
#[async_trait]
pub trait Stage<I: Send + 'static, O: Send + 'static>: Send {
    /// Name used in logs and errors.
    fn id(&self) -> &str;

    async fn process(&mut self, item: I, out: &mut Emitter<O>) -> Result<(), StageError>;

    async fn flush(&mut self, _out: &mut Emitter<O>) -> Result<(), StageError> {
        Ok(())
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Stage<I, O> for Box<dyn Stage<I, O>> {
    fn id(&self) -> &str {
        (**self).id()
    }

    async fn process(&mut self, item: I, out: &mut Emitter<O>) -> Result<(), StageError> {
        (**self).process(item, out).await
    }

    async fn flush(&mut self, out: &mut Emitter<O>) -> Result<(), StageError> {
        (**self).flush(out).await
    }
}

/// Collects the items a stage emits for the current input.
#[derive(Debug)]
pub struct Emitter<O> {
    buffer: Vec<O>,
}

impl<O> Emitter<O> {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, item: O) {
        self.buffer.push(item);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, O> {
        self.buffer.drain(..)
    }
}

impl<O> Default for Emitter<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Extend<O> for Emitter<O> {
    fn extend<It: IntoIterator<Item = O>>(&mut self, iter: It) {
        self.buffer.extend(iter);
    }
}

/// The base stage: emits every item unchanged.
pub struct Passthrough<T> {
    id: String,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Passthrough<T> {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Passthrough<T> {
    fn default() -> Self {
        Self::new("passthrough")
    }
}

#[async_trait]
impl<T: Send + 'static> Stage<T, T> for Passthrough<T> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&mut self, item: T, out: &mut Emitter<T>) -> Result<(), StageError> {
        out.push(item);
        Ok(())
    }
}

/// The outcome of starting a sync or async per-item call.
///
/// Starting the call only borrows the item; the pending future owns whatever
/// it needs, so the item itself never has to be `Sync`.
pub(crate) enum Step<R> {
    Ready(anyhow::Result<R>),
    Pending(BoxFuture<'static, anyhow::Result<R>>),
}

impl<R> Step<R> {
    pub(crate) async fn resolve(self) -> anyhow::Result<R> {
        match self {
            Step::Ready(result) => result,
            Step::Pending(future) => future.await,
        }
    }
}

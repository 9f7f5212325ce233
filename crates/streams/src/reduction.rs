//! The accumulating reduction stage.
//!
//! A `ReductionStage` folds every item into an accumulator. It runs in one of
//! two modes, chosen by type:
//!
//! - [`Terminal`]: nothing is emitted per item; the final accumulator is
//!   emitted once at end-of-stream.
//! - [`Report`]: every item passes through unchanged and a callback receives
//!   the final accumulator once at end-of-stream.
//!
//! The current accumulator can be read at any time through a [`Progress`]
//! handle, e.g. to log running totals of a long stream every second.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::StageError;
use crate::stage::{Emitter, Stage, Step};

type SyncReduce<T, A> = Box<dyn FnMut(Option<A>, &T) -> anyhow::Result<A> + Send>;
type AsyncReduce<T, A> =
    Box<dyn FnMut(Option<A>, &T) -> BoxFuture<'static, anyhow::Result<A>> + Send>;

/// The reducer of a [`ReductionStage`].
///
/// The accumulator argument is `None` on the first call when no initial value
/// was given. Async reducers resolve one item at a time here, but their
/// contract does not promise input order, so async folds should be
/// order-insensitive.
pub enum ReduceFn<T, A> {
    Sync(SyncReduce<T, A>),
    Async(AsyncReduce<T, A>),
}

impl<T, A> ReduceFn<T, A> {
    /// A fallible synchronous reducer that handles the absent accumulator itself.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnMut(Option<A>, &T) -> anyhow::Result<A> + Send + 'static,
    {
        ReduceFn::Sync(Box::new(f))
    }

    /// A synchronous fold over an accumulator that is always present.
    ///
    /// Pair it with an initial value; without one the first item fails.
    pub fn fold<F>(mut f: F) -> Self
    where
        T: 'static,
        A: 'static,
        F: FnMut(A, &T) -> A + Send + 'static,
    {
        ReduceFn::Sync(Box::new(move |acc: Option<A>, item: &T| match acc {
            Some(acc) => Ok(f(acc, item)),
            None => Err(anyhow::anyhow!("fold requires an initial value")),
        }))
    }

    pub fn asynchronous<F, Fut>(mut f: F) -> Self
    where
        T: 'static,
        A: 'static,
        F: FnMut(Option<A>, &T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        ReduceFn::Async(Box::new(move |acc: Option<A>, item: &T| f(acc, item).boxed()))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, ReduceFn::Async(_))
    }

    fn start(&mut self, acc: Option<A>, item: &T) -> Step<A> {
        match self {
            ReduceFn::Sync(f) => Step::Ready(f(acc, item)),
            ReduceFn::Async(f) => Step::Pending(f(acc, item)),
        }
    }
}

/// Emit the final accumulator at end-of-stream.
#[derive(Debug, Default)]
pub struct Terminal;

/// Pass items through and hand the final accumulator to a callback.
pub struct Report<A> {
    callback: Option<Box<dyn FnOnce(Option<A>) + Send>>,
}

impl<A> Report<A> {
    pub(crate) fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Option<A>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }
}

/// Read-only view of a reduction's current accumulator.
#[derive(Clone)]
pub struct Progress<A> {
    rx: watch::Receiver<Option<A>>,
}

impl<A: Clone> Progress<A> {
    /// Latest published accumulator. Possibly stale, never torn.
    pub fn current(&self) -> Option<A> {
        self.rx.borrow().clone()
    }

    /// True once the stage has finished or been dropped.
    pub fn is_finished(&self) -> bool {
        self.rx.has_changed().is_err()
    }

    /// Wait for the next update; false when the stage is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl<A> Progress<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Spawn a task that hands a snapshot to `report` every `period`, and a
    /// last one after the stage finishes.
    pub fn report_every<F>(&self, period: Duration, mut report: F) -> JoinHandle<()>
    where
        F: FnMut(Option<A>) + Send + 'static,
    {
        let mut rx = self.rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let finished = rx.has_changed().is_err();
                let snapshot = rx.borrow_and_update().clone();
                report(snapshot);
                if finished {
                    break;
                }
            }
        })
    }
}

/// A stage that folds items into an accumulator.
pub struct ReductionStage<T, A, M = Terminal> {
    id: String,
    reducer: ReduceFn<T, A>,
    value: Option<A>,
    progress: watch::Sender<Option<A>>,
    mode: M,
    folded: u64,
}

impl<T, A> ReductionStage<T, A, Terminal> {
    pub fn builder() -> ReductionStageBuilder<T, A, Terminal> {
        ReductionStageBuilder {
            id: None,
            reducer: None,
            initial: None,
            mode: Terminal,
        }
    }
}

impl<T, A, M> ReductionStage<T, A, M>
where
    A: Clone,
{
    pub(crate) fn from_parts(id: &str, reducer: ReduceFn<T, A>, initial: Option<A>, mode: M) -> Self {
        let (progress, _) = watch::channel(initial.clone());
        Self {
            id: id.to_string(),
            reducer,
            value: initial,
            progress,
            mode,
            folded: 0,
        }
    }

    /// Current accumulator, read directly from the stage.
    pub fn value(&self) -> Option<&A> {
        self.value.as_ref()
    }

    /// A handle that keeps reporting the accumulator after the stage has been
    /// moved into a chain.
    pub fn progress(&self) -> Progress<A> {
        Progress {
            rx: self.progress.subscribe(),
        }
    }

    pub fn folded(&self) -> u64 {
        self.folded
    }

    fn begin(&mut self, item: &T) -> Step<A> {
        self.reducer.start(self.value.take(), item)
    }

    fn commit(&mut self, result: anyhow::Result<A>) -> Result<(), StageError> {
        let next = result.map_err(|source| StageError::processing(&self.id, source))?;
        self.value = Some(next);
        self.progress.send_replace(self.value.clone());
        self.folded += 1;
        Ok(())
    }
}

#[async_trait]
impl<T, A> Stage<T, A> for ReductionStage<T, A, Terminal>
where
    T: Send + 'static,
    A: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&mut self, item: T, _out: &mut Emitter<A>) -> Result<(), StageError> {
        let step = self.begin(&item);
        let result = step.resolve().await;
        self.commit(result)
    }

    async fn flush(&mut self, out: &mut Emitter<A>) -> Result<(), StageError> {
        if let Some(value) = self.value.take() {
            out.push(value);
        }
        Ok(())
    }
}

#[async_trait]
impl<T, A> Stage<T, T> for ReductionStage<T, A, Report<A>>
where
    T: Send + 'static,
    A: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&mut self, item: T, out: &mut Emitter<T>) -> Result<(), StageError> {
        let step = self.begin(&item);
        let result = step.resolve().await;
        self.commit(result)?;
        out.push(item);
        Ok(())
    }

    async fn flush(&mut self, _out: &mut Emitter<T>) -> Result<(), StageError> {
        if let Some(callback) = self.mode.callback.take() {
            callback(self.value.take());
        }
        Ok(())
    }
}

/// Builder for a custom [`ReductionStage`].
pub struct ReductionStageBuilder<T, A, M> {
    id: Option<String>,
    reducer: Option<ReduceFn<T, A>>,
    initial: Option<A>,
    mode: M,
}

impl<T, A> ReductionStageBuilder<T, A, Terminal> {
    /// Switch to passthrough mode: items flow on and `callback` gets the final value.
    pub fn callback<F>(self, callback: F) -> ReductionStageBuilder<T, A, Report<A>>
    where
        F: FnOnce(Option<A>) + Send + 'static,
    {
        ReductionStageBuilder {
            id: self.id,
            reducer: self.reducer,
            initial: self.initial,
            mode: Report::new(callback),
        }
    }
}

impl<T, A, M> ReductionStageBuilder<T, A, M>
where
    A: Clone,
{
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn reducer(mut self, reducer: ReduceFn<T, A>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn initial(mut self, initial: A) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn build(self) -> Result<ReductionStage<T, A, M>, StageError> {
        let reducer = self
            .reducer
            .ok_or_else(|| StageError::InvalidArgument("reducer function required".to_string()))?;
        let id = self.id.unwrap_or_else(|| "reduce".to_string());
        Ok(ReductionStage::from_parts(&id, reducer, self.initial, self.mode))
    }
}

//! Chain construction and execution.
//!
//! Every connected stage runs as its own tokio task. Stages are joined by
//! bounded `flume` channels, so a slow stage holds back its upstream once the
//! buffer between them is full. A failing stage records its error in the
//! shared chain state and cancels the chain; the other stages stop without
//! flushing, so no terminal value is produced after a failure. The error is
//! reported to the consumers downstream of the failing stage; other branches
//! that were cut short report `Aborted`.
//!
//! `connect` and the producer constructors spawn tasks and must be called from
//! within a tokio runtime.

use futures::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::future::Future;
use std::ops::Add;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};
use uuid::Uuid;

use crate::config::{PipelineConfig, StageConfig};
use crate::error::{PipelineError, PipelineResult, StageError};
use crate::iteration::IterFn;
use crate::reduction::{ReduceFn, ReductionStage, Report, Terminal};
use crate::registry::StageRegistry;
use crate::stage::{Emitter, Stage};
use crate::stages::{self, IntoSequence, Stats, Truthy};

/// The first failure of a chain and the stage it came from.
struct Failure {
    stage: u64,
    error: StageError,
}

/// State shared by every stage and branch of one chain.
pub(crate) struct ChainState {
    id: Uuid,
    cancel: CancellationToken,
    next_stage: AtomicU64,
    failure: Mutex<Option<Failure>>,
}

impl ChainState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            next_stage: AtomicU64::new(0),
            failure: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    fn next_stage(&self) -> u64 {
        self.next_stage.fetch_add(1, Ordering::Relaxed)
    }

    /// Record the first failure and abort the chain.
    fn fail(&self, stage: u64, error: StageError) {
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(Failure { stage, error });
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn aborted(&self) {
        self.cancel.cancelled().await
    }

    /// How the chain ended as seen from `branch`.
    ///
    /// Branches downstream of the failing stage get the stage error, other
    /// branches cut short get `Aborted`, and a branch whose stream had
    /// already ended cleanly gets `None`.
    fn outcome(&self, branch: &Branch) -> Option<PipelineError> {
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(failure) = slot.as_mut() {
            if branch.descends_from(failure.stage) {
                let copy = failure.error.duplicate();
                return Some(PipelineError::Stage(std::mem::replace(&mut failure.error, copy)));
            }
        }
        drop(slot);

        if self.is_aborted() && !branch.is_completed() {
            Some(PipelineError::Aborted)
        } else {
            None
        }
    }
}

struct Lineage {
    stage: u64,
    parent: Option<Arc<Lineage>>,
}

/// Where a pipeline handle sits in its chain and whether its stream ended cleanly.
pub(crate) struct Branch {
    lineage: Option<Arc<Lineage>>,
    completed: AtomicBool,
}

impl Branch {
    fn root() -> Arc<Self> {
        Self::with_lineage(None)
    }

    fn with_lineage(lineage: Option<Arc<Lineage>>) -> Arc<Self> {
        Arc::new(Self {
            lineage,
            completed: AtomicBool::new(false),
        })
    }

    /// The output branch of `stage`, connected below this one.
    fn after(&self, stage: u64) -> Arc<Self> {
        Self::with_lineage(Some(Arc::new(Lineage {
            stage,
            parent: self.lineage.clone(),
        })))
    }

    /// A branch fed by the same stages, e.g. one output of a split.
    pub(crate) fn sibling(&self) -> Arc<Self> {
        Self::with_lineage(self.lineage.clone())
    }

    /// Mark the stream as fully delivered. Call before closing the channel.
    pub(crate) fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn descends_from(&self, stage: u64) -> bool {
        let mut node = self.lineage.as_deref();
        while let Some(lineage) = node {
            if lineage.stage == stage {
                return true;
            }
            node = lineage.parent.as_deref();
        }
        false
    }
}

/// Producer handle for a chain created with [`Pipeline::source`].
///
/// Dropping every `Source` clone signals end-of-stream.
#[derive(Clone)]
pub struct Source<T> {
    tx: flume::Sender<T>,
    state: Arc<ChainState>,
}

impl<T: Send + 'static> Source<T> {
    /// Send an item, waiting while the first stage's buffer is full.
    pub async fn send(&self, item: T) -> Result<(), StageError> {
        if self.state.is_aborted() {
            return Err(StageError::QueueClosed);
        }
        self.tx
            .send_async(item)
            .await
            .map_err(|_| StageError::QueueClosed)
    }

    /// Blocking variant for producers running on plain threads.
    pub fn send_blocking(&self, item: T) -> Result<(), StageError> {
        if self.state.is_aborted() {
            return Err(StageError::QueueClosed);
        }
        self.tx.send(item).map_err(|_| StageError::QueueClosed)
    }

    /// Signal end-of-stream for this handle.
    pub fn close(self) {}
}

/// A handle to the output end of a chain.
///
/// Stages are added with [`Pipeline::connect`] or the fluent helpers; the chain
/// is drained with one of the consumers (`collect`, `for_each`, `run`, `recv`).
pub struct Pipeline<T> {
    rx: flume::Receiver<T>,
    state: Arc<ChainState>,
    branch: Arc<Branch>,
    config: PipelineConfig,
}

impl<T: Send + 'static> Pipeline<T> {
    /// A chain fed by hand through the returned [`Source`].
    pub fn source(config: PipelineConfig) -> (Source<T>, Pipeline<T>) {
        let state = ChainState::new();
        let (tx, rx) = flume::bounded(config.buffer_capacity.max(1));
        let source = Source {
            tx,
            state: state.clone(),
        };
        let pipeline = Pipeline {
            rx,
            state,
            branch: Branch::root(),
            config,
        };
        (source, pipeline)
    }

    /// A chain fed from an iterator by a producer task.
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(futures::stream::iter(items), PipelineConfig::default())
    }

    /// A chain fed from any stream, e.g. a storage scan adapter.
    pub fn from_stream<S>(stream: S, config: PipelineConfig) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let (source, pipeline) = Self::source(config);
        let state = pipeline.state.clone();
        let branch = pipeline.branch.clone();
        let span = info_span!("producer", chain = %state.id());
        tokio::spawn(
            async move {
                let mut stream = std::pin::pin!(stream);
                let mut produced = 0u64;
                let exhausted = loop {
                    let item = tokio::select! {
                        biased;
                        _ = state.aborted() => break false,
                        item = stream.next() => item,
                    };
                    let Some(item) = item else { break true };
                    if source.send(item).await.is_err() {
                        debug!("Downstream closed, producer stopping");
                        break false;
                    }
                    produced += 1;
                };
                if exhausted && !state.is_aborted() {
                    branch.complete();
                }
                info!(items = produced, "Producer finished");
            }
            .instrument(span),
        );
        pipeline
    }

    pub fn id(&self) -> Uuid {
        self.state.id()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Connect `stage` as the next stage and return the handle to its output.
    pub fn connect<O, S>(self, stage: S) -> Pipeline<O>
    where
        O: Send + 'static,
        S: Stage<T, O> + 'static,
    {
        let (tx, rx) = flume::bounded(self.config.buffer_capacity.max(1));
        let state = self.state.clone();
        let upstream = self.rx;
        let stage_id = stage.id().to_string();
        let node = state.next_stage();
        let branch = self.branch.after(node);
        let span = info_span!("stage", chain = %state.id(), stage = %stage_id);

        let task_state = state.clone();
        let task_branch = branch.clone();
        tokio::spawn(
            async move {
                info!("Stage started");
                match drive(stage, &stage_id, &upstream, &tx, &task_state).await {
                    Ok(Exit::Finished(received)) => {
                        task_branch.complete();
                        info!(items = received, "Stage finished");
                    }
                    Ok(Exit::Aborted(received)) => info!(items = received, "Stage aborted"),
                    Ok(Exit::Detached(received)) => info!(items = received, "Stage detached"),
                    Err(e) => {
                        error!(error = %e, "Stage failed");
                        task_state.fail(node, e);
                    }
                }
                // The channels close only after a failure has been recorded.
                drop(tx);
                drop(upstream);
            }
            .instrument(span),
        );

        Pipeline {
            rx,
            state,
            branch,
            config: self.config,
        }
    }

    /// Replace the settings used by stages and splits connected from here on.
    ///
    /// The buffer feeding this handle keeps the capacity it was created with.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a registered stage from `config` and connect it.
    pub fn apply<O>(
        self,
        registry: &StageRegistry<T, O>,
        config: &StageConfig,
    ) -> Result<Pipeline<O>, StageError>
    where
        O: Send + 'static,
    {
        let stage = registry.create_stage(config)?;
        Ok(self.connect(stage))
    }

    /// Next emitted item, or `None` once the chain has ended or failed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Outcome of a chain drained with `recv`.
    pub fn finish(self) -> PipelineResult<()> {
        match self.state.outcome(&self.branch) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drain the chain into a vector.
    pub async fn collect(mut self) -> PipelineResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        self.finish()?;
        Ok(items)
    }

    pub async fn for_each<F>(mut self, mut f: F) -> PipelineResult<()>
    where
        F: FnMut(T),
    {
        while let Some(item) = self.recv().await {
            f(item);
        }
        self.finish()
    }

    /// Drain and discard, e.g. for chains ending in a reporting reduction.
    pub async fn run(self) -> PipelineResult<()> {
        self.for_each(drop).await
    }

    // --- Fluent stage helpers ---

    pub fn map<R, F>(self, f: F) -> Pipeline<R>
    where
        R: Send + 'static,
        F: FnMut(&T) -> R + Send + 'static,
    {
        self.connect(stages::map(IterFn::infallible(f)))
    }

    pub fn map_with<R: Send + 'static>(self, iterator: IterFn<T, R>) -> Pipeline<R> {
        self.connect(stages::map(iterator))
    }

    pub fn multimap<R, F>(self, f: F) -> Pipeline<R::Item>
    where
        R: IntoSequence + Send + 'static,
        R::Item: Send + 'static,
        F: FnMut(&T) -> R + Send + 'static,
    {
        self.connect(stages::multimap(IterFn::infallible(f)))
    }

    pub fn multimap_with<R>(self, iterator: IterFn<T, R>) -> Pipeline<R::Item>
    where
        R: IntoSequence + Send + 'static,
        R::Item: Send + 'static,
    {
        self.connect(stages::multimap(iterator))
    }

    pub fn filter<R, F>(self, f: F) -> Pipeline<T>
    where
        R: Truthy + Send + 'static,
        F: FnMut(&T) -> R + Send + 'static,
    {
        self.connect(stages::filter(IterFn::infallible(f)))
    }

    pub fn filter_with<R: Truthy + Send + 'static>(self, iterator: IterFn<T, R>) -> Pipeline<T> {
        self.connect(stages::filter(iterator))
    }

    pub fn each<R, F>(self, f: F) -> Pipeline<T>
    where
        R: Send + 'static,
        F: FnMut(&T) -> R + Send + 'static,
    {
        self.connect(stages::each(IterFn::infallible(f)))
    }

    pub fn each_with<R: Send + 'static>(self, iterator: IterFn<T, R>) -> Pipeline<T> {
        self.connect(stages::each(iterator))
    }

    pub fn count(self) -> Pipeline<u64> {
        self.connect(stages::count::<T>())
    }

    pub fn count_with<F>(self, callback: F) -> Pipeline<T>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.connect(stages::count_with::<T, F>(callback))
    }

    /// Generic fold from an explicit initial value.
    pub fn fold<A, F>(self, initial: A, f: F) -> Pipeline<A>
    where
        A: Clone + Send + Sync + 'static,
        F: FnMut(A, &T) -> A + Send + 'static,
    {
        self.connect(ReductionStage::<T, A, Terminal>::from_parts(
            "fold",
            ReduceFn::fold(f),
            Some(initial),
            Terminal,
        ))
    }

    /// Terminal reduction with an arbitrary reducer and optional initial value.
    pub fn reduce<A>(self, reducer: ReduceFn<T, A>, initial: Option<A>) -> Pipeline<A>
    where
        A: Clone + Send + Sync + 'static,
    {
        self.connect(ReductionStage::<T, A, Terminal>::from_parts(
            "reduce", reducer, initial, Terminal,
        ))
    }

    /// Connect a reporting reduction built elsewhere, e.g. to keep its `progress()`.
    pub fn tap<A>(self, stage: ReductionStage<T, A, Report<A>>) -> Pipeline<T>
    where
        A: Clone + Send + Sync + 'static,
    {
        self.connect(stage)
    }
}

impl<T> Pipeline<T>
where
    T: Add<Output = T> + Default + Clone + Send + Sync + 'static,
{
    /// See [`stages::sum`] for overflow behaviour.
    pub fn sum(self) -> Pipeline<T> {
        self.connect(stages::sum::<T>())
    }

    pub fn sum_with<F>(self, callback: F) -> Pipeline<T>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.connect(stages::sum_with::<T, F>(callback))
    }
}

impl<T> Pipeline<T>
where
    T: Copy + Into<f64> + Send + 'static,
{
    pub fn stats(self) -> Pipeline<Stats> {
        self.connect(stages::stats::<T>())
    }

    pub fn stats_with<F>(self, callback: F) -> Pipeline<T>
    where
        F: FnOnce(Stats) + Send + 'static,
    {
        self.connect(stages::stats_with::<T, F>(callback))
    }
}

impl<T> Pipeline<T> {
    pub(crate) fn from_parts(
        rx: flume::Receiver<T>,
        state: Arc<ChainState>,
        branch: Arc<Branch>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            rx,
            state,
            branch,
            config,
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (flume::Receiver<T>, Arc<ChainState>, Arc<Branch>, PipelineConfig) {
        (self.rx, self.state, self.branch, self.config)
    }
}

/// How a stage loop ended, with the number of items it received.
enum Exit {
    /// Upstream closed and everything, flushed output included, was delivered.
    Finished(u64),
    /// The chain failed elsewhere.
    Aborted(u64),
    /// The consumer went away.
    Detached(u64),
}

/// The per-stage loop.
async fn drive<I, O, S>(
    mut stage: S,
    stage_id: &str,
    upstream: &flume::Receiver<I>,
    downstream: &flume::Sender<O>,
    state: &ChainState,
) -> Result<Exit, StageError>
where
    I: Send + 'static,
    O: Send + 'static,
    S: Stage<I, O>,
{
    let mut out = Emitter::new();
    let mut received = 0u64;

    loop {
        let item = tokio::select! {
            biased;
            _ = state.aborted() => return Ok(Exit::Aborted(received)),
            item = upstream.recv_async() => item,
        };
        let Ok(item) = item else { break };
        received += 1;
        trace!(item = received, "Processing item");

        guarded(stage_id, stage.process(item, &mut out)).await?;
        if !forward(&mut out, downstream).await {
            debug!("Downstream closed, stage stopping");
            return Ok(Exit::Detached(received));
        }
    }

    if state.is_aborted() {
        return Ok(Exit::Aborted(received));
    }
    guarded(stage_id, stage.flush(&mut out)).await?;
    if !forward(&mut out, downstream).await {
        return Ok(Exit::Detached(received));
    }
    Ok(Exit::Finished(received))
}

/// Send everything emitted so far; false when the receiver is gone.
async fn forward<O>(out: &mut Emitter<O>, downstream: &flume::Sender<O>) -> bool {
    for item in out.drain() {
        if downstream.send_async(item).await.is_err() {
            return false;
        }
    }
    true
}

/// Turn a panic inside a stage into a processing error.
async fn guarded<F>(stage_id: &str, fut: F) -> Result<(), StageError>
where
    F: Future<Output = Result<(), StageError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(StageError::processing(
            stage_id,
            anyhow::anyhow!("panicked: {}", panic_message(&*panic)),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_source_feeds_chain() {
        let (source, pipeline) = Pipeline::source(PipelineConfig::default());
        let doubled = pipeline.map(|x: &i32| x * 2);

        tokio::spawn(async move {
            for x in 1..=3 {
                source.send(x).await.unwrap();
            }
        });

        assert_eq!(doubled.collect().await.unwrap(), vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_recv_and_finish() {
        let mut pipeline = Pipeline::from_iter(vec!["a", "b"]).connect(crate::stage::Passthrough::default());
        assert_eq!(pipeline.recv().await, Some("a"));
        assert_eq!(pipeline.recv().await, Some("b"));
        assert_eq!(pipeline.recv().await, None);
        assert!(pipeline.finish().is_ok());
    }

    #[tokio::test]
    async fn test_from_stream_respects_config() {
        let config = PipelineConfig {
            buffer_capacity: 2,
            ..Default::default()
        };
        let pipeline = Pipeline::from_stream(futures::stream::iter(0..5), config);
        assert_eq!(pipeline.config().buffer_capacity, 2);
        assert_eq!(pipeline.count().collect().await.unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_chain() {
        let result = Pipeline::from_iter(vec![1, 2, 3])
            .map(|x: &i32| {
                if *x == 2 {
                    panic!("cannot handle two");
                }
                *x
            })
            .collect()
            .await;

        match result {
            Err(PipelineError::Stage(StageError::Processing { source, .. })) => {
                assert!(source.to_string().contains("cannot handle two"));
            }
            other => panic!("expected processing error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropping_consumer_stops_producer() {
        let (source, pipeline) = Pipeline::<u32>::source(PipelineConfig::default());
        drop(pipeline.map(|x: &u32| *x));
        tokio::task::yield_now().await;
        // The stage task may still hold the receiver briefly; keep sending until it closes.
        let mut closed = false;
        for x in 0..1_000 {
            if source.send(x).await.is_err() {
                closed = true;
                break;
            }
        }
        assert!(closed);
    }

    #[test]
    fn test_failure_reported_by_lineage() {
        let state = ChainState::new();
        let root = Branch::root();
        let failing_stage = state.next_stage();
        let failing = root.after(failing_stage);
        let downstream = failing.after(state.next_stage());
        let cut_short = root.after(state.next_stage());
        let drained = root.sibling();
        drained.complete();

        assert!(state.outcome(&failing).is_none());
        state.fail(failing_stage, StageError::InvalidArgument("first".into()));
        state.fail(failing_stage, StageError::InvalidArgument("second".into()));
        assert!(state.is_aborted());

        for branch in [&failing, &downstream] {
            match state.outcome(branch) {
                Some(PipelineError::Stage(StageError::InvalidArgument(msg))) => assert_eq!(msg, "first"),
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert!(matches!(state.outcome(&cut_short), Some(PipelineError::Aborted)));
        assert!(state.outcome(&drained).is_none());
    }

    #[tokio::test]
    async fn test_with_config_applies_to_later_stages() {
        let config = PipelineConfig {
            buffer_capacity: 1,
            split_mode: crate::split::SplitMode::BufferAll,
        };
        let pipeline = Pipeline::from_iter(0..3).with_config(config).map(|x: &i32| x + 1);
        assert_eq!(pipeline.config(), &config);
        assert_eq!(pipeline.collect().await.unwrap(), vec![1, 2, 3]);
    }
}

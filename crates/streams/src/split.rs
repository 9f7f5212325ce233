//! Fan-out of one chain into independent branches.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, Instrument};

use crate::pipeline::Pipeline;

/// How branch backpressure couples back to the shared upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Bounded branch buffers: the slowest branch paces the upstream.
    #[default]
    BlockSlowest,
    /// Unbounded branch buffers: no branch ever waits for another.
    BufferAll,
}

impl<T: Clone + Send + 'static> Pipeline<T> {
    /// Broadcast every item to `n` branches and hand them to `combinator`,
    /// using the chain's configured [`SplitMode`].
    pub fn split<R, F>(self, n: usize, combinator: F) -> R
    where
        F: FnOnce(Vec<Pipeline<T>>) -> R,
    {
        let mode = self.config().split_mode;
        self.split_with(n, mode, combinator)
    }

    /// Like [`Pipeline::split`] with an explicit backpressure mode.
    ///
    /// A branch that is dropped without being drained is detached; the others
    /// keep receiving every item. With zero branches the upstream is released.
    pub fn split_with<R, F>(self, n: usize, mode: SplitMode, combinator: F) -> R
    where
        F: FnOnce(Vec<Pipeline<T>>) -> R,
    {
        let (upstream, state, branch, config) = self.into_parts();
        let capacity = config.buffer_capacity.max(1);

        let mut outputs = Vec::with_capacity(n);
        let mut senders = Vec::with_capacity(n);
        let mut branches = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = match mode {
                SplitMode::BlockSlowest => flume::bounded(capacity),
                SplitMode::BufferAll => flume::unbounded(),
            };
            let output = branch.sibling();
            senders.push(Some(tx));
            branches.push(Pipeline::from_parts(rx, state.clone(), output.clone(), config));
            outputs.push(output);
        }

        let span = info_span!("split", chain = %state.id(), branches = n, ?mode);
        tokio::spawn(
            async move {
                let mut senders = senders;
                let mut broadcast = 0u64;
                let mut exhausted = false;
                while senders.iter().any(Option::is_some) {
                    let item = tokio::select! {
                        biased;
                        _ = state.aborted() => break,
                        item = upstream.recv_async() => item,
                    };
                    let Ok(item) = item else {
                        exhausted = true;
                        break;
                    };

                    for (index, slot) in senders.iter_mut().enumerate() {
                        let Some(tx) = slot.as_ref() else { continue };
                        if tx.send_async(item.clone()).await.is_err() {
                            debug!(branch = index, "Branch closed, detaching");
                            *slot = None;
                        }
                    }
                    broadcast += 1;
                }
                if exhausted && !state.is_aborted() {
                    outputs.iter().for_each(|output| output.complete());
                }
                info!(items = broadcast, "Split finished");
            }
            .instrument(span),
        );

        combinator(branches)
    }
}

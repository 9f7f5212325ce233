//! Built-in reducers: count, sum and running statistics.

use serde::{Deserialize, Serialize};
use std::ops::Add;

use crate::reduction::{ReduceFn, ReductionStage, Report, Terminal};

/// Running statistics over a numeric stream.
///
/// `sum_of_square_roots` accumulates `sqrt(value)` for every item, so negative
/// values contribute NaN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum_of_square_roots: f64,
}

impl Stats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_of_square_roots += value.sqrt();
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Counts items; emits the total at end-of-stream.
pub fn count<T: 'static>() -> ReductionStage<T, u64, Terminal> {
    ReductionStage::from_parts("count", count_reducer(), Some(0), Terminal)
}

/// Counts items while passing them on; `callback` gets the total.
pub fn count_with<T, F>(callback: F) -> ReductionStage<T, u64, Report<u64>>
where
    T: 'static,
    F: FnOnce(u64) + Send + 'static,
{
    let report = Report::new(move |total: Option<u64>| callback(total.unwrap_or(0)));
    ReductionStage::from_parts("count", count_reducer(), Some(0), report)
}

/// Sums items from the additive zero (`Default`); emits the total at end-of-stream.
///
/// Addition is `T`'s own `Add`. For primitive integers an overflow panics in
/// debug builds, which fails the chain, and wraps in release builds; sum into
/// a wider type (`i128`, `f64`) or use a checked fold when that matters.
pub fn sum<T>() -> ReductionStage<T, T, Terminal>
where
    T: Add<Output = T> + Default + Clone + 'static,
{
    ReductionStage::from_parts("sum", sum_reducer(), Some(T::default()), Terminal)
}

/// Like [`sum`] but passes items on; `callback` gets the total.
pub fn sum_with<T, F>(callback: F) -> ReductionStage<T, T, Report<T>>
where
    T: Add<Output = T> + Default + Clone + 'static,
    F: FnOnce(T) + Send + 'static,
{
    let report = Report::new(move |total: Option<T>| callback(total.unwrap_or_default()));
    ReductionStage::from_parts("sum", sum_reducer(), Some(T::default()), report)
}

/// Running [`Stats`]; emits the final record at end-of-stream.
pub fn stats<T>() -> ReductionStage<T, Stats, Terminal>
where
    T: Copy + Into<f64> + 'static,
{
    ReductionStage::from_parts("stats", stats_reducer(), Some(Stats::default()), Terminal)
}

pub fn stats_with<T, F>(callback: F) -> ReductionStage<T, Stats, Report<Stats>>
where
    T: Copy + Into<f64> + 'static,
    F: FnOnce(Stats) + Send + 'static,
{
    let report = Report::new(move |stats: Option<Stats>| callback(stats.unwrap_or_default()));
    ReductionStage::from_parts("stats", stats_reducer(), Some(Stats::default()), report)
}

fn count_reducer<T: 'static>() -> ReduceFn<T, u64> {
    ReduceFn::fold(|total: u64, _item: &T| total + 1)
}

fn sum_reducer<T>() -> ReduceFn<T, T>
where
    T: Add<Output = T> + Clone + 'static,
{
    ReduceFn::fold(|total: T, item: &T| total + item.clone())
}

fn stats_reducer<T>() -> ReduceFn<T, Stats>
where
    T: Copy + Into<f64> + 'static,
{
    ReduceFn::fold(|mut stats: Stats, item: &T| {
        stats.push((*item).into());
        stats
    })
}

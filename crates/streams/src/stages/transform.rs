//! Handler policies for the iteration stage: map, multimap, filter and each.

use serde_json::Value;

use crate::iteration::{IterFn, IterationStage};
use crate::stage::Emitter;

/// Truthiness of an iterator result, as used by `filter`.
pub trait Truthy {
    fn is_truthy(&self) -> bool;
}

impl Truthy for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

impl<T> Truthy for Option<T> {
    fn is_truthy(&self) -> bool {
        self.is_some()
    }
}

impl Truthy for String {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for &str {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

/// Dynamic-value truthiness: null, false, 0, NaN and "" are falsy; arrays
/// and objects are truthy even when empty.
impl Truthy for Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl_truthy_numeric! {
    int: i8, i16, i32, i64, isize, u8, u16, u32, u64, usize;
    float: f32, f64;
}

/// An iterator result that may or may not be a sequence, as used by `multimap`.
pub trait IntoSequence {
    type Item;

    /// The elements to emit, or `None` when the value is not a sequence.
    fn into_sequence(self) -> Option<Vec<Self::Item>>;
}

impl<T> IntoSequence for Vec<T> {
    type Item = T;

    fn into_sequence(self) -> Option<Vec<T>> {
        Some(self)
    }
}

impl<T> IntoSequence for Option<Vec<T>> {
    type Item = T;

    fn into_sequence(self) -> Option<Vec<T>> {
        self
    }
}

impl IntoSequence for Value {
    type Item = Value;

    fn into_sequence(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Emit the iterator's result in place of the item.
pub fn map<T: 'static, R: 'static>(iterator: IterFn<T, R>) -> IterationStage<T, R, R> {
    IterationStage::from_parts(
        "map",
        iterator,
        Box::new(|result: R, _item: T, out: &mut Emitter<R>| out.push(result)),
    )
}

/// Emit every element of a sequence result in order; nothing otherwise.
pub fn multimap<T, R>(iterator: IterFn<T, R>) -> IterationStage<T, R, R::Item>
where
    T: 'static,
    R: IntoSequence + 'static,
    R::Item: 'static,
{
    IterationStage::from_parts(
        "multimap",
        iterator,
        Box::new(|result: R, _item: T, out: &mut Emitter<R::Item>| {
            if let Some(items) = result.into_sequence() {
                out.extend(items);
            }
        }),
    )
}

/// Emit the original item when the result is truthy.
pub fn filter<T, R>(iterator: IterFn<T, R>) -> IterationStage<T, R, T>
where
    T: 'static,
    R: Truthy + 'static,
{
    IterationStage::from_parts(
        "filter",
        iterator,
        Box::new(|result: R, item: T, out: &mut Emitter<T>| {
            if result.is_truthy() {
                out.push(item);
            }
        }),
    )
}

/// Run the iterator for its side effect and always emit the original item.
pub fn each<T: 'static, R: 'static>(iterator: IterFn<T, R>) -> IterationStage<T, R, T> {
    IterationStage::from_parts(
        "each",
        iterator,
        Box::new(|_result: R, item: T, out: &mut Emitter<T>| out.push(item)),
    )
}

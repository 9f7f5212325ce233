//! Utility macros for the stream crate.

/// Implements [`Truthy`](crate::stages::Truthy) for numeric types: zero and
/// NaN are falsy, everything else is truthy.
macro_rules! impl_truthy_numeric {
    (int: $($int:ty),* ; float: $($float:ty),* $(;)?) => {
        $(
            impl $crate::stages::Truthy for $int {
                fn is_truthy(&self) -> bool {
                    *self != 0
                }
            }
        )*
        $(
            impl $crate::stages::Truthy for $float {
                fn is_truthy(&self) -> bool {
                    *self != 0.0 && !self.is_nan()
                }
            }
        )*
    };
}

//!
//! # Error-Helper Utilities
//!
//! Decoders and tree-walkers commonly carry state worth reporting upon failure:
//! a byte offset, a record number, a stack of what was being decoded.
//! [ErrorHelper] lets each such type inject that state into its errors once, in `err`,
//! and then fail, unwrap, and assert through the default-implemented methods.
//!
//! ```rust
//! use elib21utils::error::{ErrorHelper, Unwrapper};
//!
//! /// Decoder which reports its position with each failure
//! struct Decoder {
//!     pos: usize,
//! }
//! impl ErrorHelper for Decoder {
//!     type Error = String;
//!     fn err(&self, msg: impl Into<String>) -> Self::Error {
//!         format!("{} (at byte {})", msg.into(), self.pos)
//!     }
//! }
//! impl Decoder {
//!     fn decode(&self, table: &[u8], idx: i32) -> Result<u8, String> {
//!         let idx = self.index(idx, table.len(), "table entry")?;
//!         table.get(idx).copied().unwrapper(self, "empty table")
//!     }
//! }
//! let d = Decoder { pos: 12 };
//! assert_eq!(d.decode(&[7, 8], 1), Ok(8));
//! assert!(d.decode(&[7, 8], 2).is_err());
//! ```
//!

///
/// # ErrorHelper
///
/// Implementers provide `err`, which creates their error type from a message.
/// Failure, unwrapping, assertion and index-checking are all provided atop it.
///
pub trait ErrorHelper {
    type Error;

    /// Create and return a [Self::Error] value.
    fn err(&self, msg: impl Into<String>) -> Self::Error;
    /// Return failure
    fn fail<T>(&self, msg: impl Into<String>) -> Result<T, Self::Error> {
        Err(self.err(msg))
    }
    /// Unwrap the [Option] `opt` if it is [Some], and return our error if not.
    fn unwrap<T>(&self, opt: Option<T>, msg: impl Into<String>) -> Result<T, Self::Error> {
        match opt {
            Some(val) => Ok(val),
            None => self.fail(msg),
        }
    }
    /// Assert a boolean condition. Returns through `self.fail` if it is not satisfied.
    fn assert(&self, b: bool, msg: impl Into<String>) -> Result<(), Self::Error> {
        match b {
            true => Ok(()),
            false => self.fail(msg),
        }
    }
    /// Check that signed on-disk index `idx` lies in `0..len`, and convert it to a [usize].
    /// `what` names the indexed table in the failure message.
    fn index(&self, idx: i32, len: usize, what: &str) -> Result<usize, Self::Error> {
        match usize::try_from(idx) {
            Ok(i) if i < len => Ok(i),
            _ => self.fail(format!("Invalid {} index {} (limit is {})", what, idx, len)),
        }
    }
}

///
/// # Unwrapper
///
/// Post-fix application of an [ErrorHelper] to [Option]s and [Result]s:
///
/// ```rust
/// use elib21utils::error::{ErrorHelper, Unwrapper};
///
/// fn example(h: &impl ErrorHelper<Error = String>) -> Result<i32, String> {
///     let a = Some(5).unwrapper(h, "Option failed!")?;
///     let b: Result<i32, ()> = Ok(6);
///     Ok(a + b.unwrapper(h, "Result failed!")?)
/// }
/// ```
///
/// The intent is not to implement [Unwrapper] for new types,
/// but to import it and use it on the standard library [Option] and [Result].
///
pub trait Unwrapper {
    type Ok;
    fn unwrapper<H>(self, helper: &H, msg: impl Into<String>) -> Result<Self::Ok, H::Error>
    where
        H: ErrorHelper;
}

/// # Unwrapper for [Option]
/// Routes [None] to the paired [ErrorHelper] rather than panicking.
impl<T> Unwrapper for Option<T> {
    type Ok = T;
    fn unwrapper<H>(self, helper: &H, msg: impl Into<String>) -> Result<Self::Ok, H::Error>
    where
        H: ErrorHelper,
    {
        helper.unwrap(self, msg)
    }
}

/// # Unwrapper for [Result]
/// Routes any [Err] to the paired [ErrorHelper]. The original error value is dropped.
impl<T, E> Unwrapper for Result<T, E> {
    type Ok = T;
    fn unwrapper<H>(
        self,
        helper: &H,
        msg: impl Into<String>,
    ) -> Result<<Self as Unwrapper>::Ok, H::Error>
    where
        H: ErrorHelper,
    {
        helper.unwrap(self.ok(), msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagged;
    impl ErrorHelper for Tagged {
        type Error = String;
        fn err(&self, msg: impl Into<String>) -> String {
            format!("tagged: {}", msg.into())
        }
    }

    #[test]
    fn index_checks() {
        assert_eq!(Tagged.index(0, 1, "cell"), Ok(0));
        assert_eq!(
            Tagged.index(-1, 1, "cell"),
            Err("tagged: Invalid cell index -1 (limit is 1)".to_string())
        );
        assert!(Tagged.index(3, 3, "name").is_err());
    }
    #[test]
    fn unwrappers() {
        let r: Result<u8, ()> = Err(());
        assert_eq!(r.unwrapper(&Tagged, "nope"), Err("tagged: nope".to_string()));
        assert_eq!(Some(3).unwrapper(&Tagged, "nope"), Ok(3));
        assert!(Tagged.assert(false, "x").is_err());
    }
}

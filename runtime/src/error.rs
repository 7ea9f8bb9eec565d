//! A minimal error convention: fallible internals return `Result<T, ()>` and
//! log full context at the point of failure, so the error value itself
//! never needs to carry anything forward.

use core::result;

pub type Result<T = (), E = ()> = result::Result<T, E>;

#[doc(hidden)]
pub trait Ext<T, E> {
	/// Turns an `Err` into a logged `None`, keeping `Ok` as `Some`.
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

pub use Ext as _;

pub mod error;
pub mod logger;
pub mod selector;
pub mod shutdown;

pub use selector::{Event, Interest, Selector, Token};

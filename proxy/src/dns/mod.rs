mod codec;
mod tracker;

pub use codec::{build_query, parse_response, Answer};
pub use tracker::{Tracker, TIMEOUT};

//! http/1.1 connection handling.

mod dispatcher;
pub(crate) mod proto;

pub use dispatcher::serve;

pub(crate) use dispatcher::{MAX_REQUEST_TIME, MIN_BYTES_PER_CHECK, THROUGHPUT_CHECK_INTERVAL};

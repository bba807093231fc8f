//! http/2 session handling on top of the `h2` crate.

mod dispatcher;
mod guard;

pub use dispatcher::serve;

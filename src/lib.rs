//! nioresolv - An asynchronous DNS client engine.
//!
//! One dispatcher thread drives every socket; callers submit queries from
//! any thread and collect results from a [`ResponseQueue`], a callback, or
//! by blocking in [`Resolver::send`].

pub mod dispatcher;
pub mod error;
pub mod extended;
pub mod queue;
pub mod resolver;
pub mod response;
mod single_port;
pub mod stats;
pub mod timer;
mod transaction;
pub mod transport;
pub mod wire;

pub use dispatcher::{Dispatcher, Reactor};
pub use error::{Error, Result};
pub use extended::ExtendedResolver;
pub use queue::ResponseQueue;
pub use resolver::{QueryOptions, Resolver, ResolverConfig};
pub use response::{QueryId, Response};
pub use stats::{Stats, StatsSnapshot};
pub use transaction::CompletionTarget;
pub use transport::{State, Transport};
pub use wire::Signer;

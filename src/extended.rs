//! Retrying a query across several servers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hickory_proto::op::Message;
use tracing::debug;

use crate::error::{Error, Result};
use crate::queue::ResponseQueue;
use crate::resolver::{QueryOptions, Resolver};
use crate::response::{QueryId, Response};
use crate::transaction::CompletionTarget;

/// Attempts per query when not configured.
pub const DEFAULT_RETRIES: usize = 3;

/// Sends each query to a list of resolvers in rotation until one answers.
///
/// Every attempt carries a fresh random transaction id, so a late reply to
/// an earlier attempt can never be mistaken for the current one.
pub struct ExtendedResolver {
    resolvers: Vec<Arc<Resolver>>,
    retries: usize,
    next: AtomicUsize,
    next_query: AtomicUsize,
}

impl ExtendedResolver {
    pub fn new(resolvers: Vec<Arc<Resolver>>) -> Self {
        Self {
            resolvers,
            retries: DEFAULT_RETRIES,
            next: AtomicUsize::new(0),
            next_query: AtomicUsize::new(0),
        }
    }

    /// Total number of attempts per query, at least one.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn resolvers(&self) -> &[Arc<Resolver>] {
        &self.resolvers
    }

    /// Send `query`, retrying retryable failures on the next resolver.
    ///
    /// Returns the first answer, or the last error once the attempts run
    /// out. Errors that another attempt cannot fix are returned right away.
    pub fn send(&self, query: &Message) -> Result<Message> {
        if self.resolvers.is_empty() {
            return Err(Error::Unsupported("no resolvers configured".into()));
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last = Error::Timeout;

        for attempt in 0..self.retries {
            let resolver = &self.resolvers[(start + attempt) % self.resolvers.len()];
            let mut message = query.clone();
            message.set_id(fresh_id(query.id()));

            match resolver.send(&message) {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    debug!(attempt, server = %resolver.config().server, error = %e, "attempt failed, retrying");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Like [`send`](Self::send), but the outcome is inserted into `queue`.
    ///
    /// Each attempt is an ordinary asynchronous query whose completion
    /// starts the next attempt, so no thread waits on a pending query.
    pub fn send_async(self: &Arc<Self>, query: &Message, queue: &Arc<ResponseQueue>) -> Result<QueryId> {
        if self.resolvers.is_empty() {
            return Err(Error::Unsupported("no resolvers configured".into()));
        }
        let id = QueryId(self.next_query.fetch_add(1, Ordering::Relaxed) as u64);
        Attempt {
            extended: self.clone(),
            query: query.clone(),
            queue: queue.clone(),
            id,
            start: self.next.fetch_add(1, Ordering::Relaxed),
            attempt: 0,
        }
        .launch()?;
        Ok(id)
    }
}

/// One try of an asynchronous extended query.
struct Attempt {
    extended: Arc<ExtendedResolver>,
    query: Message,
    queue: Arc<ResponseQueue>,
    id: QueryId,
    start: usize,
    attempt: usize,
}

impl Attempt {
    /// Errors mean this attempt never started.
    fn launch(self) -> Result<()> {
        let resolvers = &self.extended.resolvers;
        let resolver = resolvers[(self.start + self.attempt) % resolvers.len()].clone();
        let mut message = self.query.clone();
        message.set_id(fresh_id(self.query.id()));

        let target = CompletionTarget::callback(move |response| self.finish(response));
        resolver.submit(&message, &QueryOptions::default(), target)?;
        Ok(())
    }

    fn finish(self, response: Response) {
        let (queue, id) = (self.queue.clone(), self.id);
        let outcome = match response.into_result() {
            Err(e) if e.is_retryable() && self.attempt + 1 < self.extended.retries => {
                debug!(attempt = self.attempt, query_id = %id, error = %e, "attempt failed, retrying");
                let next = Attempt {
                    attempt: self.attempt + 1,
                    ..self
                };
                match next.launch() {
                    Ok(()) => return,
                    Err(e) => Err(e),
                }
            }
            outcome => outcome,
        };
        queue.insert(Response::new(id, outcome));
    }
}

/// A random transaction id different from `previous`.
fn fresh_id(previous: u16) -> u16 {
    loop {
        let id = rand::random::<u16>();
        if id != previous {
            return id;
        }
    }
}

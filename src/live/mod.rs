//! # Live Queries
//!
//! Push-based result streams for queries that stay open:
//!
//! - `stream`: cancellable channel pair every live operation returns
//! - `multiplexer`: one backend feed per distinct statement, ref-counted
//! - `engine`: snapshot plus feed merged into one ordered notification stream
//! - `debounce`: idle-window batching in front of result shaping
//! - `transformer`: list, first, count and aggregate views over the merge

mod debounce;
mod engine;
mod multiplexer;
mod stream;
mod transformer;

pub use debounce::Debouncer;
pub use engine::{CountTracker, LiveQueryEngine};
pub use multiplexer::{LiveStatementMultiplexer, MultiplexingQueryProvider};
pub use stream::{live_channel, CancelGuard, Cancellation, LiveReceiver, LiveSender, LiveStream};
pub use transformer::{
    AggregateTransformer, CountTransformer, FirstTransformer, ListTransformer, QueryTransformer,
};

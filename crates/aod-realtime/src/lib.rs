pub mod backoff;
pub mod client;
mod dispatch;
pub mod guard;
pub mod poller;
pub mod supervisor;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use client::{RealtimeClient, Subscription};
pub use guard::{Guarded, MutationGuard};
pub use poller::{intervals, PollOptions, PollScheduler};
pub use supervisor::{ConnectionStatus, RealtimeConfig};
pub use transport::{EventByteStream, SseTransport, Transport, TransportError};

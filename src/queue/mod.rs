//! Broker-backed task dispatch
//!
//! Tasks are persisted to fjall before distribution and acknowledged only
//! after the runner finished (late ack), so a lost worker requeues its
//! in-flight message on restart. Two logical queues keep heavy inference
//! isolated from lightweight work, and exhausted tasks land in a dead-letter
//! partition instead of being dropped.

pub mod broker;
pub mod chord;
pub mod store;

pub use broker::{BrokerReceivers, TaskBroker, TaskEnvelope};
pub use chord::{ChordTracker, TaskOutcome};
pub use store::{DeadLetterEntry, FjallQueue, QueueError};

//! Acquisition pipeline: slot ring, shared session state, producer and consumer threads

pub mod consumer;
pub mod producer;
pub mod ringbuf;
pub mod session;

pub use consumer::{Consumer, ConsumerReport};
pub use producer::{Producer, ProducerReport};
pub use ringbuf::RingIndex;
pub use session::{CursorSnapshot, Published, Session};

//! Change feed: event shapes and the cursor-tracking consumer

mod consumer;
mod event;

pub use consumer::{
    BatchOutcome, ConsumerState, StartFrom, StreamConfig, StreamConsumer, StreamHandler,
};
pub use event::{EventData, EventExtensions, EventType, FileRef, NewEvent, PatchOp, StreamEvent};

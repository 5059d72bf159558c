//! The fast-import stream surface: reading a stream into the event
//! model and serializing the model back out. These two halves define
//! the external contract the core must reproduce on round-trip.

pub mod reader;
pub mod writer;

pub use writer::WriteOptions;

//! Stream-surgeon is a library for surgical rewriting of
//! version-control histories. It parses a git fast-import stream into
//! an in-memory event graph, supports transformations over that graph
//! (squash, delete, expunge, tagify, graft, cut, unite, renumber, path
//! rename, branch lift, split, reduce), and serializes the result back
//! to a fast-import stream.

pub mod authormap;
pub mod config;
pub mod errors;
pub mod hash;
pub mod internal;
pub mod utils;

pub use config::{Config, LogMask};
pub use errors::{ErrorKind, Result, SurgeonError};
pub use internal::event::Event;
pub use internal::repo::Repository;
pub use internal::stream::WriteOptions;
pub use internal::surgery::SquashPolicy;

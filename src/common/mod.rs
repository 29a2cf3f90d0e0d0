//! Common types and abstractions
//!
//! - Stream: boxed async I/O used for proxy connections
//! - FlowKey: 5-tuple identity of a tunnelled flow
//! - Address: proxy / destination address representation

mod address;
mod flow;
mod stream;

pub use address::Address;
pub use flow::{FlowKey, Network};
pub use stream::{AsyncReadWrite, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};

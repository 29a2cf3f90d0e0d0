//! Packet Reader/Writer and IP demultiplexer
//!
//! The engine loop reads frames from the device and feeds them to the
//! [`Demux`]. Sessions write replies back through the shared
//! [`PacketWriter`].

mod demux;
mod writer;

pub use demux::{Demux, Dispatch};
pub use writer::PacketWriter;

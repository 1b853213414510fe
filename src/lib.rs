//! # `traceport`
//!
//! A decoding library for the ARM Cortex-M trace port protocols. Two
//! physical formats are layered: the outer TPIU framing that
//! multiplexes logical streams onto one link, and the inner ITM/DWT
//! packet protocol carrying software, hardware and timestamp messages.
//! A post-mortem path captures the instruction-flow (ETM) stream into a
//! ring and decodes it on demand.
//!
//! Data flows strictly one way through the pipeline:
//!
//! ```text
//!  raw bytes -> FrameDecoder -> demux -> ItmDecoder -> Dispatcher -> sinks
//!                                  |
//!                                  +-> PmRing -> EtmDecoder -> sinks
//! ```
//!
//! The usual entry point is a [`Session`](session::Session), which owns
//! one decoder of each kind and routes between them:
//!
//! ```
//! use traceport::dispatch::MessageSink;
//! use traceport::session::{Session, SessionConfig};
//!
//! struct Printer;
//! impl MessageSink for Printer {
//!     fn software(&mut self, ts: u64, addr: u8, _len: u8, value: u32) {
//!         println!("[{}] ch{}: {:#010x}", ts, addr, value);
//!     }
//! }
//!
//! let config = SessionConfig { strict_itm_sync: false, ..SessionConfig::default() };
//! let mut session = Session::new(config, Box::new(Printer));
//! session.pump_bytes(&[0x01, 0x2a]);
//! ```
//!
//! The decoders are also usable on their own; see [`tpiu`], [`itm`] and
//! [`etm`].

pub mod channels;
pub mod dispatch;
pub mod etm;
pub mod fmt;
pub mod itm;
pub mod ring;
pub mod session;
pub mod source;
pub mod tpiu;

pub use dispatch::{Dispatcher, FileWriter, MessageSink};
pub use itm::{ItmDecoder, ItmMessage, Timestamped};
pub use session::{Session, SessionConfig};
pub use tpiu::FrameDecoder;

use std::path::PathBuf;

/// Top-level failures. Decode-stream anomalies (lost sync, stale
/// frames, overflow) are not errors: the decoders recover locally and
/// surface them through events and statistics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input file could not be opened.
    #[error("cannot open {path:?}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A network source failed permanently.
    #[error("network error on {addr}: {source}")]
    Net {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration; fatal before the pump loop starts.
    #[error("configuration error: {0}")]
    Config(String),
}

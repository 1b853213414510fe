//! The trace session: one object owning the whole decode pipeline.
//!
//! A session wires the TPIU framer, the ITM decoder, the dispatcher and
//! (when post-mortem capture is enabled) the capture ring and the
//! instruction-trace decoder. All state is owned here and mutated only
//! by the thread driving [`Session::pump_bytes`]; sinks fan decoded
//! messages out to their own consumers.

use crate::dispatch::{Dispatcher, FileWriter, MessageSink};
use crate::etm::{Changes, CpuState, EtmDecoder, EtmReport, EtmStats};
use crate::itm::{ItmDecoder, ItmEvent, ItmMessage, ItmStats, Timestamped};
use crate::ring::{PmRing, RingPolicy};
use crate::tpiu::{FrameDecoder, FrameEvent, FrameStats};

/// TPIU stream carrying ITM data, by convention.
pub const DEFAULT_ITM_STREAM: u8 = 1;

/// TPIU stream carrying instruction trace, by convention.
pub const DEFAULT_PM_STREAM: u8 = 2;

/// Session construction parameters. Channel and sink configuration is
/// fixed once the session exists.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The input is TPIU-framed; demultiplex it. Without framing the
    /// raw byte stream is the single input stream.
    pub use_tpiu: bool,

    /// TPIU stream to decode as ITM.
    pub itm_stream: u8,

    /// TPIU stream captured for post-mortem decode.
    pub pm_stream: u8,

    /// Require a real ITM synchronisation sequence before decoding, and
    /// drop synchronisation on invalid headers.
    pub strict_itm_sync: bool,

    /// Decode ITM at all; a pure capture session switches this off.
    pub decode_itm: bool,

    /// Attach a post-mortem capture ring of this many bytes.
    pub pm_capacity: Option<usize>,

    /// Freeze the capture when it fills instead of keeping the newest
    /// window.
    pub single_shot: bool,

    /// Context-ID size the target emits in instruction trace.
    pub context_bytes: u8,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            use_tpiu: false,
            itm_stream: DEFAULT_ITM_STREAM,
            pm_stream: DEFAULT_PM_STREAM,
            strict_itm_sync: true,
            decode_itm: true,
            pm_capacity: None,
            single_shot: false,
            context_bytes: 0,
        }
    }
}

/// A decode pipeline bound to one sink.
pub struct Session {
    config: SessionConfig,
    frame: FrameDecoder,
    itm: ItmDecoder,
    dispatcher: Dispatcher,
    ring: Option<PmRing>,
    etm: Option<EtmDecoder>,

    /// Bytes seen on streams nobody consumes.
    orphan_bytes: u64,
}

impl Session {
    pub fn new(config: SessionConfig, sink: Box<dyn MessageSink + Send>) -> Session {
        let ring = config.pm_capacity.map(|capacity| {
            let policy = if config.single_shot {
                RingPolicy::SingleShot
            } else {
                RingPolicy::Running
            };
            PmRing::new(capacity, policy)
        });
        let etm = if ring.is_some() {
            Some(EtmDecoder::new(config.context_bytes))
        } else {
            None
        };

        Session {
            itm: ItmDecoder::new(config.strict_itm_sync),
            frame: FrameDecoder::new(),
            dispatcher: Dispatcher::new(sink),
            ring,
            etm,
            orphan_bytes: 0,
            config,
        }
    }

    /// Attaches the filewriter sink for the reserved software channel.
    pub fn set_filewriter(&mut self, filewriter: Box<dyn FileWriter + Send>) {
        self.dispatcher.set_filewriter(filewriter);
    }

    pub fn frame_stats(&self) -> &FrameStats {
        self.frame.stats()
    }

    pub fn itm_stats(&self) -> &ItmStats {
        self.itm.stats()
    }

    pub fn etm_stats(&self) -> Option<&EtmStats> {
        self.etm.as_ref().map(|e| e.stats())
    }

    /// The capture ring, when post-mortem capture is enabled.
    pub fn ring(&self) -> Option<&PmRing> {
        self.ring.as_ref()
    }

    /// Bytes received on streams with no consumer.
    pub fn orphan_bytes(&self) -> u64 {
        self.orphan_bytes
    }

    /// Feeds a buffer of raw input bytes through the pipeline.
    pub fn pump_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.pump_byte(*byte);
        }
    }

    fn pump_byte(&mut self, byte: u8) {
        if !self.config.use_tpiu {
            if self.config.decode_itm {
                self.pump_itm(byte);
            }
            if let Some(ref mut ring) = self.ring {
                ring.push(byte);
            }
            return;
        }

        match self.frame.pump(byte) {
            FrameEvent::RxedPacket => {
                let packet = self.frame.packet();
                for item in packet.bytes {
                    self.route(item.stream, item.data);
                }
            }
            FrameEvent::NewSync => {
                // Frame alignment implies ITM byte alignment.
                self.itm.force_sync(true);
            }
            FrameEvent::Unsynced => {
                log::debug!("stale frame abandoned, hunting for sync");
            }
            FrameEvent::Error => {
                log::warn!("frame decoder in invalid state, forcing resync");
                self.frame.force_sync(0);
            }
            FrameEvent::None | FrameEvent::Rxing | FrameEvent::Synced => (),
        }
    }

    /// Routes one demultiplexed byte to its stream consumer.
    fn route(&mut self, stream: u8, data: u8) {
        if stream == self.config.itm_stream && self.config.decode_itm {
            self.pump_itm(data);
        } else if stream == self.config.pm_stream && self.ring.is_some() {
            if let Some(ref mut ring) = self.ring {
                ring.push(data);
            }
        } else if stream != 0 {
            // Stream 0 is idle padding; anything else is unconsumed.
            self.orphan_bytes += 1;
        }
    }

    fn pump_itm(&mut self, byte: u8) {
        match self.itm.pump(byte) {
            ItmEvent::PacketRxed
            | ItmEvent::Overflow
            | ItmEvent::Error
            | ItmEvent::Unsynced => {
                if let Some(message) = self.itm.message() {
                    self.dispatcher.dispatch(&message);
                }
            }
            ItmEvent::Synced | ItmEvent::None => (),
        }
    }

    /// Decodes the post-mortem capture in place, reporting CPU state
    /// updates through `on_state` and stream diagnostics through
    /// `on_report`. The capture is left untouched and can be decoded
    /// again.
    ///
    /// A capture that wrapped no longer starts on a packet boundary, so
    /// instruction-trace synchronisation is dropped first and reacquired
    /// from the capture itself.
    pub fn decode_postmortem<S, R>(&mut self, mut on_state: S, mut on_report: R)
    where
        S: FnMut(&CpuState, Changes),
        R: FnMut(EtmReport),
    {
        let ring = match self.ring.as_mut() {
            Some(ring) => ring,
            None => return,
        };
        let etm = match self.etm.as_mut() {
            Some(etm) => etm,
            None => return,
        };
        let dispatcher = &mut self.dispatcher;

        if ring.take_wrapped() {
            etm.force_sync(false);
        }

        let last_ts = std::cell::Cell::new(0u64);
        ring.drain_for_decode(|chunk| {
            etm.pump(
                chunk,
                |state, changes| {
                    last_ts.set(state.timestamp);
                    on_state(state, changes);
                },
                |report| {
                    if let EtmReport::ISync { kind, addr } = report {
                        dispatcher.dispatch(&Timestamped {
                            ts: last_ts.get(),
                            message: ItmMessage::NiSync { kind, addr },
                        });
                    }
                    on_report(report);
                },
            );
        });
    }

    /// Clears the post-mortem capture and releases a held single-shot
    /// ring.
    pub fn release_ring(&mut self) {
        if let Some(ref mut ring) = self.ring {
            ring.release();
        }
        if let Some(ref mut etm) = self.etm {
            etm.force_sync(false);
        }
    }
}

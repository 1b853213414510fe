//! Decoder for the ITM and DWT packet protocol as specified in the
//! [ARMv7-M architecture reference manual, Appendix
//! D4](https://developer.arm.com/documentation/ddi0403/ed/).
//!
//! The decoder is a byte pump over a header-driven state machine: feed it
//! unwrapped ITM stream bytes (from the SWO pin directly, or demultiplexed
//! out of TPIU frames) and it emits typed [`ItmMessage`]s, each stamped
//! with the running local-timestamp accumulator at the instant its header
//! byte was consumed.

use bitmatch::bitmatch;

/// Six-byte window used to recognise a synchronisation packet: at least
/// five zero bytes followed by `0x80`.
const SYNC_MASK: u64 = 0xFFFF_FFFF_FFFF;
const SYNC_PATTERN: u64 = 0x0000_0000_0080;

/// Relationship between a local timestamp value and the data packets it
/// covers. (Appendix D4.2.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimestampStatus {
    /// The timestamp is synchronous to the corresponding data.
    Exact,

    /// The timestamp was generated after the data it covers.
    TimestampDelayed,

    /// The data packet was delayed relative to the event it reports.
    PacketDelayed,

    /// Both the timestamp and the data packet were delayed.
    BothDelayed,
}

/// What the processor did with an exception. (Table D4-6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExceptionEvent {
    /// Exception was entered.
    Enter,

    /// Exception was exited.
    Exit,

    /// Execution resumed in a previously preempted exception.
    Resume,
}

/// A decoded ITM message.
///
/// The specification would suggest separate protocol and source packet
/// types; the set is flattened here, the shape downstream consumers
/// dispatch over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ItmMessage {
    /// Payload written to an ITM stimulus port by software.
    Software {
        /// Stimulus port number, 0..=31.
        addr: u8,

        /// Number of payload bytes written, 1, 2 or 4.
        len: u8,

        /// Payload value, little-endian.
        value: u32,
    },

    /// Local timestamp: the interval since the previous timestamp.
    Timestamp {
        /// Timestamp counter increment.
        inc: u32,

        /// Relation of the increment to the covered data.
        status: TimestampStatus,
    },

    /// The processor entered, exited or resumed an exception.
    Exception {
        /// Exception number, 0..=511.
        number: u16,
        event: ExceptionEvent,
    },

    /// Periodic PC sample. (Appendix D4.3.3)
    PcSample {
        pc: u32,

        /// The core was sleeping when the sample was taken; `pc` is not
        /// meaningful.
        sleep: bool,
    },

    /// One or more DWT event counters wrapped. (Appendix D4.3.1)
    DwtEvent {
        cpi: bool,
        exc: bool,
        sleep: bool,
        lsu: bool,
        fold: bool,
        cyc: bool,
    },

    /// A DWT comparator matched a data read or write. (Appendix D4.3.4)
    DataRww {
        /// Matching comparator, 0..=3.
        comparator: u8,

        /// The access was a write rather than a read.
        write: bool,

        /// Data value transferred, little-endian.
        data: u32,
    },

    /// A DWT comparator matched an access; the value is the address of
    /// the instruction that performed it. (Appendix D4.3.4)
    DataAccess {
        /// Matching comparator, 0..=3.
        comparator: u8,
        data: u32,
    },

    /// A DWT comparator matched an address; only the low-order offset is
    /// reported. (Appendix D4.3.4)
    DataOffset {
        /// Matching comparator, 0..=3.
        comparator: u8,
        offset: u16,
    },

    /// Instruction-stream synchronisation point reported by the
    /// instruction-trace decoder.
    NiSync {
        /// Synchronisation reason.
        kind: u8,
        addr: u32,
    },

    /// The target dropped trace data at source.
    Overflow,

    /// A malformed packet was consumed.
    Error,

    /// The decoder lost (or has not yet gained) synchronisation.
    Unsynced,
}

/// An [`ItmMessage`] and the local-timestamp accumulator value when its
/// header byte was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamped {
    /// Sum of all timestamp increments seen before this message's header.
    /// Monotonically non-decreasing over a stream.
    pub ts: u64,
    pub message: ItmMessage,
}

/// Event reported by [`ItmDecoder::pump`] for each byte consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItmEvent {
    /// Byte consumed, nothing further to report.
    None,

    /// A synchronisation packet completed; the decoder is byte-aligned.
    Synced,

    /// Synchronisation lost (invalid header while strict).
    Unsynced,

    /// An overflow packet was consumed; the message is available.
    Overflow,

    /// A malformed packet was consumed and skipped.
    Error,

    /// A message completed; fetch it with [`ItmDecoder::message`].
    PacketRxed,
}

/// Cumulative decoder statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItmStats {
    /// Bytes consumed in total.
    pub bytes: u64,

    /// Synchronisation packets seen.
    pub syncs: u64,

    /// Times synchronisation was lost.
    pub lost_syncs: u64,

    /// Messages emitted.
    pub packets: u64,

    /// Software (stimulus port) messages emitted.
    pub software: u64,

    /// Hardware (DWT) messages emitted.
    pub hardware: u64,

    /// Local timestamp messages emitted.
    pub timestamps: u64,

    /// Overflow packets seen.
    pub overflows: u64,

    /// Malformed headers or payloads.
    pub errors: u64,

    /// Reserved or extension bytes consumed and ignored.
    pub noise: u64,
}

/// Payload kind being collected, decided by the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    Software { addr: u8 },
    Hardware { disc: u8 },
    Timestamp { status: TimestampStatus },
    Extension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItmState {
    /// Waiting for a synchronisation packet (or an external force-sync).
    Unsynced,

    /// Awaiting a header byte.
    Idle,

    /// Collecting `remaining` payload bytes for `kind`. A `remaining` of
    /// zero means continuation-terminated.
    Collecting { kind: Payload, remaining: u8 },
}

/// The stateful ITM decoder.
#[derive(Debug)]
pub struct ItmDecoder {
    state: ItmState,

    /// Rolling window of the most recent input bytes, for sync hunting.
    last_bytes: u64,

    /// If set, the decoder starts unsynchronised and drops back to
    /// unsynchronised on an invalid header.
    strict_sync: bool,

    /// Local-timestamp accumulator.
    time: u64,

    /// `time` sampled when the current packet's header was consumed.
    header_time: u64,

    /// Payload accumulator for the packet in progress.
    value: u32,

    /// Payload bytes consumed for the packet in progress.
    count: u8,

    message: Option<Timestamped>,
    stats: ItmStats,
}

impl ItmDecoder {
    /// Creates a decoder. With `strict_sync` set it starts
    /// unsynchronised and requires a real synchronisation packet (or
    /// [`force_sync`](ItmDecoder::force_sync)) before decoding; without
    /// it decoding starts immediately.
    pub fn new(strict_sync: bool) -> ItmDecoder {
        ItmDecoder {
            state: if strict_sync {
                ItmState::Unsynced
            } else {
                ItmState::Idle
            },
            last_bytes: !0,
            strict_sync,
            time: 0,
            header_time: 0,
            value: 0,
            count: 0,
            message: None,
            stats: ItmStats::default(),
        }
    }

    /// Cumulative statistics for this decoder instance.
    pub fn stats(&self) -> &ItmStats {
        &self.stats
    }

    /// Declares synchronisation out of band, typically because the
    /// enclosing TPIU framer has just synchronised.
    pub fn force_sync(&mut self, synced: bool) {
        self.state = if synced {
            ItmState::Idle
        } else {
            ItmState::Unsynced
        };
    }

    /// The last decoded message. Valid immediately after
    /// [`ItmEvent::PacketRxed`] or [`ItmEvent::Overflow`]; stable until
    /// the next message completes.
    pub fn message(&self) -> Option<Timestamped> {
        self.message
    }

    /// Consumes one stream byte.
    pub fn pump(&mut self, byte: u8) -> ItmEvent {
        self.stats.bytes += 1;
        self.last_bytes = (self.last_bytes << 8) | u64::from(byte);

        if self.last_bytes & SYNC_MASK == SYNC_PATTERN {
            self.state = ItmState::Idle;
            self.stats.syncs += 1;
            return ItmEvent::Synced;
        }

        match self.state {
            ItmState::Unsynced => ItmEvent::None,
            ItmState::Idle => self.header(byte),
            ItmState::Collecting { kind, remaining } => self.collect(kind, remaining, byte),
        }
    }

    /// Classifies a header byte and either emits a complete message or
    /// enters the matching collection state. (Appendix D4, Table D4-1)
    #[bitmatch]
    fn header(&mut self, header: u8) -> ItmEvent {
        self.header_time = self.time;
        self.value = 0;
        self.count = 0;

        #[bitmatch]
        match header {
            // Start (or continuation) of a synchronisation packet; the
            // rolling window above completes it.
            "0000_0000" => ItmEvent::None,

            "0111_0000" => {
                self.stats.overflows += 1;
                self.emit(ItmMessage::Overflow, ItmEvent::Overflow)
            }

            // Local timestamp, multi-byte form. Status from the TC field.
            "11ss_0000" => self.begin_timestamp(s),
            "10ss_0000" => {
                if s == 0 {
                    self.invalid(header)
                } else {
                    self.begin_timestamp(s)
                }
            }

            // Local timestamp, single-byte form (value 1..=6; 0 and 7
            // are the sync and overflow headers above).
            "0sss_0000" => {
                let message = ItmMessage::Timestamp {
                    inc: u32::from(s),
                    status: TimestampStatus::Exact,
                };
                self.stats.timestamps += 1;
                let event = self.emit(message, ItmEvent::PacketRxed);
                self.time += u64::from(s);
                event
            }

            // Extension packet; continuation bit decides length.
            "c???_1000" => {
                self.stats.noise += 1;
                if c == 1 {
                    self.state = ItmState::Collecting {
                        kind: Payload::Extension,
                        remaining: 0,
                    };
                }
                ItmEvent::None
            }

            // Reserved encodings with a continuation-terminated payload
            // (includes the global timestamp headers, which this decoder
            // consumes but does not surface).
            "c???_?100" => {
                self.stats.noise += 1;
                if c == 1 {
                    self.state = ItmState::Collecting {
                        kind: Payload::Extension,
                        remaining: 0,
                    };
                }
                ItmEvent::None
            }

            // Software source packet.
            "aaaa_a0ss" => {
                self.state = ItmState::Collecting {
                    kind: Payload::Software { addr: a },
                    remaining: payload_len(s),
                };
                ItmEvent::None
            }

            // Hardware source packet; the address field discriminates.
            "aaaa_a1ss" => {
                self.state = ItmState::Collecting {
                    kind: Payload::Hardware { disc: a },
                    remaining: payload_len(s),
                };
                ItmEvent::None
            }
        }
    }

    fn begin_timestamp(&mut self, tc: u8) -> ItmEvent {
        let status = match tc {
            0b00 => TimestampStatus::Exact,
            0b01 => TimestampStatus::TimestampDelayed,
            0b10 => TimestampStatus::PacketDelayed,
            _ => TimestampStatus::BothDelayed,
        };
        self.state = ItmState::Collecting {
            kind: Payload::Timestamp { status },
            remaining: 0,
        };
        ItmEvent::None
    }

    /// Accumulates one payload byte, emitting the message once the
    /// payload is complete.
    fn collect(&mut self, kind: Payload, remaining: u8, byte: u8) -> ItmEvent {
        match kind {
            Payload::Timestamp { status } => {
                self.value = (self.value << 7) | u32::from(byte & 0x7F);
                self.count += 1;
                if byte & 0x80 != 0 && self.count < 4 {
                    return ItmEvent::None;
                }

                let inc = self.value;
                self.stats.timestamps += 1;
                self.state = ItmState::Idle;
                let event = self.emit(
                    ItmMessage::Timestamp { inc, status },
                    ItmEvent::PacketRxed,
                );
                self.time += u64::from(inc);
                event
            }

            Payload::Extension => {
                if byte & 0x80 == 0 {
                    self.state = ItmState::Idle;
                }
                ItmEvent::None
            }

            Payload::Software { addr } => {
                self.value |= u32::from(byte) << (8 * self.count);
                self.count += 1;
                if self.count < remaining {
                    return ItmEvent::None;
                }

                self.stats.software += 1;
                self.state = ItmState::Idle;
                self.emit(
                    ItmMessage::Software {
                        addr,
                        len: remaining,
                        value: self.value,
                    },
                    ItmEvent::PacketRxed,
                )
            }

            Payload::Hardware { disc } => {
                self.value |= u32::from(byte) << (8 * self.count);
                self.count += 1;
                if self.count < remaining {
                    return ItmEvent::None;
                }

                self.state = ItmState::Idle;
                match hardware_message(disc, remaining, self.value) {
                    Some(message) => {
                        self.stats.hardware += 1;
                        self.emit(message, ItmEvent::PacketRxed)
                    }
                    None => {
                        self.stats.errors += 1;
                        self.emit(ItmMessage::Error, ItmEvent::Error)
                    }
                }
            }
        }
    }

    fn emit(&mut self, message: ItmMessage, event: ItmEvent) -> ItmEvent {
        self.stats.packets += 1;
        self.message = Some(Timestamped {
            ts: self.header_time,
            message,
        });
        event
    }

    /// Invalid header. While strict this is treated as loss of
    /// synchronisation; otherwise the byte is skipped.
    fn invalid(&mut self, header: u8) -> ItmEvent {
        log::debug!("invalid ITM header {:#04x}", header);
        self.stats.errors += 1;
        if self.strict_sync {
            self.state = ItmState::Unsynced;
            self.stats.lost_syncs += 1;
            self.emit(ItmMessage::Unsynced, ItmEvent::Unsynced)
        } else {
            self.emit(ItmMessage::Error, ItmEvent::Error)
        }
    }
}

/// Payload byte count from a source packet's SS field. (Table D4-4)
fn payload_len(ss: u8) -> u8 {
    if ss == 0b11 {
        4
    } else {
        ss
    }
}

/// Builds the hardware source message selected by the discriminator
/// field. `None` if the discriminator or payload size is invalid.
fn hardware_message(disc: u8, len: u8, value: u32) -> Option<ItmMessage> {
    match disc {
        0 if len == 1 => Some(ItmMessage::DwtEvent {
            cpi: value & (1 << 0) != 0,
            exc: value & (1 << 1) != 0,
            sleep: value & (1 << 2) != 0,
            lsu: value & (1 << 3) != 0,
            fold: value & (1 << 4) != 0,
            cyc: value & (1 << 5) != 0,
        }),

        1 if len == 2 => {
            let event = match (value >> 12) & 0b11 {
                0b01 => ExceptionEvent::Enter,
                0b10 => ExceptionEvent::Exit,
                0b11 => ExceptionEvent::Resume,
                _ => return None,
            };
            Some(ItmMessage::Exception {
                number: (value & 0x1FF) as u16,
                event,
            })
        }

        2 if len == 1 => Some(ItmMessage::PcSample {
            pc: 0,
            sleep: true,
        }),
        2 if len == 4 => Some(ItmMessage::PcSample {
            pc: value,
            sleep: false,
        }),

        8..=23 => {
            let kind = (disc >> 3) & 0b11;
            let comparator = (disc >> 1) & 0b11;
            let write = disc & 1 != 0;
            match kind {
                0b01 if !write => Some(ItmMessage::DataAccess {
                    comparator,
                    data: value,
                }),
                0b01 => Some(ItmMessage::DataOffset {
                    comparator,
                    offset: value as u16,
                }),
                0b10 => Some(ItmMessage::DataRww {
                    comparator,
                    write,
                    data: value,
                }),
                _ => None,
            }
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump_messages(decoder: &mut ItmDecoder, bytes: &[u8]) -> Vec<Timestamped> {
        let mut out = vec![];
        for b in bytes {
            match decoder.pump(*b) {
                ItmEvent::PacketRxed | ItmEvent::Overflow => out.push(decoder.message().unwrap()),
                _ => (),
            }
        }
        out
    }

    #[test]
    fn sync_packet() {
        let mut decoder = ItmDecoder::new(true);
        let mut events = vec![];
        for b in [0x00, 0x00, 0x00, 0x00, 0x00, 0x80].iter() {
            events.push(decoder.pump(*b));
        }
        assert_eq!(*events.last().unwrap(), ItmEvent::Synced);
        assert_eq!(decoder.stats().syncs, 1);
    }

    #[test]
    fn strict_decoder_ignores_bytes_until_synced() {
        let mut decoder = ItmDecoder::new(true);
        assert_eq!(decoder.pump(0x03), ItmEvent::None);
        assert_eq!(decoder.pump(0x41), ItmEvent::None);
        assert!(decoder.message().is_none());
    }

    #[test]
    fn software_packet() {
        let mut decoder = ItmDecoder::new(false);
        let messages = pump_messages(&mut decoder, &[0x03, 0x41, 0x42, 0x43, 0x44]);
        assert_eq!(
            messages,
            [Timestamped {
                ts: 0,
                message: ItmMessage::Software {
                    addr: 0,
                    len: 4,
                    value: 0x4443_4241,
                }
            }]
        );
        assert_eq!(decoder.stats().software, 1);
    }

    #[test]
    fn software_packet_short_forms() {
        let mut decoder = ItmDecoder::new(false);
        #[rustfmt::skip]
        let messages = pump_messages(&mut decoder, &[
            0b00001_001, 0xAA,          // port 1, 1 byte
            0b00010_010, 0x34, 0x12,    // port 2, 2 bytes
        ]);
        assert_eq!(
            messages,
            [
                Timestamped {
                    ts: 0,
                    message: ItmMessage::Software { addr: 1, len: 1, value: 0xAA }
                },
                Timestamped {
                    ts: 0,
                    message: ItmMessage::Software { addr: 2, len: 2, value: 0x1234 }
                },
            ]
        );
    }

    #[test]
    fn timestamp_packet() {
        let mut decoder = ItmDecoder::new(false);
        let messages = pump_messages(&mut decoder, &[0xD0, 0x81, 0x02]);
        assert_eq!(
            messages,
            [Timestamped {
                ts: 0,
                message: ItmMessage::Timestamp {
                    inc: (0x01 << 7) | 0x02,
                    status: TimestampStatus::TimestampDelayed,
                }
            }]
        );
    }

    #[test]
    fn timestamps_accumulate_monotonically() {
        let mut decoder = ItmDecoder::new(false);
        #[rustfmt::skip]
        let messages = pump_messages(&mut decoder, &[
            0x50,                       // short timestamp, +5
            0x01, 0x11,                 // software, stamped at 5
            0xC0, 0x0A,                 // timestamp +10, stamped at 5
            0x01, 0x22,                 // software, stamped at 15
        ]);

        let stamps: Vec<u64> = messages.iter().map(|m| m.ts).collect();
        assert_eq!(stamps, [0, 5, 5, 15]);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn overflow_packet() {
        let mut decoder = ItmDecoder::new(false);
        assert_eq!(decoder.pump(0x70), ItmEvent::Overflow);
        assert_eq!(
            decoder.message().unwrap().message,
            ItmMessage::Overflow
        );
        assert_eq!(decoder.stats().overflows, 1);
    }

    #[test]
    fn exception_packet() {
        let mut decoder = ItmDecoder::new(false);
        // Discriminator 1, 2-byte payload: exception 0x16 entered.
        let messages = pump_messages(&mut decoder, &[0b00001_110, 0x16, 0x10]);
        assert_eq!(
            messages[0].message,
            ItmMessage::Exception {
                number: 0x16,
                event: ExceptionEvent::Enter,
            }
        );

        let messages = pump_messages(&mut decoder, &[0b00001_110, 0x17, 0x20]);
        assert_eq!(
            messages[0].message,
            ItmMessage::Exception {
                number: 0x17,
                event: ExceptionEvent::Exit,
            }
        );
    }

    #[test]
    fn pc_sample_packets() {
        let mut decoder = ItmDecoder::new(false);
        #[rustfmt::skip]
        let messages = pump_messages(&mut decoder, &[
            0b00010_111, 0x56, 0x00, 0x00, 0x08,    // full sample
            0b00010_101, 0x00,                      // sleep sample
        ]);
        assert_eq!(
            messages,
            [
                Timestamped {
                    ts: 0,
                    message: ItmMessage::PcSample { pc: 0x0800_0056, sleep: false }
                },
                Timestamped {
                    ts: 0,
                    message: ItmMessage::PcSample { pc: 0, sleep: true }
                },
            ]
        );
    }

    #[test]
    fn dwt_event_packet() {
        let mut decoder = ItmDecoder::new(false);
        let messages = pump_messages(&mut decoder, &[0b00000_101, 0b0010_0101]);
        assert_eq!(
            messages[0].message,
            ItmMessage::DwtEvent {
                cpi: true,
                exc: false,
                sleep: true,
                lsu: false,
                fold: false,
                cyc: true,
            }
        );
    }

    #[test]
    fn data_trace_packets() {
        let mut decoder = ItmDecoder::new(false);
        #[rustfmt::skip]
        let messages = pump_messages(&mut decoder, &[
            // Disc 0b01010 (access, comparator 1), 4-byte value.
            0b01010_111, 0x44, 0x00, 0x00, 0x08,
            // Disc 0b01011 (offset, comparator 1), 2-byte offset.
            0b01011_110, 0xCD, 0xAB,
            // Disc 0b10011 (read/write, comparator 1, write), 2 bytes.
            0b10011_110, 0xD7, 0x02,
        ]);
        assert_eq!(
            messages.iter().map(|m| m.message).collect::<Vec<_>>(),
            [
                ItmMessage::DataAccess { comparator: 1, data: 0x0800_0044 },
                ItmMessage::DataOffset { comparator: 1, offset: 0xABCD },
                ItmMessage::DataRww { comparator: 1, write: true, data: 0x02D7 },
            ]
        );
    }

    #[test]
    fn invalid_header_strict_unsyncs() {
        let mut decoder = ItmDecoder::new(true);
        decoder.force_sync(true);
        assert_eq!(decoder.pump(0x80), ItmEvent::Unsynced);
        assert_eq!(decoder.stats().lost_syncs, 1);

        // Subsequent bytes are discarded until a real sync.
        assert_eq!(decoder.pump(0x03), ItmEvent::None);
    }

    #[test]
    fn invalid_header_relaxed_continues() {
        let mut decoder = ItmDecoder::new(false);
        assert_eq!(decoder.pump(0x80), ItmEvent::Error);
        let messages = pump_messages(&mut decoder, &[0x01, 0x55]);
        assert_eq!(
            messages[0].message,
            ItmMessage::Software { addr: 0, len: 1, value: 0x55 }
        );
    }

    #[test]
    fn extension_and_reserved_consumed() {
        let mut decoder = ItmDecoder::new(false);
        // Single-byte extension, then a reserved header with two
        // continuation bytes, then a software packet.
        #[rustfmt::skip]
        let messages = pump_messages(&mut decoder, &[
            0b0011_1000,
            0b1000_0100, 0x81, 0x01,
            0x01, 0x7A,
        ]);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].message,
            ItmMessage::Software { addr: 0, len: 1, value: 0x7A }
        );
        assert_eq!(decoder.stats().noise, 2);
    }
}

//! Routing of decoded ITM messages to their consumers.
//!
//! Dispatch is a capability interface: one method per message variant,
//! every method defaulted to a no-op, so a consumer implements exactly
//! the variants it cares about. Dispatch is synchronous, preserves
//! stream order and never drops a successfully decoded message.

use crate::itm::{ExceptionEvent, ItmMessage, TimestampStatus, Timestamped};

/// Software channel reserved for the filewriter protocol. Messages on
/// this channel describe host-side file operations rather than terminal
/// output and are steered to a dedicated sink when one is attached.
pub const FILEWRITER_CHANNEL: u8 = 29;

/// Consumer of decoded messages. One method per message variant; the
/// default implementations ignore the message.
///
/// All methods receive `ts`, the local-timestamp accumulator value when
/// the message's header byte was consumed.
#[allow(unused_variables)]
pub trait MessageSink {
    /// Payload written to a stimulus port by target software.
    fn software(&mut self, ts: u64, addr: u8, len: u8, value: u32) {}

    /// Local timestamp increment.
    fn timestamp(&mut self, ts: u64, inc: u32, status: TimestampStatus) {}

    /// Exception entry, exit or resume.
    fn exception(&mut self, ts: u64, number: u16, event: ExceptionEvent) {}

    /// Periodic PC sample.
    fn pc_sample(&mut self, ts: u64, pc: u32, sleep: bool) {}

    /// DWT event counter wrap.
    fn dwt_event(
        &mut self,
        ts: u64,
        cpi: bool,
        exc: bool,
        sleep: bool,
        lsu: bool,
        fold: bool,
        cyc: bool,
    ) {
    }

    /// Data watchpoint: value read or written.
    fn data_rww(&mut self, ts: u64, comparator: u8, write: bool, data: u32) {}

    /// Data watchpoint: access address.
    fn data_access(&mut self, ts: u64, comparator: u8, data: u32) {}

    /// Data watchpoint: address offset.
    fn data_offset(&mut self, ts: u64, comparator: u8, offset: u16) {}

    /// Instruction-stream synchronisation point.
    fn ni_sync(&mut self, ts: u64, kind: u8, addr: u32) {}

    /// Trace data was dropped at source.
    fn overflow(&mut self, ts: u64) {}

    /// A malformed packet was skipped.
    fn error(&mut self, ts: u64) {}

    /// The decoder lost synchronisation.
    fn unsynced(&mut self, ts: u64) {}
}

/// Sink for the reserved filewriter software channel.
pub trait FileWriter {
    fn write(&mut self, ts: u64, len: u8, value: u32);
}

/// Routes each decoded message to the registered sink, on the pump
/// thread, in stream order. Messages arrive by value; nothing is
/// retained.
pub struct Dispatcher {
    sink: Box<dyn MessageSink + Send>,
    filewriter: Option<Box<dyn FileWriter + Send>>,
}

impl Dispatcher {
    pub fn new(sink: Box<dyn MessageSink + Send>) -> Dispatcher {
        Dispatcher {
            sink,
            filewriter: None,
        }
    }

    /// Attaches a filewriter sink; software messages on
    /// [`FILEWRITER_CHANNEL`](FILEWRITER_CHANNEL) are steered to it
    /// instead of the normal sink.
    pub fn set_filewriter(&mut self, filewriter: Box<dyn FileWriter + Send>) {
        self.filewriter = Some(filewriter);
    }

    pub fn dispatch(&mut self, message: &Timestamped) {
        let ts = message.ts;
        match message.message {
            ItmMessage::Software { addr, len, value } => {
                if addr == FILEWRITER_CHANNEL {
                    if let Some(ref mut fw) = self.filewriter {
                        fw.write(ts, len, value);
                        return;
                    }
                }
                self.sink.software(ts, addr, len, value);
            }
            ItmMessage::Timestamp { inc, status } => self.sink.timestamp(ts, inc, status),
            ItmMessage::Exception { number, event } => self.sink.exception(ts, number, event),
            ItmMessage::PcSample { pc, sleep } => self.sink.pc_sample(ts, pc, sleep),
            ItmMessage::DwtEvent {
                cpi,
                exc,
                sleep,
                lsu,
                fold,
                cyc,
            } => self.sink.dwt_event(ts, cpi, exc, sleep, lsu, fold, cyc),
            ItmMessage::DataRww {
                comparator,
                write,
                data,
            } => self.sink.data_rww(ts, comparator, write, data),
            ItmMessage::DataAccess { comparator, data } => {
                self.sink.data_access(ts, comparator, data)
            }
            ItmMessage::DataOffset { comparator, offset } => {
                self.sink.data_offset(ts, comparator, offset)
            }
            ItmMessage::NiSync { kind, addr } => self.sink.ni_sync(ts, kind, addr),
            ItmMessage::Overflow => self.sink.overflow(ts),
            ItmMessage::Error => self.sink.error(ts),
            ItmMessage::Unsynced => self.sink.unsynced(ts),
        }
    }
}

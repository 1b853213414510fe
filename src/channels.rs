//! Per-channel publication sinks.
//!
//! Each enabled software channel is published at `{base}{name}` as a
//! named pipe (or a regular file in permafile mode), fed by its own
//! writer thread over a bounded, lossy pipe. Hardware messages are
//! published on a shared FIFO as one ASCII record per event.

use std::io::{self, Write};
use std::path::Path;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;

use crate::dispatch::MessageSink;
use crate::fmt;
use crate::itm::{ExceptionEvent, TimestampStatus};

/// Number of software stimulus channels.
pub const NUM_CHANNELS: usize = 32;

/// Name of the shared hardware-event FIFO.
pub const HWFIFO_NAME: &str = "hwevent";

/// Upper bound on the bytes any single event may publish.
pub const MAX_EVENT_LEN: usize = 100;

/// Events queued towards a writer thread before loss sets in.
const PIPE_DEPTH: usize = 64;

/// Hardware record kinds, the first field of each hardware FIFO line.
pub const HWEVENT_EXCEPTION: u8 = 0;
pub const HWEVENT_DWT: u8 = 1;
pub const HWEVENT_PCSAMPLE: u8 = 2;
pub const HWEVENT_RWWT: u8 = 3;
pub const HWEVENT_AWP: u8 = 4;
pub const HWEVENT_OFS: u8 = 5;
pub const HWEVENT_TS: u8 = 6;
pub const HWEVENT_NISYNC: u8 = 7;

/// A software channel to publish.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// Stimulus channel number, 0..=31.
    pub channel: u8,

    /// File name under the base path.
    pub name: String,

    /// Optional printf-style template; without one the raw payload
    /// bytes are published.
    pub format: Option<String>,
}

/// Where and how channels are published.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Path prefix; the channel name is appended verbatim.
    pub base: String,

    /// Publish regular files (created `0644`, truncated on open)
    /// instead of named pipes.
    pub permafile: bool,
}

struct ChannelSink {
    tx: SyncSender<Vec<u8>>,
    format: Option<String>,
}

/// Publication router: a [`MessageSink`] that renders messages into
/// per-channel pipes and hardware records.
///
/// Writes towards a slow or absent consumer are lossy: once a channel's
/// pipe is full further events for it are counted and discarded, never
/// stalling the pump thread.
pub struct FifoRouter {
    channels: Vec<Option<ChannelSink>>,
    hw: Option<ChannelSink>,
    last_hw_ts: u64,
    dropped: u64,
    handles: Vec<thread::JoinHandle<()>>,
}

impl FifoRouter {
    /// Creates the channel files and writer threads. Fails on the first
    /// channel that cannot be created.
    pub fn create(options: &ChannelOptions, specs: &[ChannelSpec]) -> io::Result<FifoRouter> {
        let mut router = FifoRouter {
            channels: (0..NUM_CHANNELS).map(|_| None).collect(),
            hw: None,
            last_hw_ts: 0,
            dropped: 0,
            handles: vec![],
        };

        for spec in specs {
            let path = format!("{}{}", options.base, spec.name);
            let (tx, handle) = spawn_writer(path, options.permafile)?;
            router.handles.push(handle);
            router.channels[usize::from(spec.channel) % NUM_CHANNELS] = Some(ChannelSink {
                tx,
                format: spec.format.clone(),
            });
        }

        let hw_path = format!("{}{}", options.base, HWFIFO_NAME);
        let (tx, handle) = spawn_writer(hw_path, options.permafile)?;
        router.handles.push(handle);
        router.hw = Some(ChannelSink { tx, format: None });

        Ok(router)
    }

    /// Events discarded because a consumer could not keep up.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drops the feeding ends and waits for the writer threads to flush
    /// and exit. Meaningful in permafile mode; a pipe writer still
    /// waiting for its first reader never finishes.
    pub fn close(mut self) {
        self.channels.clear();
        self.hw = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    fn send(sink: &mut Option<ChannelSink>, dropped: &mut u64, mut event: Vec<u8>) {
        event.truncate(MAX_EVENT_LEN);
        if let Some(ref s) = sink {
            match s.tx.try_send(event) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => *dropped += 1,
                Err(TrySendError::Disconnected(_)) => {
                    // Writer died on an I/O failure; tear the sink down
                    // and keep decoding.
                    *sink = None;
                }
            }
        }
    }

    fn hw_record(&mut self, ts: u64, kind: u8, fields: &str) {
        let delta = ts.saturating_sub(self.last_hw_ts);
        self.last_hw_ts = ts;
        let line = format!("{},{},{}\n", kind, delta, fields);
        FifoRouter::send(&mut self.hw, &mut self.dropped, line.into_bytes());
    }
}

impl MessageSink for FifoRouter {
    fn software(&mut self, _ts: u64, addr: u8, len: u8, value: u32) {
        let index = usize::from(addr) % NUM_CHANNELS;
        let (event, present) = match self.channels[index] {
            Some(ref sink) => match sink.format {
                Some(ref template) => (fmt::render(template, value, len).into_bytes(), true),
                // Unformatted channels publish the payload itself:
                // the value bytes, little-endian, truncated to the
                // written length.
                None => (value.to_le_bytes()[..usize::from(len.min(4))].to_vec(), true),
            },
            None => (vec![], false),
        };
        if present {
            FifoRouter::send(&mut self.channels[index], &mut self.dropped, event);
        }
    }

    fn timestamp(&mut self, ts: u64, inc: u32, status: TimestampStatus) {
        let status = match status {
            TimestampStatus::Exact => 0,
            TimestampStatus::TimestampDelayed => 1,
            TimestampStatus::PacketDelayed => 2,
            TimestampStatus::BothDelayed => 3,
        };
        self.hw_record(ts, HWEVENT_TS, &format!("{},{}", status, inc));
    }

    fn exception(&mut self, ts: u64, number: u16, event: ExceptionEvent) {
        let event = match event {
            ExceptionEvent::Enter => "Enter",
            ExceptionEvent::Exit => "Exit",
            ExceptionEvent::Resume => "Resume",
        };
        let fields = format!("{},{}", number, exception_name(number));
        self.hw_record(ts, HWEVENT_EXCEPTION, &format!("{},{}", fields, event));
    }

    fn pc_sample(&mut self, ts: u64, pc: u32, sleep: bool) {
        if sleep {
            self.hw_record(ts, HWEVENT_PCSAMPLE, "**SLEEP**");
        } else {
            self.hw_record(ts, HWEVENT_PCSAMPLE, &format!("0x{:08x}", pc));
        }
    }

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
        let mut bitmap = 0u8;
        for (i, set) in [cpi, exc, sleep, lsu, fold, cyc].iter().enumerate() {
            if *set {
                bitmap |= 1 << i;
            }
        }
        self.hw_record(ts, HWEVENT_DWT, &format!("0x{:02x}", bitmap));
    }

    fn data_rww(&mut self, ts: u64, comparator: u8, write: bool, data: u32) {
        let dir = if write { "W" } else { "R" };
        self.hw_record(
            ts,
            HWEVENT_RWWT,
            &format!("{},{},0x{:x}", comparator, dir, data),
        );
    }

    fn data_access(&mut self, ts: u64, comparator: u8, data: u32) {
        self.hw_record(ts, HWEVENT_AWP, &format!("{},0x{:08x}", comparator, data));
    }

    fn data_offset(&mut self, ts: u64, comparator: u8, offset: u16) {
        self.hw_record(ts, HWEVENT_OFS, &format!("{},0x{:04x}", comparator, offset));
    }

    fn ni_sync(&mut self, ts: u64, kind: u8, addr: u32) {
        self.hw_record(ts, HWEVENT_NISYNC, &format!("{},0x{:08x}", kind, addr));
    }
}

/// Names for the architectural ARMv7-M exception numbers; external
/// interrupts are reported by index.
pub fn exception_name(number: u16) -> String {
    match number {
        0 => "Thread".to_string(),
        1 => "Reset".to_string(),
        2 => "NMI".to_string(),
        3 => "HardFault".to_string(),
        4 => "MemManage".to_string(),
        5 => "BusFault".to_string(),
        6 => "UsageFault".to_string(),
        11 => "SVCall".to_string(),
        12 => "DebugMonitor".to_string(),
        14 => "PendSV".to_string(),
        15 => "SysTick".to_string(),
        n if n >= 16 => format!("IRQ{}", n - 16),
        n => format!("Reserved{}", n),
    }
}

/// Creates the channel file and its writer thread, returning the
/// feeding end of the pipe.
fn spawn_writer(path: String, permafile: bool) -> io::Result<(SyncSender<Vec<u8>>, thread::JoinHandle<()>)> {
    if !permafile {
        match nix::unistd::mkfifo(
            Path::new(&path),
            nix::sys::stat::Mode::from_bits_truncate(0o644),
        ) {
            Ok(()) => (),
            Err(nix::errno::Errno::EEXIST) => (),
            Err(e) => return Err(io::Error::from(e)),
        }
    }

    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(PIPE_DEPTH);
    let handle = thread::Builder::new()
        .name(format!("writer:{}", path))
        .spawn(move || loop {
            // Opening a pipe for writing blocks until a reader appears;
            // permafiles are created (and truncated) immediately.
            let mut file = if permafile {
                match std::fs::File::create(&path) {
                    Ok(f) => f,
                    Err(e) => {
                        log::warn!("cannot create {}: {}", path, e);
                        return;
                    }
                }
            } else {
                match std::fs::OpenOptions::new().write(true).open(&path) {
                    Ok(f) => f,
                    Err(e) => {
                        log::warn!("cannot open {}: {}", path, e);
                        return;
                    }
                }
            };

            loop {
                match rx.recv() {
                    Ok(event) => {
                        if file.write_all(&event).is_err() {
                            log::debug!("consumer left {}", path);
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            if permafile {
                // A failed file write will not recover.
                return;
            }
        })?;

    Ok((tx, handle))
}

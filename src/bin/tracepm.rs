use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use structopt::StructOpt;

use traceport::etm::{Changes, CpuState, EtmReport};
use traceport::dispatch::MessageSink;
use traceport::session::{Session, SessionConfig};
use traceport::source::{self, FeedOptions, Source};

/// Exit code for unusable options.
const EXIT_BAD_OPTION: i32 = -1;

/// Exit code for an input file that cannot be opened.
const EXIT_BAD_FILE: i32 = -4;

/// Pacing of the idle loop.
const TICK: Duration = Duration::from_millis(100);

/// Rate statistics cadence.
const INTERVAL: Duration = Duration::from_secs(1);

/// Dump the capture after this long without new data.
const HANG: Duration = Duration::from_millis(200);

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Captures the most recent window of an ETM instruction-trace stream into a ring and decodes it when the stream pauses or ends."
)]
struct Opt {
    #[structopt(
        short = "f",
        long = "file",
        parse(from_os_str),
        help = "Read from this capture file instead of the network"
    )]
    file: Option<PathBuf>,

    #[structopt(
        short = "s",
        long = "server",
        help = "Trace server as host:port. Default localhost; the port is TRACEPORT_SERVER_PORT+1 for a raw stream, or the base port with TPIU framing."
    )]
    server: Option<String>,

    #[structopt(
        short = "t",
        long = "tpiu",
        help = "Input is TPIU-framed; capture this stream"
    )]
    tpiu_stream: Option<u8>,

    #[structopt(
        short = "b",
        long = "buffer",
        default_value = "32",
        help = "Capture ring size in KiB"
    )]
    buffer_kib: usize,

    #[structopt(short = "E", long = "eof", help = "Decode once and terminate at end of input")]
    end_at_eof: bool,

    #[structopt(
        long = "single-shot",
        help = "Freeze the capture when the ring fills instead of keeping the newest window"
    )]
    single_shot: bool,

    #[structopt(
        long = "context",
        default_value = "0",
        help = "Context-ID bytes the target emits (0, 1, 2 or 4)"
    )]
    context_bytes: u8,

    #[structopt(
        short = "v",
        long = "verbose",
        default_value = "2",
        help = "Diagnostic verbosity, 0 (errors) to 4 (trace)"
    )]
    verbosity: u8,
}

/// Sink for the few ITM-shaped messages the post-mortem path produces
/// (instruction-stream sync points).
struct PmSink;

impl MessageSink for PmSink {
    fn ni_sync(&mut self, ts: u64, kind: u8, addr: u32) {
        log::debug!("isync kind {} at {:#010x} (ts {})", kind, addr, ts);
    }
}

fn print_state(cpu: &CpuState, changes: Changes) {
    if changes.contains(Changes::ADDRESS) {
        let mode = if cpu.thumb {
            "T"
        } else if cpu.jazelle {
            "J"
        } else {
            "A"
        };
        println!("{:#010x} [{}]", cpu.addr, mode);
    }
    if changes.contains(Changes::ATOMS) {
        println!(
            "  atoms: {}E {}N disposition {:#x}",
            cpu.eatoms, cpu.natoms, cpu.disposition
        );
    }
    if changes.contains(Changes::EXCEPTION_ENTRY) {
        println!("  exception enter {}", cpu.exception);
    }
    if changes.contains(Changes::EXCEPTION_EXIT) {
        println!("  exception exit");
    }
    if changes.contains(Changes::CONTEXT_ID) {
        println!("  context {:#x}", cpu.context_id);
    }
    if changes.contains(Changes::CYCLE_COUNT) {
        println!("  cycles {}", cpu.cycle_count);
    }
}

fn dump(session: &mut Session) {
    let captured = session.ring().map(|r| r.len()).unwrap_or(0);
    log::info!("decoding {} captured bytes", captured);

    let mut reports = 0u64;
    session.decode_postmortem(print_state, |report| {
        if let EtmReport::BadPacket { header } = report {
            log::trace!("skipped byte {:#04x}", header);
        }
        reports += 1;
    });

    let stdout = std::io::stdout();
    let _ = stdout.lock().flush();
    log::debug!("{} stream reports", reports);
}

fn run(opt: &Opt) -> Result<()> {
    if !matches!(opt.context_bytes, 0 | 1 | 2 | 4) {
        bail!("context-ID size must be 0, 1, 2 or 4");
    }

    let source = match (&opt.file, &opt.server) {
        (Some(file), _) => Source::File(file.clone()),
        (None, Some(server)) => Source::Net(server.clone()),
        (None, None) => {
            // With TPIU framing the base port carries the muxed stream;
            // a raw instruction stream is published one port up.
            let port = if opt.tpiu_stream.is_some() {
                source::server_port()
            } else {
                source::server_port() + 1
            };
            Source::Net(format!("localhost:{}", port))
        }
    };

    let config = SessionConfig {
        use_tpiu: opt.tpiu_stream.is_some(),
        pm_stream: opt
            .tpiu_stream
            .unwrap_or(traceport::session::DEFAULT_PM_STREAM),
        decode_itm: false,
        pm_capacity: Some(opt.buffer_kib.saturating_mul(1024)),
        single_shot: opt.single_shot,
        context_bytes: opt.context_bytes,
        ..SessionConfig::default()
    };
    let mut session = Session::new(config, Box::new(PmSink));

    let options = FeedOptions {
        end_at_eof: opt.end_at_eof,
        read_timeout: Some(TICK),
    };

    let mut last_data = Instant::now();
    let mut last_interval = Instant::now();
    let mut interval_bytes = 0u64;
    let mut pending = false;

    source::feed(&source, &options, |chunk| {
        let now = Instant::now();

        if !chunk.is_empty() {
            session.pump_bytes(chunk);
            interval_bytes += chunk.len() as u64;
            last_data = now;
            pending = true;
        }

        if now.duration_since(last_interval) >= INTERVAL {
            if interval_bytes > 0 {
                log::info!("{} bytes/s", interval_bytes);
            }
            interval_bytes = 0;
            last_interval = now;
        }

        let held = session.ring().map(|r| r.held()).unwrap_or(false);
        let idle = now.duration_since(last_data) >= HANG;
        let captured = session.ring().map(|r| !r.is_empty()).unwrap_or(false);

        if pending && captured && (idle || held) {
            dump(&mut session);
            pending = false;
            if held {
                session.release_ring();
            }
        }

        true
    })
    .with_context(|| "trace source failed")?;

    // End of input: decode whatever the ring holds.
    if pending {
        dump(&mut session);
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:5} {}",
                chrono::Utc::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .filter_level(level)
        .init();
}

fn main() {
    let opt = Opt::from_args();
    init_logging(opt.verbosity);

    if let Err(e) = run(&opt) {
        eprintln!("{:#}", e);
        let code = if e.downcast_ref::<traceport::Error>().map_or(false, |e| {
            matches!(e, traceport::Error::FileOpen { .. })
        }) {
            EXIT_BAD_FILE
        } else {
            EXIT_BAD_OPTION
        };
        std::process::exit(code);
    }
}

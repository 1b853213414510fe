use std::io::Write;
use std::path::PathBuf;

use structopt::StructOpt;

use traceport::channels::{ChannelOptions, ChannelSpec, FifoRouter, NUM_CHANNELS};
use traceport::dispatch::MessageSink;
use traceport::fmt;
use traceport::itm::{ExceptionEvent, TimestampStatus};
use traceport::session::{Session, SessionConfig};
use traceport::source::{self, FeedOptions, Source};

/// Exit code for unusable options.
const EXIT_BAD_OPTION: i32 = -1;

/// Exit code for an input file that cannot be opened.
const EXIT_BAD_FILE: i32 = -4;

/// Exit code for a failed network source.
const EXIT_BAD_NET: i32 = -2;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Decodes an ARM Cortex-M trace stream (TPIU-framed or raw ITM) into per-channel output: formatted text on stdout, or named-pipe publication per channel."
)]
struct Opt {
    #[structopt(short = "e", long = "eof", help = "Terminate when the source reaches end of file")]
    end_at_eof: bool,

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
        help = "Trace server as host:port. Default localhost with the port from TRACEPORT_SERVER_PORT."
    )]
    server: Option<String>,

    #[structopt(
        short = "t",
        long = "tpiu",
        help = "Input is TPIU-framed; decode ITM from this stream"
    )]
    tpiu_stream: Option<u8>,

    #[structopt(
        short = "n",
        long = "no-sync",
        help = "Do not require ITM synchronisation before decoding"
    )]
    relax_sync: bool,

    #[structopt(
        short = "c",
        long = "channel",
        number_of_values = 1,
        help = "Enable a channel: N,FORMAT or N,NAME,FORMAT (repeatable). An empty format publishes the raw payload."
    )]
    channels: Vec<String>,

    #[structopt(
        short = "v",
        long = "verbose",
        default_value = "2",
        help = "Diagnostic verbosity, 0 (errors) to 4 (trace)"
    )]
    verbosity: u8,

    #[structopt(
        short = "P",
        long = "chan-path",
        help = "Publish channels under this path prefix instead of printing to stdout"
    )]
    chan_path: Option<String>,

    #[structopt(
        short = "p",
        long = "permafile",
        help = "Publish regular files (truncated on open) instead of named pipes"
    )]
    permafile: bool,
}

/// One `-c` argument: `N,FORMAT` or `N,NAME,FORMAT`.
fn parse_channel(arg: &str) -> std::result::Result<ChannelSpec, String> {
    let mut parts = arg.splitn(3, ',');
    let channel: u8 = parts
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| format!("bad channel number in {:?}", arg))?;
    if usize::from(channel) >= NUM_CHANNELS {
        return Err(format!("channel {} out of range 0..=31", channel));
    }

    let second = parts.next();
    let third = parts.next();
    let (name, format) = match (second, third) {
        (Some(name), Some(format)) => (name.to_string(), format.to_string()),
        (Some(format), None) => (format!("chan{:02}", channel), format.to_string()),
        _ => return Err(format!("missing format in {:?}", arg)),
    };

    Ok(ChannelSpec {
        channel,
        name,
        format: if format.is_empty() {
            None
        } else {
            Some(format)
        },
    })
}

/// Prints decoded messages on stdout: configured channels through their
/// templates, everything else as one line per message.
struct ConsoleSink {
    formats: Vec<Option<String>>,

    /// At least one channel was configured: only those are shown.
    selective: bool,
}

impl ConsoleSink {
    fn new(specs: &[ChannelSpec]) -> ConsoleSink {
        let mut formats: Vec<Option<String>> = (0..NUM_CHANNELS).map(|_| None).collect();
        for spec in specs {
            formats[usize::from(spec.channel)] = spec.format.clone();
        }
        ConsoleSink {
            formats,
            selective: !specs.is_empty(),
        }
    }

    fn line(&self, text: String) {
        if !self.selective {
            println!("{}", text);
        }
    }
}

impl MessageSink for ConsoleSink {
    fn software(&mut self, ts: u64, addr: u8, len: u8, value: u32) {
        match self.formats[usize::from(addr)] {
            Some(ref template) => {
                let stdout = std::io::stdout();
                let mut stdout = stdout.lock();
                let _ = stdout.write_all(fmt::render(template, value, len).as_bytes());
                let _ = stdout.flush();
            }
            None => self.line(format!(
                "{} SW ch{} {}B {:#010x}",
                ts, addr, len, value
            )),
        }
    }

    fn timestamp(&mut self, ts: u64, inc: u32, _status: TimestampStatus) {
        log::trace!("local timestamp +{} -> {}", inc, ts);
    }

    fn exception(&mut self, ts: u64, number: u16, event: ExceptionEvent) {
        self.line(format!("{} EXC {} {:?}", ts, number, event));
    }

    fn pc_sample(&mut self, ts: u64, pc: u32, sleep: bool) {
        if sleep {
            self.line(format!("{} PC **SLEEP**", ts));
        } else {
            self.line(format!("{} PC {:#010x}", ts, pc));
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
        let mut names = vec![];
        for (set, name) in [
            (cpi, "CPI"),
            (exc, "Exc"),
            (sleep, "Sleep"),
            (lsu, "LSU"),
            (fold, "Fold"),
            (cyc, "Cyc"),
        ]
        .iter()
        {
            if *set {
                names.push(*name);
            }
        }
        self.line(format!("{} DWT {}", ts, names.join("+")));
    }

    fn data_rww(&mut self, ts: u64, comparator: u8, write: bool, data: u32) {
        let dir = if write { "W" } else { "R" };
        self.line(format!("{} WP{} {} {:#x}", ts, comparator, dir, data));
    }

    fn data_access(&mut self, ts: u64, comparator: u8, data: u32) {
        self.line(format!("{} AWP{} {:#010x}", ts, comparator, data));
    }

    fn data_offset(&mut self, ts: u64, comparator: u8, offset: u16) {
        self.line(format!("{} OFS{} {:#06x}", ts, comparator, offset));
    }

    fn overflow(&mut self, ts: u64) {
        log::warn!("overflow at ts {}", ts);
    }

    fn unsynced(&mut self, ts: u64) {
        log::debug!("lost ITM sync at ts {}", ts);
    }
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

    let mut specs = vec![];
    for arg in &opt.channels {
        match parse_channel(arg) {
            Ok(spec) => specs.push(spec),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(EXIT_BAD_OPTION);
            }
        }
    }

    let source = match (&opt.file, &opt.server) {
        (Some(file), _) => Source::File(file.clone()),
        (None, Some(server)) => Source::Net(server.clone()),
        (None, None) => Source::Net(format!("localhost:{}", source::server_port())),
    };

    let config = SessionConfig {
        use_tpiu: opt.tpiu_stream.is_some(),
        itm_stream: opt.tpiu_stream.unwrap_or(traceport::session::DEFAULT_ITM_STREAM),
        strict_itm_sync: !opt.relax_sync,
        ..SessionConfig::default()
    };

    let sink: Box<dyn MessageSink + Send> = match opt.chan_path {
        Some(ref base) => {
            let options = ChannelOptions {
                base: base.clone(),
                permafile: opt.permafile,
            };
            match FifoRouter::create(&options, &specs) {
                Ok(router) => Box::new(router),
                Err(e) => {
                    eprintln!("cannot create channel sinks under {}: {}", base, e);
                    std::process::exit(EXIT_BAD_FILE);
                }
            }
        }
        None => Box::new(ConsoleSink::new(&specs)),
    };

    let mut session = Session::new(config, sink);
    let options = FeedOptions {
        end_at_eof: opt.end_at_eof,
        read_timeout: None,
    };

    let result = source::feed(&source, &options, |chunk| {
        session.pump_bytes(chunk);
        true
    });

    log::info!(
        "done: {} frames, {} messages, {} ITM errors",
        session.frame_stats().frames,
        session.itm_stats().packets,
        session.itm_stats().errors,
    );

    if let Err(e) = result {
        eprintln!("{}", e);
        let code = match e {
            traceport::Error::Net { .. } => EXIT_BAD_NET,
            _ => EXIT_BAD_FILE,
        };
        std::process::exit(code);
    }
}

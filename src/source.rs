//! Byte sources feeding the decode pump.
//!
//! A session reads from either a capture file (optionally tailed past
//! EOF) or a TCP trace server. Network sources reconnect after a short
//! backoff; end-at-EOF configurations short-circuit the retry loops.

use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

/// Bytes requested from the source per read call.
pub const TRANSFER_SIZE: usize = 4096;

/// Environment variable naming the trace server port.
pub const SERVER_PORT_VAR: &str = "TRACEPORT_SERVER_PORT";

/// Port used when [`SERVER_PORT_VAR`](SERVER_PORT_VAR) is unset.
pub const DEFAULT_SERVER_PORT: u16 = 3443;

/// Delay before reopening a failed or drained source.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// The trace server port from the environment, or the default.
pub fn server_port() -> u16 {
    std::env::var(SERVER_PORT_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SERVER_PORT)
}

/// Where trace bytes come from.
#[derive(Debug, Clone)]
pub enum Source {
    /// A capture file or named pipe.
    File(PathBuf),

    /// A TCP trace server, `host:port`.
    Net(String),
}

/// Source behaviour switches.
#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    /// Stop at end of input instead of waiting for more.
    pub end_at_eof: bool,

    /// Read timeout for network sources. On expiry the pump callback is
    /// invoked with an empty buffer so the caller can run its timers.
    pub read_timeout: Option<Duration>,
}

/// Reads the source to exhaustion, handing each buffer to `pump`. The
/// callback returns `false` to stop the feed.
pub fn feed<F>(source: &Source, options: &FeedOptions, mut pump: F) -> Result<(), Error>
where
    F: FnMut(&[u8]) -> bool,
{
    match source {
        Source::File(path) => feed_file(path, options, &mut pump),
        Source::Net(addr) => feed_net(addr, options, &mut pump),
    }
}

fn feed_file<F>(path: &PathBuf, options: &FeedOptions, pump: &mut F) -> Result<(), Error>
where
    F: FnMut(&[u8]) -> bool,
{
    let mut file = std::fs::File::open(path).map_err(|source| Error::FileOpen {
        path: path.clone(),
        source,
    })?;

    let mut buf = [0u8; TRANSFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            if options.end_at_eof {
                return Ok(());
            }
            // Tail the file: new bytes may still be appended.
            std::thread::sleep(RECONNECT_BACKOFF);
            if !pump(&[]) {
                return Ok(());
            }
            continue;
        }
        if !pump(&buf[..n]) {
            return Ok(());
        }
    }
}

fn feed_net<F>(addr: &str, options: &FeedOptions, pump: &mut F) -> Result<(), Error>
where
    F: FnMut(&[u8]) -> bool,
{
    let mut buf = [0u8; TRANSFER_SIZE];

    loop {
        let stream = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(source) => {
                if options.end_at_eof {
                    return Err(Error::Net {
                        addr: addr.to_string(),
                        source,
                    });
                }
                log::info!("waiting for {}: {}", addr, source);
                std::thread::sleep(RECONNECT_BACKOFF);
                continue;
            }
        };
        stream.set_read_timeout(options.read_timeout)?;
        log::info!("connected to {}", addr);

        let mut stream = stream;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    // Server went away.
                    if options.end_at_eof {
                        return Ok(());
                    }
                    log::info!("{} closed, reconnecting", addr);
                    std::thread::sleep(RECONNECT_BACKOFF);
                    break;
                }
                Ok(n) => {
                    if !pump(&buf[..n]) {
                        return Ok(());
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    // Timer tick for the caller.
                    if !pump(&[]) {
                        return Ok(());
                    }
                }
                Err(e) => {
                    if options.end_at_eof {
                        return Err(Error::Net {
                            addr: addr.to_string(),
                            source: e,
                        });
                    }
                    log::warn!("read from {} failed: {}", addr, e);
                    std::thread::sleep(RECONNECT_BACKOFF);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_feed_to_eof() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1, 2, 3, 4, 5]).unwrap();

        let mut seen = vec![];
        let options = FeedOptions {
            end_at_eof: true,
            read_timeout: None,
        };
        feed(
            &Source::File(tmp.path().to_path_buf()),
            &options,
            |chunk| {
                seen.extend_from_slice(chunk);
                true
            },
        )
        .unwrap();
        assert_eq!(seen, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let options = FeedOptions {
            end_at_eof: true,
            read_timeout: None,
        };
        let result = feed(
            &Source::File(PathBuf::from("/nonexistent/trace.bin")),
            &options,
            |_| true,
        );
        match result {
            Err(Error::FileOpen { .. }) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn callback_can_stop_early() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0; 64]).unwrap();

        let mut calls = 0;
        let options = FeedOptions {
            end_at_eof: false,
            read_timeout: None,
        };
        feed(
            &Source::File(tmp.path().to_path_buf()),
            &options,
            |_| {
                calls += 1;
                false
            },
        )
        .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn net_feed_reads_stream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[9, 8, 7]).unwrap();
        });

        let mut seen = vec![];
        let options = FeedOptions {
            end_at_eof: true,
            read_timeout: None,
        };
        feed(&Source::Net(addr.to_string()), &options, |chunk| {
            seen.extend_from_slice(chunk);
            true
        })
        .unwrap();
        assert_eq!(seen, [9, 8, 7]);
    }

    #[test]
    fn default_port_from_environment() {
        assert_eq!(server_port(), DEFAULT_SERVER_PORT);
    }
}

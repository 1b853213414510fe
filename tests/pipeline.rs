//! End-to-end tests over the decode pipeline: synthetic TPIU frames in,
//! typed messages and published channel content out.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use traceport::channels::{ChannelOptions, ChannelSpec, FifoRouter, HWFIFO_NAME};
use traceport::dispatch::MessageSink;
use traceport::itm::{ItmDecoder, ItmEvent, ItmMessage, TimestampStatus, Timestamped};
use traceport::session::{Session, SessionConfig, DEFAULT_ITM_STREAM};
use traceport::tpiu::{FrameDecoder, FrameEvent, StreamByte, FRAME_LENGTH};

const TPIU_SYNC: [u8; 4] = [0xFF, 0xFF, 0xFF, 0x7F];

/// Encodes `(stream, data)` items into one TPIU frame: stream changes in
/// even slots, true LSBs of even-slot data in the auxiliary byte,
/// remainder padded onto the null stream.
fn encode_frame(items: &[StreamByte], initial_stream: u8) -> [u8; FRAME_LENGTH] {
    let mut frame = [0u8; FRAME_LENGTH];
    let mut aux = 0u8;
    let mut pos = 0;
    let mut stream = initial_stream;
    let mut it = items.iter().peekable();

    while pos < FRAME_LENGTH - 1 {
        if let Some(item) = it.peek() {
            if pos % 2 == 0 {
                if item.stream != stream {
                    stream = item.stream;
                    frame[pos] = (stream << 1) | 1;
                } else {
                    let item = it.next().unwrap();
                    frame[pos] = item.data & !1;
                    if item.data & 1 != 0 {
                        aux |= 1 << (pos / 2);
                    }
                }
            } else {
                assert_eq!(item.stream, stream);
                frame[pos] = it.next().unwrap().data;
            }
        } else if pos % 2 == 0 {
            stream = 0;
            frame[pos] = 1;
        }
        pos += 1;
    }

    frame[FRAME_LENGTH - 1] = aux;
    frame
}

fn frames_for(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = TPIU_SYNC.to_vec();
    for chunk in payload.chunks(14) {
        let items: Vec<StreamByte> = chunk
            .iter()
            .map(|b| StreamByte { stream, data: *b })
            .collect();
        out.extend_from_slice(&encode_frame(&items, 0));
    }
    out
}

#[derive(Default)]
struct Collector {
    messages: Arc<Mutex<Vec<Timestamped>>>,
}

impl MessageSink for Collector {
    fn software(&mut self, ts: u64, addr: u8, len: u8, value: u32) {
        self.messages.lock().unwrap().push(Timestamped {
            ts,
            message: ItmMessage::Software { addr, len, value },
        });
    }

    fn timestamp(&mut self, ts: u64, inc: u32, status: TimestampStatus) {
        self.messages.lock().unwrap().push(Timestamped {
            ts,
            message: ItmMessage::Timestamp { inc, status },
        });
    }

    fn pc_sample(&mut self, ts: u64, pc: u32, sleep: bool) {
        self.messages.lock().unwrap().push(Timestamped {
            ts,
            message: ItmMessage::PcSample { pc, sleep },
        });
    }
}

fn collecting_session(config: SessionConfig) -> (Session, Arc<Mutex<Vec<Timestamped>>>) {
    let messages = Arc::new(Mutex::new(vec![]));
    let sink = Collector {
        messages: messages.clone(),
    };
    (Session::new(config, Box::new(sink)), messages)
}

#[test]
fn tpiu_frame_roundtrip() {
    // Items survive framing and demultiplexing exactly, in order.
    // Stream switches land on even frame slots.
    let items: Vec<StreamByte> = vec![
        StreamByte { stream: 1, data: 0x03 },
        StreamByte { stream: 1, data: 0x41 },
        StreamByte { stream: 1, data: 0xFE },
        StreamByte { stream: 2, data: 0x55 },
        StreamByte { stream: 2, data: 0xAA },
        StreamByte { stream: 2, data: 0x77 },
        StreamByte { stream: 1, data: 0x99 },
    ];

    let mut decoder = FrameDecoder::new();
    for b in TPIU_SYNC.iter() {
        decoder.pump(*b);
    }

    // Three stream changes plus seven data bytes fit one frame.
    let frame = encode_frame(&items, 0);
    let mut last = FrameEvent::None;
    for b in frame.iter() {
        last = decoder.pump(*b);
    }
    assert_eq!(last, FrameEvent::RxedPacket);

    let decoded: Vec<StreamByte> = decoder
        .packet()
        .bytes
        .into_iter()
        .filter(|b| b.stream != 0)
        .collect();
    assert_eq!(decoded, items);
}

#[test]
fn demux_emits_subsequence_per_stream() {
    // The bytes attributed to one stream are a subsequence of the bytes
    // framed for it; nothing is fabricated.
    let payload: Vec<u8> = (0u8..98).collect();
    let stream = frames_for(3, &payload);

    let mut decoder = FrameDecoder::new();
    let mut seen: Vec<u8> = vec![];
    for b in stream.iter() {
        if decoder.pump(*b) == FrameEvent::RxedPacket {
            for item in decoder.packet().bytes {
                if item.stream == 3 {
                    seen.push(item.data);
                }
            }
        }
    }

    assert_eq!(seen, payload);
}

#[test]
fn rxed_packets_consume_sixteen_bytes_modulo_half_syncs() {
    let payload: Vec<u8> = (0u8..28).map(|b| b & !1).collect();
    let mut stream = TPIU_SYNC.to_vec();
    let frames = frames_for(1, &payload);
    // Intersperse half-syncs at frame boundaries past the sync.
    stream.extend_from_slice(&[0xFF, 0x7F]);
    stream.extend_from_slice(&frames[4..4 + FRAME_LENGTH]);
    stream.extend_from_slice(&[0xFF, 0x7F, 0xFF, 0x7F]);
    stream.extend_from_slice(&frames[4 + FRAME_LENGTH..]);

    let mut decoder = FrameDecoder::new();
    let mut packets = 0;
    let mut bytes_since = 0u64;
    let mut half_syncs_at_last = 0u64;
    for b in stream.iter() {
        bytes_since += 1;
        match decoder.pump(*b) {
            FrameEvent::NewSync | FrameEvent::Synced => bytes_since = 0,
            FrameEvent::RxedPacket => {
                let half_syncs = decoder.stats().half_syncs;
                assert_eq!(
                    bytes_since,
                    FRAME_LENGTH as u64 + 2 * (half_syncs - half_syncs_at_last),
                    "frame boundary drifted"
                );
                half_syncs_at_last = half_syncs;
                packets += 1;
                bytes_since = 0;
            }
            _ => (),
        }
    }
    assert_eq!(packets, 2);
    assert_eq!(decoder.stats().half_syncs, 3);
}

#[test]
fn half_sync_scenario() {
    // Literal boundary case: a truncated sync, one half-sync pair, a
    // full sync. The decoder must be receiving with one half-sync
    // counted.
    let mut decoder = FrameDecoder::new();
    let mut events = vec![];
    for b in [0xFF, 0xFF, 0x7F, 0xFF, 0x7F, 0xFF, 0xFF, 0xFF, 0x7F].iter() {
        events.push(decoder.pump(*b));
    }

    assert!(events.contains(&FrameEvent::NewSync));
    assert_eq!(decoder.stats().half_syncs, 1);
    assert_eq!(decoder.stats().lost_sync, 0);
}

#[test]
fn stale_frame_scenario() {
    // A frame whose last byte arrives four seconds late is abandoned.
    let mut decoder = FrameDecoder::new();
    let start = Instant::now();
    for b in TPIU_SYNC.iter() {
        decoder.pump_at(*b, start);
    }

    let frame = encode_frame(
        &(0u8..15)
            .map(|i| StreamByte { stream: 1, data: i & !1 })
            .collect::<Vec<_>>(),
        1,
    );
    for b in frame[..15].iter() {
        decoder.pump_at(*b, start);
    }
    let event = decoder.pump_at(frame[15], start + Duration::from_secs(4));

    assert_eq!(event, FrameEvent::Unsynced);
    assert_eq!(decoder.stats().lost_sync, 1);
    assert_eq!(decoder.stats().frames, 0);
}

#[test]
fn software_channel_scenario() {
    // ITM header 0x03 (port 0, 4 bytes) then "ABCD" little-endian.
    let mut decoder = ItmDecoder::new(false);
    let mut message = None;
    for b in [0x03, 0x41, 0x42, 0x43, 0x44].iter() {
        if decoder.pump(*b) == ItmEvent::PacketRxed {
            message = decoder.message();
        }
    }

    assert_eq!(
        message.unwrap().message,
        ItmMessage::Software {
            addr: 0,
            len: 4,
            value: 0x4443_4241,
        }
    );
}

#[test]
fn timestamp_scenario() {
    // Header 0xD0, payload 0x81 0x02: increment (1 << 7) | 2.
    let mut decoder = ItmDecoder::new(false);
    let mut message = None;
    for b in [0xD0, 0x81, 0x02].iter() {
        if decoder.pump(*b) == ItmEvent::PacketRxed {
            message = decoder.message();
        }
    }

    match message.unwrap().message {
        ItmMessage::Timestamp { inc, status } => {
            assert_eq!(inc, 0x82);
            assert_eq!(status, TimestampStatus::TimestampDelayed);
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[test]
fn itm_message_roundtrip() {
    // Encode messages from their field values by the known bit layout,
    // decode, and compare field for field.
    struct Case {
        bytes: Vec<u8>,
        expect: ItmMessage,
    }

    let port5_len2 = (5u8 << 3) | 0b010;
    let cases = vec![
        Case {
            bytes: vec![port5_len2, 0xCD, 0xAB],
            expect: ItmMessage::Software {
                addr: 5,
                len: 2,
                value: 0xABCD,
            },
        },
        Case {
            bytes: vec![0x17, 0x78, 0x56, 0x34, 0x12],
            expect: ItmMessage::PcSample {
                pc: 0x1234_5678,
                sleep: false,
            },
        },
        Case {
            bytes: vec![0x0E, 0x2A, 0x30],
            expect: ItmMessage::Exception {
                number: 0x2A,
                event: traceport::itm::ExceptionEvent::Resume,
            },
        },
    ];

    for case in cases {
        let mut decoder = ItmDecoder::new(false);
        let mut got = None;
        for b in case.bytes.iter() {
            if decoder.pump(*b) == ItmEvent::PacketRxed {
                got = decoder.message();
            }
        }
        assert_eq!(got.unwrap().message, case.expect);
    }
}

#[test]
fn timestamps_are_monotone_through_the_session() {
    let config = SessionConfig {
        use_tpiu: true,
        ..SessionConfig::default()
    };
    let (mut session, messages) = collecting_session(config);

    #[rustfmt::skip]
    let payload = [
        0x01, 0x11,         // software
        0x30,               // ts +3
        0x01, 0x22,         // software
        0xC0, 0x7F,         // ts +127
        0x01, 0x33,         // software
        0x50,               // ts +5
    ];
    session.pump_bytes(&frames_for(DEFAULT_ITM_STREAM, &payload));

    let messages = messages.lock().unwrap();
    assert!(messages.len() >= 6);
    let stamps: Vec<u64> = messages.iter().map(|m| m.ts).collect();
    assert!(
        stamps.windows(2).all(|w| w[0] <= w[1]),
        "timestamps regressed: {:?}",
        stamps
    );
    assert_eq!(*stamps.last().unwrap(), 130);
}

#[test]
fn session_publishes_fifo_channels() {
    let dir = tempfile::tempdir().unwrap();
    let base = format!("{}/", dir.path().display());

    let options = ChannelOptions {
        base: base.clone(),
        permafile: true,
    };
    let specs = [
        ChannelSpec {
            channel: 0,
            name: "text".to_string(),
            format: Some("%c".to_string()),
        },
        ChannelSpec {
            channel: 1,
            name: "raw".to_string(),
            format: None,
        },
    ];
    let router = FifoRouter::create(&options, &specs).unwrap();

    let config = SessionConfig {
        use_tpiu: true,
        ..SessionConfig::default()
    };
    let mut session = Session::new(config, Box::new(router));

    #[rustfmt::skip]
    let payload = [
        0x03, 0x68, 0x69, 0x21, 0x0A,       // "hi!\n" on channel 0
        0x0B, 0xEF, 0xBE, 0xAD, 0xDE,       // 0xDEADBEEF raw on channel 1
    ];
    session.pump_bytes(&frames_for(DEFAULT_ITM_STREAM, &payload));

    // Hardware event for the shared FIFO.
    session.pump_bytes(&frames_for(DEFAULT_ITM_STREAM, &[0x0E, 0x03, 0x10]));

    // Dropping the session drops the router; the writer threads flush
    // their queues and exit.
    drop(session);

    assert_eq!(
        wait_for_file(&format!("{}text", base), 4),
        b"hi!\n".to_vec()
    );
    assert_eq!(
        wait_for_file(&format!("{}raw", base), 4),
        [0xEF, 0xBE, 0xAD, 0xDE]
    );
    assert_eq!(
        wait_for_file(&format!("{}{}", base, HWFIFO_NAME), 1),
        b"0,0,3,HardFault,Enter\n".to_vec()
    );
}

/// Polls until `path` holds at least `min_len` bytes (writer threads
/// are detached), then returns its contents.
fn wait_for_file(path: &str, min_len: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let contents = std::fs::read(path).unwrap_or_default();
        if contents.len() >= min_len || Instant::now() > deadline {
            return contents;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

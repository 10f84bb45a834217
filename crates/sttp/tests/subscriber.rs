//! Socket-level subscriber scenarios against an in-process publisher.
//!
//! These tests stand up a real TCP listener that speaks just enough of
//! the publisher side of STTP to drive the subscriber through its
//! lifecycle: mode negotiation, cache updates, compact and TSSC data
//! packets, buffer-block reordering, notifications, and refusal.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use sttp::compact::{self, CompactContext, CompactMeasurement};
use sttp::protocol::codes::{Command, Response, data_packet_flags};
use sttp::wire::compress;
use sttp::{Config, DataSubscriber, SignalIndexCache, SubscriptionInfo, Ticks, tssc};

struct MockPublisher {
    stream: TcpStream,
}

impl MockPublisher {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self { stream }
    }

    async fn read_command(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.unwrap();
        (body[0], body[1..].to_vec())
    }

    async fn expect_command(&mut self, expected: u8) -> Vec<u8> {
        let (code, payload) = self.read_command().await;
        assert_eq!(
            code, expected,
            "expected command {expected:#04x}, got {code:#04x}"
        );
        payload
    }

    async fn send_response(&mut self, response: u8, command: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(10 + payload.len());
        frame.extend_from_slice(&((6 + payload.len()) as u32).to_be_bytes());
        frame.push(response);
        frame.push(command);
        frame.extend_from_slice(&[0u8; 4]);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Accept the operational modes, returning the negotiated word.
    async fn validate(&mut self) -> u32 {
        let payload = self.expect_command(Command::DEFINE_OPERATIONAL_MODES).await;
        assert_eq!(payload.len(), 4, "mode word must be 4 bytes");
        let modes = u32::from_be_bytes(payload.try_into().unwrap());
        self.send_response(Response::SUCCEEDED, Command::DEFINE_OPERATIONAL_MODES, &[])
            .await;
        modes
    }
}

/// Honor `RUST_LOG` when debugging a failing scenario.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> Config {
    init_tracing();
    Config {
        auto_reconnect: false,
        validation_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

async fn recv_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

#[tokio::test]
async fn handshake_validates_subscriber() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let publisher = tokio::spawn(async move {
        let mut p = MockPublisher::accept(&listener).await;
        let modes = p.validate().await;

        // Version 2, UTF-8, gzip and payload compression; TSSC is on
        // because no UDP channel was requested.
        assert_eq!(modes & 0x1F, 2);
        assert_eq!(modes & 0x300, 0x200);
        assert_ne!(modes & 0x40, 0);
        assert_ne!(modes & 0x2000_0000, 0);
        p
    });

    let subscriber = DataSubscriber::new(test_config());
    subscriber.connect(addr.to_string()).await.unwrap();
    assert!(subscriber.connected());
    assert!(subscriber.validated());
    assert!(!subscriber.subscribed());

    let _publisher = publisher.await.unwrap();
    subscriber.disconnect().await;
    assert!(!subscriber.connected());
}

#[tokio::test]
async fn refused_modes_surface_as_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let publisher = tokio::spawn(async move {
        let mut p = MockPublisher::accept(&listener).await;
        let _ = p.expect_command(Command::DEFINE_OPERATIONAL_MODES).await;
        p.send_response(
            Response::FAILED,
            Command::DEFINE_OPERATIONAL_MODES,
            b"subscriber not authorized",
        )
        .await;
        p
    });

    let subscriber = DataSubscriber::new(test_config());
    let err = subscriber.connect(addr.to_string()).await.unwrap_err();
    assert!(err.is_connection_refused(), "got: {err}");

    let _publisher = publisher.await.unwrap();
}

#[tokio::test]
async fn non_sttp_peer_is_disconnected_before_validation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let publisher = tokio::spawn(async move {
        let mut p = MockPublisher::accept(&listener).await;
        let _ = p.expect_command(Command::DEFINE_OPERATIONAL_MODES).await;
        // A data packet before validation marks the peer as non-STTP.
        p.send_response(Response::DATA_PACKET, 0, &[0x02, 0, 0, 0, 0])
            .await;
        p
    });

    let subscriber = DataSubscriber::new(test_config());
    let err = subscriber.connect(addr.to_string()).await.unwrap_err();
    assert!(!err.is_connection_refused());

    let _publisher = publisher.await.unwrap();
    assert!(!subscriber.connected());
}

#[tokio::test]
async fn full_session_compact_tssc_and_buffer_blocks() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let signal = Uuid::from_u128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10);
    let subscriber_guid = Uuid::from_u128(0x5151);
    let base_time = 0x0801_D7C3_0000_0000u64;

    let subscriber = DataSubscriber::new(test_config());

    let (measurements_tx, mut measurements_rx) = mpsc::unbounded_channel();
    subscriber.on_new_measurements(move |batch| {
        let _ = measurements_tx.send(batch.to_vec());
    });

    let (cache_tx, mut cache_rx) = mpsc::unbounded_channel();
    subscriber.on_subscription_updated(move |cache, sid| {
        let _ = cache_tx.send((cache.count(), cache.signal_id(7), sid));
    });

    let (blocks_tx, mut blocks_rx) = mpsc::unbounded_channel();
    subscriber.on_new_buffer_blocks(move |blocks| {
        let _ = blocks_tx.send(blocks.to_vec());
    });

    let (start_tx, mut start_rx) = mpsc::unbounded_channel();
    subscriber.on_data_start_time(move |t| {
        let _ = start_tx.send(t);
    });

    let (notification_tx, mut notification_rx) = mpsc::unbounded_channel();
    subscriber.on_notification_received(move |msg| {
        let _ = notification_tx.send(msg.to_owned());
    });

    let publisher = tokio::spawn(async move {
        let mut p = MockPublisher::accept(&listener).await;
        p.validate().await;

        // Subscription request.
        let payload = p.expect_command(Command::SUBSCRIBE).await;
        assert_eq!(payload[0], data_packet_flags::COMPACT);
        let len = u32::from_be_bytes(payload[1..5].try_into().unwrap()) as usize;
        let parameters = std::str::from_utf8(&payload[5..5 + len]).unwrap();
        assert!(parameters.contains("filterExpression={FILTER ActiveMeasurements}"));
        assert!(parameters.contains("includeTime=true;"));
        p.send_response(Response::SUCCEEDED, Command::SUBSCRIBE, &[])
            .await;

        // Signal index cache into slot 0 (gzipped by negotiated modes).
        let mut cache = SignalIndexCache::new();
        cache.insert(7, signal, "TEST", 42);
        let mut cache_payload = vec![0u8];
        cache_payload.extend_from_slice(&compress::deflate(&cache.encode(subscriber_guid, false)));
        p.send_response(Response::UPDATE_SIGNAL_INDEX_CACHE, 0, &cache_payload)
            .await;
        p.expect_command(Command::CONFIRM_UPDATE_SIGNAL_INDEX_CACHE)
            .await;

        // Base times and stream start marker.
        let mut base_payload = Vec::new();
        base_payload.extend_from_slice(&0u32.to_be_bytes());
        base_payload.extend_from_slice(&base_time.to_be_bytes());
        base_payload.extend_from_slice(&0u64.to_be_bytes());
        p.send_response(Response::UPDATE_BASE_TIMES, 0, &base_payload)
            .await;
        p.send_response(
            Response::DATA_START_TIME,
            0,
            &(base_time + 1000).to_be_bytes(),
        )
        .await;

        // One compact measurement using a 4-byte base-time offset.
        let ctx = CompactContext {
            include_time: true,
            use_millisecond_resolution: false,
            base_time_offsets: [base_time, 0],
            time_index: 0,
        };
        let mut packet = vec![data_packet_flags::COMPACT];
        packet.extend_from_slice(&1u32.to_be_bytes());
        compact::encode(
            &CompactMeasurement {
                runtime_id: 7,
                value: 64.0,
                timestamp: Ticks(base_time + 12_345),
                flags: 0,
            },
            &ctx,
            &mut packet,
        );
        p.send_response(Response::DATA_PACKET, 0, &packet).await;

        // Two TSSC packets; the second leans on history from the first.
        let mut encoder = tssc::Encoder::new();
        for sequence in 0..2u16 {
            let points = [
                tssc::Point {
                    id: 7,
                    timestamp: base_time + 20_000 + u64::from(sequence) * 333_333,
                    flags: 0,
                    value: 59.98 + f32::from(sequence),
                },
                tssc::Point {
                    id: 7,
                    timestamp: base_time + 20_001 + u64::from(sequence) * 333_333,
                    flags: 0x4,
                    value: 60.02,
                },
            ];
            for point in &points {
                encoder.add_measurement(point).unwrap();
            }
            let stream = encoder.finish().unwrap();
            encoder.advance_sequence();

            let mut packet = vec![data_packet_flags::COMPACT | data_packet_flags::COMPRESSED];
            packet.extend_from_slice(&(points.len() as u32).to_be_bytes());
            packet.push(tssc::VERSION);
            packet.extend_from_slice(&sequence.to_be_bytes());
            packet.extend_from_slice(&stream);
            p.send_response(Response::DATA_PACKET, 0, &packet).await;
        }

        // Buffer blocks out of order: 2, 0, 1.
        for (sequence, tag) in [(2u32, 2u8), (0, 0), (1, 1)] {
            let mut payload = Vec::new();
            payload.extend_from_slice(&sequence.to_be_bytes());
            payload.extend_from_slice(&7u32.to_be_bytes());
            payload.extend_from_slice(&[tag; 3]);
            p.send_response(Response::BUFFER_BLOCK, 0, &payload).await;

            let confirm = p.expect_command(Command::CONFIRM_BUFFER_BLOCK).await;
            assert_eq!(confirm, sequence.to_be_bytes());
        }

        // A notification, confirmed by hash.
        let mut note = Vec::new();
        note.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        note.extend_from_slice(b"publisher restarting soon");
        p.send_response(Response::NOTIFICATION, 0, &note).await;
        let confirm = p.expect_command(Command::CONFIRM_NOTIFICATION).await;
        assert_eq!(confirm, 0xDEAD_BEEFu32.to_be_bytes());

        // Unsubscribe round trip.
        p.expect_command(Command::UNSUBSCRIBE).await;
        p.send_response(Response::SUCCEEDED, Command::UNSUBSCRIBE, &[])
            .await;

        p
    });

    subscriber.connect(addr.to_string()).await.unwrap();
    subscriber
        .subscribe(SubscriptionInfo::with_filter("FILTER ActiveMeasurements"))
        .await
        .unwrap();

    // Cache swap lands and resolves runtime id 7.
    let (count, cached_signal, sid) = recv_timeout(&mut cache_rx).await;
    assert_eq!(count, 1);
    assert_eq!(cached_signal, signal);
    assert_eq!(sid, subscriber_guid);

    let start = recv_timeout(&mut start_rx).await;
    assert_eq!(start, Ticks(base_time + 1000));

    // Compact measurement.
    let batch = recv_timeout(&mut measurements_rx).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].signal_id, signal);
    assert_eq!(batch[0].value, 64.0);
    assert_eq!(batch[0].timestamp, Ticks(base_time + 12_345));

    // TSSC batches, in order, with full-precision timestamps.
    for sequence in 0..2u64 {
        let batch = recv_timeout(&mut measurements_rx).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].signal_id, signal);
        assert_eq!(batch[0].timestamp, Ticks(base_time + 20_000 + sequence * 333_333));
        assert_eq!(batch[0].value, f64::from(59.98f32 + sequence as f32));
        assert_eq!(batch[1].flags, 0x4);
        assert_eq!(batch[1].value, f64::from(60.02f32));
    }

    // Buffer blocks come out strictly ordered: [0], then [1, 2].
    let first = recv_timeout(&mut blocks_rx).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].buffer, vec![0u8; 3]);
    assert_eq!(first[0].signal_id, signal);
    let rest = recv_timeout(&mut blocks_rx).await;
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].buffer, vec![1u8; 3]);
    assert_eq!(rest[1].buffer, vec![2u8; 3]);

    let note = recv_timeout(&mut notification_rx).await;
    assert_eq!(note, "publisher restarting soon");

    assert_eq!(subscriber.total_measurements_received(), 5);
    assert!(subscriber.total_command_channel_bytes_received() > 0);

    subscriber.unsubscribe().await.unwrap();
    let _publisher = publisher.await.unwrap();
    subscriber.disconnect().await;
}

#[tokio::test]
async fn out_of_sequence_tssc_packets_are_discarded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let subscriber = DataSubscriber::new(test_config());

    let (measurements_tx, mut measurements_rx) = mpsc::unbounded_channel();
    subscriber.on_new_measurements(move |batch| {
        let _ = measurements_tx.send(batch.to_vec());
    });

    let publisher = tokio::spawn(async move {
        let mut p = MockPublisher::accept(&listener).await;
        p.validate().await;

        let point = tssc::Point {
            id: 1,
            timestamp: 1_000_000,
            flags: 0,
            value: 1.0,
        };

        // Sequence 5 with no preceding reset: must be discarded.
        let mut stray = tssc::Encoder::new();
        stray.add_measurement(&point).unwrap();
        let stream = stray.finish().unwrap();
        let mut packet = vec![data_packet_flags::COMPACT | data_packet_flags::COMPRESSED];
        packet.extend_from_slice(&1u32.to_be_bytes());
        packet.push(tssc::VERSION);
        packet.extend_from_slice(&5u16.to_be_bytes());
        packet.extend_from_slice(&stream);
        p.send_response(Response::DATA_PACKET, 0, &packet).await;

        // Sequence 0 resets the decoder and gets through.
        let mut fresh = tssc::Encoder::new();
        fresh.add_measurement(&point).unwrap();
        let stream = fresh.finish().unwrap();
        let mut packet = vec![data_packet_flags::COMPACT | data_packet_flags::COMPRESSED];
        packet.extend_from_slice(&1u32.to_be_bytes());
        packet.push(tssc::VERSION);
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&stream);
        p.send_response(Response::DATA_PACKET, 0, &packet).await;

        p
    });

    subscriber.connect(addr.to_string()).await.unwrap();

    // Only the post-reset packet produces measurements.
    let batch = recv_timeout(&mut measurements_rx).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].value, 1.0);
    assert_eq!(subscriber.total_measurements_received(), 1);

    let _publisher = publisher.await.unwrap();
    subscriber.disconnect().await;
}

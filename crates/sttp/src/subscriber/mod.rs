//! The STTP data subscriber.
//!
//! [`DataSubscriber`] owns one command-channel connection to a
//! publisher: it negotiates operational modes, requests measurement
//! streams by filter expression, decodes compact or TSSC data packets,
//! and hands measurements to the host through registered callbacks.
//!
//! # Example
//!
//! ```ignore
//! use sttp::{Config, DataSubscriber, SubscriptionInfo};
//!
//! #[tokio::main]
//! async fn main() -> sttp::Result<()> {
//!     let subscriber = DataSubscriber::new(Config::default());
//!
//!     subscriber.on_new_measurements(|measurements| {
//!         for m in measurements {
//!             println!("{}: {}", m.signal_id, m.value);
//!         }
//!     });
//!
//!     subscriber.connect("localhost:7165").await?;
//!     subscriber
//!         .subscribe(SubscriptionInfo::with_filter(
//!             "FILTER ActiveMeasurements WHERE SignalType = 'FREQ'",
//!         ))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     subscriber.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Workers
//!
//! Each connection runs a command-channel reader task, optionally a UDP
//! data-channel reader, and on failure a termination dispatcher plus a
//! reconnection supervisor. The termination dispatcher exists so the
//! worker that observes a read error never joins itself during
//! shutdown. Callbacks that must preserve stream order run inline on
//! the reader; the rest are dispatched to helper tasks.

pub mod buffer_block;
mod callbacks;
pub mod config;
mod reconnect;

pub use buffer_block::BufferBlock;
pub use config::{Config, SubscriptionInfo};
pub use reconnect::RetryPolicy;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::SignalIndexCache;
use crate::compact::{self, CompactContext};
use crate::error::{Error, Result};
use crate::measurement::{Measurement, MeasurementMetadata, MeasurementRegistry};
use crate::protocol::codes::{Command, Response, data_packet_flags};
use crate::protocol::framing::{CommandWriter, Frame, FrameReader, MAX_PACKET_SIZE};
use crate::ticks::Ticks;
use crate::tssc;
use crate::wire::cipher::KeyIv;
use crate::wire::{WireReader, compress};

use buffer_block::ReorderWindow;
use callbacks::CallbackRouter;
use reconnect::Cancellation;

/// Pre-validation cap on declared payload sizes (v2+). A peer that is
/// not an STTP publisher gets cut off before it can demand a large
/// allocation.
const PRE_VALIDATION_CAP: usize = 8 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// TCP connect in flight.
    Connecting,
    /// Socket up, operational modes sent, awaiting validation.
    Connected,
    /// Publisher accepted the operational modes.
    Validated,
    /// A subscription is active.
    Subscribed,
    /// Teardown in progress.
    Disconnecting,
}

#[derive(Default)]
struct Statistics {
    command_channel_bytes: AtomicU64,
    data_channel_bytes: AtomicU64,
    measurements_received: AtomicU64,
}

/// The STTP subscriber.
///
/// Cheap to clone handles are not provided; share the subscriber itself
/// behind an `Arc` if multiple owners need it. All methods take `&self`.
pub struct DataSubscriber {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    callbacks: CallbackRouter,

    // Lifecycle flags. The watch channel mirrors the computed state so
    // `connect` can await validation.
    connecting: AtomicBool,
    connected: AtomicBool,
    validated: AtomicBool,
    subscribed: AtomicBool,
    disconnecting: AtomicBool,
    disposing: AtomicBool,
    connection_refused: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,

    address: Mutex<String>,
    subscription: Mutex<SubscriptionInfo>,

    writer: tokio::sync::Mutex<Option<CommandWriter<OwnedWriteHalf>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    udp_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,

    caches: Mutex<[Arc<SignalIndexCache>; 2]>,
    active_cache_index: AtomicUsize,
    subscriber_id: Mutex<Uuid>,

    base_time_offsets: [AtomicU64; 2],
    time_index: AtomicUsize,

    // Published by whole-slice swap; readers snapshot the Arc.
    key_ivs: Mutex<Option<Arc<[KeyIv; 2]>>>,

    reorder: Mutex<ReorderWindow>,
    registry: Mutex<MeasurementRegistry>,

    stats: Statistics,
    cancellation: Cancellation,
    connect_attempt: AtomicU32,
    last_out_of_sequence_report: Mutex<Option<Instant>>,
}

impl Default for DataSubscriber {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl DataSubscriber {
    /// Create a subscriber with the given connection configuration.
    pub fn new(config: Config) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                callbacks: CallbackRouter::new(),
                connecting: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                validated: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
                disposing: AtomicBool::new(false),
                connection_refused: AtomicBool::new(false),
                state_tx,
                address: Mutex::new(String::new()),
                subscription: Mutex::new(SubscriptionInfo::default()),
                writer: tokio::sync::Mutex::new(None),
                reader_task: Mutex::new(None),
                udp_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                caches: Mutex::new([
                    Arc::new(SignalIndexCache::new()),
                    Arc::new(SignalIndexCache::new()),
                ]),
                active_cache_index: AtomicUsize::new(0),
                subscriber_id: Mutex::new(Uuid::nil()),
                base_time_offsets: [AtomicU64::new(0), AtomicU64::new(0)],
                time_index: AtomicUsize::new(0),
                key_ivs: Mutex::new(None),
                reorder: Mutex::new(ReorderWindow::new()),
                registry: Mutex::new(MeasurementRegistry::new()),
                stats: Statistics::default(),
                cancellation: Cancellation::new(),
                connect_attempt: AtomicU32::new(0),
                last_out_of_sequence_report: Mutex::new(None),
            }),
        }
    }

    // ========================================================================
    // Callback registration
    // ========================================================================

    /// Informational messages from the subscriber.
    pub fn on_status_message(&self, sink: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.set_status_message(sink);
    }

    /// Error messages from the subscriber.
    pub fn on_error_message(&self, sink: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.set_error_message(sink);
    }

    /// Fired after the reconnection supervisor restores a connection.
    pub fn on_reconnect(&self, sink: impl Fn() + Send + Sync + 'static) {
        self.inner.callbacks.set_reconnect(sink);
    }

    /// Raw (inflated) metadata from a `MetadataRefresh` round trip.
    pub fn on_metadata_received(&self, sink: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.inner.callbacks.set_metadata_received(sink);
    }

    /// Fired when a new signal index cache becomes active.
    pub fn on_subscription_updated(
        &self,
        sink: impl Fn(&SignalIndexCache, Uuid) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.set_subscription_updated(sink);
    }

    /// Timestamp of the first measurement of the stream.
    pub fn on_data_start_time(&self, sink: impl Fn(Ticks) + Send + Sync + 'static) {
        self.inner.callbacks.set_data_start_time(sink);
    }

    /// The publisher's configuration changed; a metadata refresh is in
    /// order.
    pub fn on_configuration_changed(&self, sink: impl Fn() + Send + Sync + 'static) {
        self.inner.callbacks.set_configuration_changed(sink);
    }

    /// Decoded measurements, invoked synchronously on the reader worker
    /// in wire order.
    pub fn on_new_measurements(&self, sink: impl Fn(&[Measurement]) + Send + Sync + 'static) {
        self.inner.callbacks.set_new_measurements(sink);
    }

    /// Reordered buffer blocks, invoked synchronously on the reader
    /// worker.
    pub fn on_new_buffer_blocks(&self, sink: impl Fn(&[BufferBlock]) + Send + Sync + 'static) {
        self.inner.callbacks.set_new_buffer_blocks(sink);
    }

    /// Historical playback finished.
    pub fn on_processing_complete(&self, sink: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.set_processing_complete(sink);
    }

    /// Human-readable notification; confirmed to the publisher
    /// automatically.
    pub fn on_notification_received(&self, sink: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.set_notification_received(sink);
    }

    /// Fired when the socket is up, before mode validation.
    pub fn on_connection_established(&self, sink: impl Fn() + Send + Sync + 'static) {
        self.inner.callbacks.set_connection_established(sink);
    }

    /// Fired when the connection is lost unexpectedly.
    pub fn on_connection_terminated(&self, sink: impl Fn() + Send + Sync + 'static) {
        self.inner.callbacks.set_connection_terminated(sink);
    }

    /// User-defined responses (`0xE0..=0xEF`): `(response, echoed
    /// command, payload)`.
    pub fn on_user_response(&self, sink: impl Fn(u8, u8, &[u8]) + Send + Sync + 'static) {
        self.inner.callbacks.set_user_response(sink);
    }

    // ========================================================================
    // Connection control
    // ========================================================================

    /// Connect to a publisher at `host:port` and negotiate operational
    /// modes.
    ///
    /// For protocol v2+ this resolves once the publisher validates the
    /// modes (or refuses them); for earlier versions it resolves as soon
    /// as the modes are sent.
    pub async fn connect(&self, address: impl Into<String>) -> Result<()> {
        let inner = &self.inner;

        if inner.connected.load(Ordering::SeqCst) || inner.connecting.load(Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }

        *inner.address.lock().unwrap() = address.into();
        inner.cancellation.rearm();
        inner.connection_refused.store(false, Ordering::SeqCst);
        inner.connect_attempt.store(0, Ordering::SeqCst);

        Inner::connect_once(inner).await?;

        if inner.config.version < 2 {
            return Ok(());
        }

        let mut state_rx = inner.state_tx.subscribe();
        let waited = tokio::time::timeout(
            inner.config.validation_timeout,
            state_rx.wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Validated
                        | ConnectionState::Subscribed
                        | ConnectionState::Disconnected
                )
            }),
        )
        .await;

        match waited {
            Ok(Ok(state)) => {
                let state = *state;
                if matches!(
                    state,
                    ConnectionState::Validated | ConnectionState::Subscribed
                ) {
                    Ok(())
                } else if inner.connection_refused.load(Ordering::SeqCst) {
                    Err(Error::ConnectionRefused(
                        "publisher rejected the operational modes".into(),
                    ))
                } else {
                    Err(Error::protocol("connection lost before validation"))
                }
            }
            Ok(Err(_)) => Err(Error::protocol("subscriber dropped during validation")),
            Err(_) => {
                self.disconnect().await;
                Err(Error::protocol("timed out waiting for mode validation"))
            }
        }
    }

    /// Request a measurement stream.
    ///
    /// Binds the UDP data channel first when the subscription asks for
    /// one. The `subscribed` state is confirmed by the publisher
    /// asynchronously.
    pub async fn subscribe(&self, info: SubscriptionInfo) -> Result<()> {
        let inner = &self.inner;

        if !inner.validated.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        if info.udp_data_channel() {
            let socket = UdpSocket::bind(("0.0.0.0", info.udp_port)).await?;
            let worker = Arc::clone(inner);
            let handle = tokio::spawn(async move { worker.run_udp_reader(socket).await });
            if let Some(previous) = inner.udp_task.lock().unwrap().replace(handle) {
                previous.abort();
            }
        }

        let parameters = info.to_connection_string();
        *inner.subscription.lock().unwrap() = info;

        let mut payload = Vec::with_capacity(5 + parameters.len());
        payload.push(data_packet_flags::COMPACT);
        payload.extend_from_slice(&(parameters.len() as u32).to_be_bytes());
        payload.extend_from_slice(parameters.as_bytes());

        inner.send_command(Command::SUBSCRIBE, &payload).await
    }

    /// Stop the active subscription. A no-op when not connected.
    pub async fn unsubscribe(&self) -> Result<()> {
        let inner = &self.inner;

        if !inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = inner.udp_task.lock().unwrap().take() {
            handle.abort();
        }

        inner.send_command(Command::UNSUBSCRIBE, &[]).await
    }

    /// Disconnect and cancel any pending reconnection.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.cancellation.cancel();

        // The supervisor may be mid-sleep or waiting out validation of a
        // fresh attempt; the cancellation flag stops the former, abort
        // covers the latter.
        let supervisor = inner.reconnect_task.lock().unwrap().take();
        if let Some(handle) = supervisor {
            handle.abort();
            let _ = handle.await;
        }

        inner.teardown().await;
    }

    /// Permanently shut the subscriber down; suppresses auto-reconnect.
    pub async fn dispose(&self) {
        self.inner.disposing.store(true, Ordering::SeqCst);
        self.disconnect().await;
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Ask the publisher for a metadata refresh.
    pub async fn request_metadata(&self) -> Result<()> {
        self.inner
            .send_command(Command::METADATA_REFRESH, &[])
            .await
    }

    /// Change the temporal processing interval (`-1` default, `0` as
    /// fast as possible).
    pub async fn update_processing_interval(&self, interval_ms: i32) -> Result<()> {
        self.inner
            .send_command(
                Command::UPDATE_PROCESSING_INTERVAL,
                &interval_ms.to_be_bytes(),
            )
            .await
    }

    /// Ask the publisher to roll the UDP cipher keys.
    pub async fn rotate_cipher_keys(&self) -> Result<()> {
        self.inner
            .send_command(Command::ROTATE_CIPHER_KEYS, &[])
            .await
    }

    /// Send a user-defined command (`index` 0..=15).
    pub async fn send_user_command(&self, index: u8, payload: &[u8]) -> Result<()> {
        if index > 0x0F {
            return Err(Error::NotSupported(format!(
                "user command index {index} out of range"
            )));
        }
        self.inner
            .send_command(Command::USER_COMMAND_00 + index, payload)
            .await
    }

    // ========================================================================
    // State and statistics
    // ========================================================================

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    /// Check if the TCP connection is up.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Check if the publisher accepted the operational modes.
    pub fn validated(&self) -> bool {
        self.inner.validated.load(Ordering::SeqCst)
    }

    /// Check if a subscription is active.
    pub fn subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::SeqCst)
    }

    /// Bytes received on the command channel.
    pub fn total_command_channel_bytes_received(&self) -> u64 {
        self.inner
            .stats
            .command_channel_bytes
            .load(Ordering::Relaxed)
    }

    /// Bytes received on the UDP data channel.
    pub fn total_data_channel_bytes_received(&self) -> u64 {
        self.inner.stats.data_channel_bytes.load(Ordering::Relaxed)
    }

    /// Measurements decoded across all data packets.
    pub fn total_measurements_received(&self) -> u64 {
        self.inner
            .stats
            .measurements_received
            .load(Ordering::Relaxed)
    }

    /// The signal index cache currently marked active.
    pub fn active_signal_index_cache(&self) -> Arc<SignalIndexCache> {
        self.inner.active_cache()
    }

    /// The subscriber id assigned by the publisher.
    pub fn subscriber_id(&self) -> Uuid {
        *self.inner.subscriber_id.lock().unwrap()
    }

    // ========================================================================
    // Measurement metadata registry
    // ========================================================================

    /// Register or replace metadata for a signal.
    pub fn register_metadata(&self, metadata: MeasurementMetadata) {
        self.inner.registry.lock().unwrap().register(metadata);
    }

    /// Metadata registered for a signal, if any.
    pub fn metadata_for(&self, signal_id: Uuid) -> Option<MeasurementMetadata> {
        self.inner.registry.lock().unwrap().lookup(signal_id).cloned()
    }

    /// Apply the registered linear adjustment to a measurement.
    pub fn adjusted_value(&self, measurement: &Measurement) -> f64 {
        self.inner
            .registry
            .lock()
            .unwrap()
            .adjusted_value(measurement)
    }
}

impl Inner {
    fn connection_state(&self) -> ConnectionState {
        if self.disconnecting.load(Ordering::SeqCst) {
            ConnectionState::Disconnecting
        } else if self.subscribed.load(Ordering::SeqCst) {
            ConnectionState::Subscribed
        } else if self.validated.load(Ordering::SeqCst) {
            ConnectionState::Validated
        } else if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else if self.connecting.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.connection_state());
    }

    fn active_cache(&self) -> Arc<SignalIndexCache> {
        let caches = self.caches.lock().unwrap();
        Arc::clone(&caches[self.active_cache_index.load(Ordering::SeqCst) & 1])
    }

    async fn send_command(&self, command: u8, payload: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.send(command, payload).await,
            None => Err(Error::NotConnected),
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// One TCP connection attempt: dial, reset per-connection state,
    /// send `DefineOperationalModes`, spawn the reader.
    async fn connect_once(this: &Arc<Self>) -> Result<()> {
        if this.connected.load(Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }

        this.disconnecting.store(false, Ordering::SeqCst);
        this.connecting.store(true, Ordering::SeqCst);
        this.publish_state();

        let address = this.address.lock().unwrap().clone();
        let stream = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                this.connecting.store(false, Ordering::SeqCst);
                this.publish_state();
                return Err(e.into());
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        // Per-connection state resets before the first frame can land.
        {
            let mut caches = this.caches.lock().unwrap();
            *caches = [
                Arc::new(SignalIndexCache::new()),
                Arc::new(SignalIndexCache::new()),
            ];
        }
        this.active_cache_index.store(0, Ordering::SeqCst);
        this.base_time_offsets[0].store(0, Ordering::SeqCst);
        this.base_time_offsets[1].store(0, Ordering::SeqCst);
        this.time_index.store(0, Ordering::SeqCst);
        *this.key_ivs.lock().unwrap() = None;
        this.reorder.lock().unwrap().reset();
        this.stats.command_channel_bytes.store(0, Ordering::Relaxed);
        this.stats.data_channel_bytes.store(0, Ordering::Relaxed);
        this.stats.measurements_received.store(0, Ordering::Relaxed);
        this.validated.store(false, Ordering::SeqCst);
        this.subscribed.store(false, Ordering::SeqCst);

        *this.writer.lock().await = Some(CommandWriter::new(write_half));

        let mut reader = FrameReader::new(read_half);
        if this.config.version >= 2 {
            reader.set_limit(Some(PRE_VALIDATION_CAP));
        }

        this.connecting.store(false, Ordering::SeqCst);
        this.connected.store(true, Ordering::SeqCst);
        this.publish_state();
        this.callbacks.connection_established();

        let udp_requested = this.subscription.lock().unwrap().udp_data_channel();
        let modes = this.config.operational_modes(udp_requested);
        this.send_command(Command::DEFINE_OPERATIONAL_MODES, &modes.to_be_bytes())
            .await?;
        debug!("operational modes sent: {modes:#010x}");

        if this.config.version < 2 {
            this.set_validated();
        }

        let worker = Arc::clone(this);
        let handle = tokio::spawn(async move { worker.run_command_reader(reader).await });
        *this.reader_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    fn set_validated(&self) {
        self.validated.store(true, Ordering::SeqCst);
        self.connection_refused.store(false, Ordering::SeqCst);
        self.connect_attempt.store(0, Ordering::SeqCst);
        self.publish_state();
    }

    /// Tear the connection down and join the workers.
    ///
    /// The reader is aborted rather than waited out: it may be parked in
    /// a socket read that only the peer could unblock. Abort lands on an
    /// await point, after which the join completes.
    async fn teardown(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
        self.publish_state();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(handle) = self.udp_task.lock().unwrap().take() {
            handle.abort();
        }

        let reader = self.reader_task.lock().unwrap().take();
        if let Some(handle) = reader {
            handle.abort();
            let _ = handle.await;
        }

        self.connected.store(false, Ordering::SeqCst);
        self.validated.store(false, Ordering::SeqCst);
        self.subscribed.store(false, Ordering::SeqCst);
        self.disconnecting.store(false, Ordering::SeqCst);
        self.publish_state();
    }

    /// Break the read-error → shutdown cycle: the reader never joins
    /// itself, a dedicated dispatcher tears down and schedules the
    /// reconnect.
    fn begin_termination(this: &Arc<Self>) {
        if this.disconnecting.load(Ordering::SeqCst) || this.disposing.load(Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.callbacks.connection_terminated();
            inner.teardown().await;

            if inner.config.auto_reconnect
                && !inner.disposing.load(Ordering::SeqCst)
                && !inner.cancellation.is_cancelled()
            {
                Inner::spawn_reconnect(&inner);
            }
        });
    }

    fn spawn_reconnect(this: &Arc<Self>) {
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move { inner.run_reconnect().await });
        if let Some(previous) = this.reconnect_task.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Reconnection supervisor: exponential back-off, cancellation, and
    /// the connection-refused counter rule.
    ///
    /// The attempt counter is reset only on a validated session, so a
    /// publisher that accepts TCP but refuses the modes keeps the
    /// back-off growing instead of hammering in a tight loop.
    async fn run_reconnect(self: Arc<Self>) {
        loop {
            if self.disposing.load(Ordering::SeqCst) || self.cancellation.is_cancelled() {
                return;
            }

            let retry = self.connect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            if self.config.retry.exhausted(retry) {
                self.callbacks.error_message(format!(
                    "auto-reconnect giving up after {} attempts",
                    retry - 1
                ));
                return;
            }

            let delay = self.config.retry.delay_for(retry);
            let address = self.address.lock().unwrap().clone();
            if self.connection_refused.load(Ordering::SeqCst) {
                self.callbacks.status_message(format!(
                    "publisher at {address} refused the connection; retry {retry} in {delay:?}"
                ));
            } else {
                self.callbacks.status_message(format!(
                    "connection to {address} lost; retry {retry} in {delay:?}"
                ));
            }

            if !self.cancellation.sleep(delay).await {
                return;
            }

            match Inner::connect_once(&self).await {
                Ok(()) => {
                    self.callbacks.reconnect();

                    let resubscribe = {
                        let subscription = self.subscription.lock().unwrap();
                        (!subscription.filter_expression.is_empty()).then(|| subscription.clone())
                    };
                    if let Some(info) = resubscribe {
                        let _ = self.resubscribe(info).await;
                    }
                    return;
                }
                Err(e) => {
                    self.callbacks
                        .error_message(format!("reconnect attempt {retry} failed: {e}"));
                }
            }
        }
    }

    /// Re-issue the last subscription after a reconnect, once the new
    /// session validates.
    async fn resubscribe(&self, info: SubscriptionInfo) -> Result<()> {
        if self.config.version >= 2 {
            let mut state_rx = self.state_tx.subscribe();
            let waited = tokio::time::timeout(
                self.config.validation_timeout,
                state_rx.wait_for(|s| {
                    matches!(
                        s,
                        ConnectionState::Validated
                            | ConnectionState::Subscribed
                            | ConnectionState::Disconnected
                    )
                }),
            )
            .await;
            match waited {
                Ok(Ok(state)) if *state == ConnectionState::Validated => {}
                _ => return Err(Error::NotConnected),
            }
        }

        let parameters = info.to_connection_string();
        let mut payload = Vec::with_capacity(5 + parameters.len());
        payload.push(data_packet_flags::COMPACT);
        payload.extend_from_slice(&(parameters.len() as u32).to_be_bytes());
        payload.extend_from_slice(parameters.as_bytes());
        self.send_command(Command::SUBSCRIBE, &payload).await
    }

    // ========================================================================
    // Workers
    // ========================================================================

    async fn run_command_reader(self: Arc<Self>, mut reader: FrameReader<OwnedReadHalf>) {
        loop {
            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    if self.disconnecting.load(Ordering::SeqCst)
                        || self.disposing.load(Ordering::SeqCst)
                    {
                        return;
                    }
                    self.callbacks
                        .error_message(format!("command channel read failed: {e}"));
                    Inner::begin_termination(&self);
                    return;
                }
            };

            self.stats
                .command_channel_bytes
                .fetch_add(frame.wire_size() as u64, Ordering::Relaxed);

            match self.process_response(frame).await {
                Ok(()) => {
                    if self.validated.load(Ordering::SeqCst) {
                        reader.set_limit(None);
                    }
                }
                Err(e) if e.is_fatal() || e.is_connection_refused() => {
                    self.callbacks
                        .error_message(format!("terminating connection: {e}"));
                    Inner::begin_termination(&self);
                    return;
                }
                Err(e) => {
                    self.callbacks
                        .error_message(format!("discarding response: {e}"));
                }
            }
        }
    }

    async fn run_udp_reader(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let received = match socket.recv_from(&mut buf).await {
                Ok((len, _)) => len,
                Err(e) => {
                    if self.disconnecting.load(Ordering::SeqCst)
                        || self.disposing.load(Ordering::SeqCst)
                    {
                        return;
                    }
                    self.callbacks
                        .error_message(format!("data channel read failed: {e}"));
                    return;
                }
            };

            self.stats
                .data_channel_bytes
                .fetch_add(received as u64, Ordering::Relaxed);

            match Frame::parse(&buf[..received]) {
                Ok(frame) => {
                    if let Err(e) = self.process_response(frame).await {
                        if e.is_fatal() {
                            self.callbacks
                                .error_message(format!("terminating connection: {e}"));
                            Inner::begin_termination(&self);
                            return;
                        }
                        self.callbacks
                            .error_message(format!("discarding datagram: {e}"));
                    }
                }
                Err(e) => {
                    debug!("undecodable datagram: {e}");
                }
            }
        }
    }

    // ========================================================================
    // Response dispatch
    // ========================================================================

    async fn process_response(&self, frame: Frame) -> Result<()> {
        // Initial-response hardening: until the modes are validated, the
        // only acceptable traffic is the DefineOperationalModes result or
        // a keepalive.
        if self.config.version >= 2 && !self.validated.load(Ordering::SeqCst) {
            let acceptable = frame.response_code == Response::NO_OP
                || (matches!(frame.response_code, Response::SUCCEEDED | Response::FAILED)
                    && frame.command_code == Command::DEFINE_OPERATIONAL_MODES);
            if !acceptable {
                return Err(Error::protocol(format!(
                    "unexpected initial response {} ({:#04x}); peer is not an STTP publisher",
                    Response::name(frame.response_code),
                    frame.response_code
                )));
            }
        }

        match frame.response_code {
            Response::SUCCEEDED => self.handle_succeeded(&frame).await,
            Response::FAILED => self.handle_failed(&frame),
            Response::DATA_PACKET => self.handle_data_packet(&frame.payload).map_err(|e| {
                // Cache updates may be dropped in isolation, but a packet
                // that cannot be interpreted poisons the whole stream.
                if e.is_fatal() {
                    e
                } else {
                    Error::Protocol(format!("data packet decode failed: {e}"))
                }
            }),
            Response::UPDATE_SIGNAL_INDEX_CACHE => {
                self.handle_update_signal_index_cache(&frame.payload).await
            }
            Response::UPDATE_BASE_TIMES => self.handle_update_base_times(&frame.payload),
            Response::UPDATE_CIPHER_KEYS => self.handle_update_cipher_keys(&frame.payload),
            Response::DATA_START_TIME => self.handle_data_start_time(&frame.payload),
            Response::PROCESSING_COMPLETE => {
                let message = String::from_utf8_lossy(&frame.payload);
                self.callbacks.processing_complete(&message);
                Ok(())
            }
            Response::BUFFER_BLOCK => self.handle_buffer_block(&frame.payload).await,
            Response::NOTIFICATION => self.handle_notification(&frame.payload).await,
            Response::CONFIGURATION_CHANGED => {
                self.callbacks.configuration_changed();
                self.callbacks
                    .status_message("publisher configuration changed; metadata refresh advised");
                Ok(())
            }
            Response::USER_RESPONSE_00..=Response::USER_RESPONSE_15 => {
                self.callbacks.user_response(
                    frame.response_code,
                    frame.command_code,
                    frame.payload.clone(),
                );
                Ok(())
            }
            Response::NO_OP => Ok(()),
            other => Err(Error::protocol(format!(
                "unknown response code {other:#04x}"
            ))),
        }
    }

    async fn handle_succeeded(&self, frame: &Frame) -> Result<()> {
        match frame.command_code {
            Command::DEFINE_OPERATIONAL_MODES => {
                self.set_validated();
                self.callbacks
                    .status_message("operational modes accepted by publisher");
                if self.config.auto_request_metadata {
                    self.send_command(Command::METADATA_REFRESH, &[]).await?;
                }
                Ok(())
            }
            Command::METADATA_REFRESH => {
                let metadata = if self.config.compress_metadata {
                    compress::inflate(&frame.payload)?
                } else {
                    frame.payload.clone()
                };
                self.callbacks.status_message(format!(
                    "received {} bytes of metadata",
                    metadata.len()
                ));
                self.callbacks.metadata_received(metadata);
                Ok(())
            }
            Command::SUBSCRIBE => {
                self.subscribed.store(true, Ordering::SeqCst);
                self.publish_state();
                self.callbacks.status_message("subscription established");
                Ok(())
            }
            Command::UNSUBSCRIBE => {
                self.subscribed.store(false, Ordering::SeqCst);
                self.publish_state();
                self.callbacks.status_message("subscription cancelled");
                Ok(())
            }
            Command::ROTATE_CIPHER_KEYS => {
                self.callbacks.status_message("cipher key rotation accepted");
                Ok(())
            }
            Command::UPDATE_PROCESSING_INTERVAL => {
                self.callbacks.status_message("processing interval updated");
                Ok(())
            }
            other => {
                self.callbacks.status_message(format!(
                    "{} command succeeded",
                    Command::name(other)
                ));
                Ok(())
            }
        }
    }

    fn handle_failed(&self, frame: &Frame) -> Result<()> {
        let message = String::from_utf8_lossy(&frame.payload).into_owned();

        if frame.command_code == Command::CONNECT
            || frame.command_code == Command::DEFINE_OPERATIONAL_MODES
        {
            self.connection_refused.store(true, Ordering::SeqCst);
            return Err(Error::ConnectionRefused(if message.is_empty() {
                "no reason given".into()
            } else {
                message
            }));
        }

        self.callbacks.error_message(format!(
            "{} command failed: {message}",
            Command::name(frame.command_code)
        ));
        Ok(())
    }

    // ========================================================================
    // Data path
    // ========================================================================

    fn handle_data_packet(&self, payload: &[u8]) -> Result<()> {
        let mut r = WireReader::new(payload);
        let flags = r.u8()?;

        if flags & (data_packet_flags::COMPACT | data_packet_flags::COMPRESSED) == 0 {
            return Err(Error::protocol(
                "data packet is neither compact nor compressed",
            ));
        }

        // Decrypt first when UDP keys are installed.
        let key_snapshot = self.key_ivs.lock().unwrap().clone();
        let decrypted;
        let body = match key_snapshot {
            Some(keys) => {
                let index = usize::from(flags & data_packet_flags::CIPHER_INDEX != 0);
                decrypted = keys[index].decrypt(r.rest())?;
                &decrypted[..]
            }
            None => r.rest(),
        };

        let mut r = WireReader::new(body);
        let count = r.u32_be()?;
        let cache_index = usize::from(flags & data_packet_flags::CACHE_INDEX != 0);
        let cache = {
            let caches = self.caches.lock().unwrap();
            Arc::clone(&caches[cache_index])
        };

        let measurements = if flags & data_packet_flags::COMPRESSED != 0 {
            match self.decode_tssc(&mut r, &cache, count) {
                Err(e) => {
                    if let Error::OutOfSequence { expected, actual } = e {
                        self.report_out_of_sequence(expected, actual);
                        return Ok(());
                    }
                    return Err(e);
                }
                Ok(measurements) => measurements,
            }
        } else {
            self.decode_compact(&mut r, &cache, count)?
        };

        self.stats
            .measurements_received
            .fetch_add(measurements.len() as u64, Ordering::Relaxed);

        self.callbacks.new_measurements(&measurements);
        Ok(())
    }

    fn decode_tssc(
        &self,
        r: &mut WireReader<'_>,
        cache: &Arc<SignalIndexCache>,
        count: u32,
    ) -> Result<Vec<Measurement>> {
        let version = r.u8()?;
        if version != tssc::VERSION {
            return Err(Error::protocol(format!(
                "unknown TSSC version {version:#04x}"
            )));
        }

        let sequence = r.u16_be()?;
        let mut slot = cache.tssc_decoder.lock().unwrap();

        if sequence == 0 {
            // Reset by replacement; per-point vectors never need clearing.
            *slot = Some(tssc::Decoder::new());
            self.callbacks.status_message("TSSC algorithm reset");
        }

        let decoder = slot.get_or_insert_with(tssc::Decoder::new);
        if decoder.sequence_number() != sequence {
            return Err(Error::OutOfSequence {
                expected: decoder.sequence_number(),
                actual: sequence,
            });
        }

        decoder.set_buffer(r.rest());

        let mut measurements = Vec::with_capacity(count as usize);
        while let Some(point) = decoder.try_get_measurement()? {
            measurements.push(Measurement {
                signal_id: cache.signal_id(point.id),
                value: f64::from(point.value),
                timestamp: Ticks(point.timestamp),
                flags: point.flags,
            });
        }

        if measurements.len() != count as usize {
            debug!(
                declared = count,
                decoded = measurements.len(),
                "TSSC packet count mismatch"
            );
        }

        decoder.advance_sequence();
        Ok(measurements)
    }

    fn decode_compact(
        &self,
        r: &mut WireReader<'_>,
        cache: &Arc<SignalIndexCache>,
        count: u32,
    ) -> Result<Vec<Measurement>> {
        let ctx = self.compact_context();
        let mut measurements = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let m = compact::decode(r, &ctx)?;
            measurements.push(Measurement {
                signal_id: cache.signal_id(m.runtime_id),
                value: f64::from(m.value),
                timestamp: m.timestamp,
                flags: m.flags,
            });
        }

        Ok(measurements)
    }

    fn compact_context(&self) -> CompactContext {
        let subscription = self.subscription.lock().unwrap();
        CompactContext {
            include_time: subscription.include_time,
            use_millisecond_resolution: subscription.use_millisecond_resolution,
            base_time_offsets: [
                self.base_time_offsets[0].load(Ordering::SeqCst),
                self.base_time_offsets[1].load(Ordering::SeqCst),
            ],
            time_index: self.time_index.load(Ordering::SeqCst) & 1,
        }
    }

    /// Out-of-sequence packets are frequent during publisher restarts;
    /// report at most once every two seconds.
    fn report_out_of_sequence(&self, expected: u16, actual: u16) {
        let mut last = self.last_out_of_sequence_report.lock().unwrap();
        let now = Instant::now();
        let due = last.is_none_or(|at| now.duration_since(at) >= Duration::from_secs(2));
        if due {
            *last = Some(now);
            warn!(expected, actual, "TSSC packet out of sequence");
            self.callbacks.error_message(format!(
                "TSSC out of sequence: expected {expected}, got {actual}; discarding until reset"
            ));
        }
    }

    // ========================================================================
    // Control-path handlers
    // ========================================================================

    async fn handle_update_signal_index_cache(&self, payload: &[u8]) -> Result<()> {
        let (cache_index, image) = if self.config.version >= 2 {
            if payload.is_empty() {
                return Err(Error::MalformedCache("empty cache payload".into()));
            }
            (usize::from(payload[0] != 0), &payload[1..])
        } else {
            (0, payload)
        };

        let inflated;
        let image = if self.config.compress_signal_index_cache {
            inflated = compress::inflate(image)?;
            &inflated[..]
        } else {
            image
        };

        let (cache, subscriber_id) =
            SignalIndexCache::decode(image, self.config.swap_guid_endianness)?;
        let cache = Arc::new(cache);

        {
            let mut caches = self.caches.lock().unwrap();
            caches[cache_index] = Arc::clone(&cache);
        }
        self.active_cache_index.store(cache_index, Ordering::SeqCst);
        *self.subscriber_id.lock().unwrap() = subscriber_id;

        debug!(
            slot = cache_index,
            signals = cache.count(),
            "signal index cache updated"
        );

        if self.config.version >= 2 {
            self.send_command(Command::CONFIRM_UPDATE_SIGNAL_INDEX_CACHE, &[])
                .await?;
        }

        self.callbacks.subscription_updated(cache, subscriber_id);
        Ok(())
    }

    fn handle_update_base_times(&self, payload: &[u8]) -> Result<()> {
        let mut r = WireReader::new(payload);
        // Both offsets are always present, whichever one is active.
        let active_index = r.u32_be()? as usize & 1;
        let base0 = r.u64_be()?;
        let base1 = r.u64_be()?;

        self.time_index.store(active_index, Ordering::SeqCst);
        self.base_time_offsets[0].store(base0, Ordering::SeqCst);
        self.base_time_offsets[1].store(base1, Ordering::SeqCst);

        debug!(active_index, base0, base1, "base time offsets updated");
        Ok(())
    }

    fn handle_update_cipher_keys(&self, payload: &[u8]) -> Result<()> {
        let mut r = WireReader::new(payload);

        let read_blob = |r: &mut WireReader<'_>| -> Result<Vec<u8>> {
            let len = r.u32_be()? as usize;
            Ok(r.take(len)?.to_vec())
        };

        let even = KeyIv {
            key: read_blob(&mut r)?,
            iv: read_blob(&mut r)?,
        };
        let odd = KeyIv {
            key: read_blob(&mut r)?,
            iv: read_blob(&mut r)?,
        };

        *self.key_ivs.lock().unwrap() = Some(Arc::new([even, odd]));
        self.callbacks
            .status_message("data channel cipher keys updated");
        Ok(())
    }

    fn handle_data_start_time(&self, payload: &[u8]) -> Result<()> {
        let mut r = WireReader::new(payload);
        let start = Ticks(r.u64_be()?);
        self.callbacks.data_start_time(start);
        Ok(())
    }

    async fn handle_buffer_block(&self, payload: &[u8]) -> Result<()> {
        let mut r = WireReader::new(payload);
        let sequence = r.u32_be()?;

        // Confirm receipt regardless of ordering outcome.
        self.send_command(Command::CONFIRM_BUFFER_BLOCK, &sequence.to_be_bytes())
            .await?;

        let runtime_id = r.u32_be()? as i32;
        let signal_id = self.active_cache().signal_id(runtime_id);
        let block = BufferBlock {
            signal_id,
            buffer: r.rest().to_vec(),
        };

        let ready = self.reorder.lock().unwrap().accept(sequence, block);
        if !ready.is_empty() {
            self.callbacks.new_buffer_blocks(&ready);
        }
        Ok(())
    }

    async fn handle_notification(&self, payload: &[u8]) -> Result<()> {
        let mut r = WireReader::new(payload);
        let hash = r.u32_be()?;
        let message = std::str::from_utf8(r.rest())
            .map_err(|e| Error::decode(format!("notification is not UTF-8: {e}")))?
            .to_owned();

        self.callbacks.notification_received(message);
        self.send_command(Command::CONFIRM_NOTIFICATION, &hash.to_be_bytes())
            .await
    }
}

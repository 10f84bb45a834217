//! Subscriber configuration and subscription parameters.

use std::time::Duration;

use crate::protocol::codes::{compression_modes, operational_encoding, operational_modes};
use crate::subscriber::reconnect::RetryPolicy;

/// Assembly identification stamped into the subscription string.
const ASSEMBLY_SOURCE: &str = env!("CARGO_PKG_NAME");
const ASSEMBLY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Connection-level configuration, fixed for the life of a subscriber.
#[derive(Debug, Clone)]
pub struct Config {
    /// STTP protocol version requested in the operational modes.
    pub version: u8,
    /// Gzip-compress data-packet payloads (enables TSSC on TCP-only
    /// sessions).
    pub compress_payload_data: bool,
    /// Gzip metadata payloads.
    pub compress_metadata: bool,
    /// Gzip signal-index-cache images.
    pub compress_signal_index_cache: bool,
    /// Decode GUIDs as Microsoft mixed-endian instead of RFC 4122.
    pub swap_guid_endianness: bool,
    /// Reconnect automatically after an unexpected connection loss.
    pub auto_reconnect: bool,
    /// Request a metadata refresh as soon as the session validates.
    pub auto_request_metadata: bool,
    /// Back-off timing for the reconnection supervisor.
    pub retry: RetryPolicy,
    /// Give up validation if the publisher stays silent this long.
    pub validation_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 2,
            compress_payload_data: true,
            compress_metadata: true,
            compress_signal_index_cache: true,
            swap_guid_endianness: false,
            auto_reconnect: true,
            auto_request_metadata: false,
            retry: RetryPolicy::default(),
            validation_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Compose the 32-bit `DefineOperationalModes` word.
    ///
    /// The TSSC bit rides the compression-mode field and is set only
    /// when payload compression is on and no UDP data channel is in
    /// play: the codec is stateful and cannot survive datagram loss.
    pub fn operational_modes(&self, udp_data_channel: bool) -> u32 {
        let mut modes = compression_modes::GZIP;
        modes |= operational_encoding::UTF8;
        modes |= operational_modes::VERSION_MASK & u32::from(self.version);

        if self.compress_payload_data {
            modes |= operational_modes::COMPRESS_PAYLOAD_DATA;
            if !udp_data_channel {
                modes |= compression_modes::TSSC;
            }
        }
        if self.compress_metadata {
            modes |= operational_modes::COMPRESS_METADATA;
        }
        if self.compress_signal_index_cache {
            modes |= operational_modes::COMPRESS_SIGNAL_INDEX_CACHE;
        }

        modes
    }
}

/// Parameters of one subscription request.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    /// SQL-like selector for the signals to stream.
    pub filter_expression: String,

    /// Ask the publisher to down-sample to `publish_interval`.
    pub throttled: bool,
    /// Down-sampling period in seconds, when throttled.
    pub publish_interval: f64,

    /// Request delivery over a UDP data channel on this local port;
    /// 0 keeps everything on the command channel.
    pub udp_port: u16,

    /// Include timestamps in compact measurements.
    pub include_time: bool,
    /// Let the publisher sanity-check timestamps against its clock.
    pub enable_time_reasonability_check: bool,
    /// Past tolerance for the reasonability check, in seconds.
    pub lag_time: f64,
    /// Future tolerance for the reasonability check, in seconds.
    pub lead_time: f64,
    /// Use the subscriber's clock as the reasonability reference.
    pub use_local_clock_as_real_time: bool,
    /// Shave compact timestamps to millisecond resolution.
    pub use_millisecond_resolution: bool,
    /// Drop NaN values at the publisher.
    pub request_nan_value_filter: bool,

    /// Historical playback window start, empty for live data.
    pub start_time: String,
    /// Historical playback window end.
    pub stop_time: String,
    /// Extra parameters for the temporal constraint.
    pub constraint_parameters: String,
    /// Playback pacing in milliseconds: -1 default, 0 as fast as
    /// possible.
    pub processing_interval: i32,

    /// Raw extra key=value pairs appended to the subscription string.
    pub extra_connection_string_parameters: String,
}

impl Default for SubscriptionInfo {
    fn default() -> Self {
        Self {
            filter_expression: String::new(),
            throttled: false,
            publish_interval: 1.0,
            udp_port: 0,
            include_time: true,
            enable_time_reasonability_check: false,
            lag_time: 10.0,
            lead_time: 5.0,
            use_local_clock_as_real_time: false,
            use_millisecond_resolution: false,
            request_nan_value_filter: false,
            start_time: String::new(),
            stop_time: String::new(),
            constraint_parameters: String::new(),
            processing_interval: -1,
            extra_connection_string_parameters: String::new(),
        }
    }
}

impl SubscriptionInfo {
    /// Subscribe to everything matching a filter expression.
    pub fn with_filter(filter_expression: impl Into<String>) -> Self {
        Self {
            filter_expression: filter_expression.into(),
            ..Self::default()
        }
    }

    /// Check if this subscription wants a UDP data channel.
    pub fn udp_data_channel(&self) -> bool {
        self.udp_port != 0
    }

    /// Build the semicolon-separated subscription parameter string.
    pub(crate) fn to_connection_string(&self) -> String {
        let mut s = String::with_capacity(256);

        s.push_str(&format!("throttled={};", self.throttled));
        s.push_str(&format!("publishInterval={:.6};", self.publish_interval));
        s.push_str(&format!("includeTime={};", self.include_time));
        s.push_str(&format!(
            "enableTimeReasonabilityCheck={};",
            self.enable_time_reasonability_check
        ));
        s.push_str(&format!("lagTime={:.6};", self.lag_time));
        s.push_str(&format!("leadTime={:.6};", self.lead_time));
        s.push_str(&format!(
            "useLocalClockAsRealTime={};",
            self.use_local_clock_as_real_time
        ));
        s.push_str(&format!(
            "processingInterval={};",
            self.processing_interval
        ));
        s.push_str(&format!(
            "useMillisecondResolution={};",
            self.use_millisecond_resolution
        ));
        s.push_str(&format!(
            "requestNaNValueFilter={};",
            self.request_nan_value_filter
        ));
        s.push_str(&format!(
            "assemblyInfo={{source={ASSEMBLY_SOURCE};version={ASSEMBLY_VERSION};updatedOn=}};"
        ));

        if !self.filter_expression.is_empty() {
            s.push_str(&format!(
                "filterExpression={{{}}};",
                self.filter_expression
            ));
        }

        if self.udp_data_channel() {
            s.push_str(&format!("dataChannel={{localport={}}};", self.udp_port));
        }

        if !self.start_time.is_empty() {
            s.push_str(&format!("startTimeConstraint={};", self.start_time));
        }
        if !self.stop_time.is_empty() {
            s.push_str(&format!("stopTimeConstraint={};", self.stop_time));
        }
        if !self.constraint_parameters.is_empty() {
            s.push_str(&format!(
                "timeConstraintParameters={};",
                self.constraint_parameters
            ));
        }

        if !self.extra_connection_string_parameters.is_empty() {
            s.push_str(&self.extra_connection_string_parameters);
            if !self.extra_connection_string_parameters.ends_with(';') {
                s.push(';');
            }
        }

        s
    }
}

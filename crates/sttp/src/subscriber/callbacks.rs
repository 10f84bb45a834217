//! Per-event callback sinks.
//!
//! Each event the subscriber can surface has one optional sink.
//! Registration takes the write lock; dispatch takes the read lock, so
//! re-registering a callback never races a dispatch in progress.
//!
//! Order-critical events (data start time, new measurements, new buffer
//! blocks, processing complete) are invoked inline on the socket worker
//! to preserve stream order. The rest are fire-and-forget on a helper
//! task so a slow host cannot stall the reader.

use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::cache::SignalIndexCache;
use crate::measurement::Measurement;
use crate::subscriber::buffer_block::BufferBlock;
use crate::ticks::Ticks;

type MessageSink = Arc<dyn Fn(&str) + Send + Sync>;
type VoidSink = Arc<dyn Fn() + Send + Sync>;
type BytesSink = Arc<dyn Fn(&[u8]) + Send + Sync>;
type TicksSink = Arc<dyn Fn(Ticks) + Send + Sync>;
type MeasurementsSink = Arc<dyn Fn(&[Measurement]) + Send + Sync>;
type BufferBlocksSink = Arc<dyn Fn(&[BufferBlock]) + Send + Sync>;
type CacheSink = Arc<dyn Fn(&SignalIndexCache, Uuid) + Send + Sync>;
type UserResponseSink = Arc<dyn Fn(u8, u8, &[u8]) + Send + Sync>;

#[derive(Default)]
struct Registry {
    status_message: Option<MessageSink>,
    error_message: Option<MessageSink>,
    reconnect: Option<VoidSink>,
    metadata_received: Option<BytesSink>,
    subscription_updated: Option<CacheSink>,
    data_start_time: Option<TicksSink>,
    configuration_changed: Option<VoidSink>,
    new_measurements: Option<MeasurementsSink>,
    new_buffer_blocks: Option<BufferBlocksSink>,
    processing_complete: Option<MessageSink>,
    notification_received: Option<MessageSink>,
    connection_established: Option<VoidSink>,
    connection_terminated: Option<VoidSink>,
    user_response: Option<UserResponseSink>,
}

/// Callback router shared by the subscriber and its worker tasks.
#[derive(Default)]
pub(crate) struct CallbackRouter {
    registry: RwLock<Registry>,
}

macro_rules! setter {
    ($set:ident, $field:ident, $($arg:ty),*) => {
        pub fn $set(&self, sink: impl Fn($($arg),*) + Send + Sync + 'static) {
            self.registry.write().unwrap().$field = Some(Arc::new(sink));
        }
    };
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    setter!(set_status_message, status_message, &str);
    setter!(set_error_message, error_message, &str);
    setter!(set_reconnect, reconnect,);
    setter!(set_metadata_received, metadata_received, &[u8]);
    setter!(set_subscription_updated, subscription_updated, &SignalIndexCache, Uuid);
    setter!(set_data_start_time, data_start_time, Ticks);
    setter!(set_configuration_changed, configuration_changed,);
    setter!(set_new_measurements, new_measurements, &[Measurement]);
    setter!(set_new_buffer_blocks, new_buffer_blocks, &[BufferBlock]);
    setter!(set_processing_complete, processing_complete, &str);
    setter!(set_notification_received, notification_received, &str);
    setter!(set_connection_established, connection_established,);
    setter!(set_connection_terminated, connection_terminated,);
    setter!(set_user_response, user_response, u8, u8, &[u8]);

    /// Dispatch an informational message on a helper task.
    pub fn status_message(&self, message: impl Into<String>) {
        if let Some(sink) = self.registry.read().unwrap().status_message.clone() {
            let message = message.into();
            spawn_dispatch(move || sink(&message));
        }
    }

    /// Dispatch an error message on a helper task.
    pub fn error_message(&self, message: impl Into<String>) {
        if let Some(sink) = self.registry.read().unwrap().error_message.clone() {
            let message = message.into();
            spawn_dispatch(move || sink(&message));
        }
    }

    pub fn reconnect(&self) {
        if let Some(sink) = self.registry.read().unwrap().reconnect.clone() {
            spawn_dispatch(move || sink());
        }
    }

    pub fn metadata_received(&self, metadata: Vec<u8>) {
        if let Some(sink) = self.registry.read().unwrap().metadata_received.clone() {
            spawn_dispatch(move || sink(&metadata));
        }
    }

    pub fn subscription_updated(&self, cache: Arc<SignalIndexCache>, subscriber_id: Uuid) {
        if let Some(sink) = self.registry.read().unwrap().subscription_updated.clone() {
            spawn_dispatch(move || sink(&cache, subscriber_id));
        }
    }

    /// Ordered: runs inline on the caller.
    pub fn data_start_time(&self, start_time: Ticks) {
        if let Some(sink) = self.registry.read().unwrap().data_start_time.clone() {
            sink(start_time);
        }
    }

    pub fn configuration_changed(&self) {
        if let Some(sink) = self.registry.read().unwrap().configuration_changed.clone() {
            spawn_dispatch(move || sink());
        }
    }

    /// Ordered: runs inline on the socket worker so measurement order is
    /// preserved end to end.
    pub fn new_measurements(&self, measurements: &[Measurement]) {
        if let Some(sink) = self.registry.read().unwrap().new_measurements.clone() {
            sink(measurements);
        }
    }

    /// Ordered: runs inline on the socket worker.
    pub fn new_buffer_blocks(&self, blocks: &[BufferBlock]) {
        if let Some(sink) = self.registry.read().unwrap().new_buffer_blocks.clone() {
            sink(blocks);
        }
    }

    /// Ordered: the end-of-playback marker must trail its measurements.
    pub fn processing_complete(&self, message: &str) {
        if let Some(sink) = self.registry.read().unwrap().processing_complete.clone() {
            sink(message);
        }
    }

    pub fn notification_received(&self, message: impl Into<String>) {
        if let Some(sink) = self.registry.read().unwrap().notification_received.clone() {
            let message = message.into();
            spawn_dispatch(move || sink(&message));
        }
    }

    pub fn connection_established(&self) {
        if let Some(sink) = self.registry.read().unwrap().connection_established.clone() {
            spawn_dispatch(move || sink());
        }
    }

    pub fn connection_terminated(&self) {
        if let Some(sink) = self.registry.read().unwrap().connection_terminated.clone() {
            spawn_dispatch(move || sink());
        }
    }

    pub fn user_response(&self, response_code: u8, command_code: u8, payload: Vec<u8>) {
        if let Some(sink) = self.registry.read().unwrap().user_response.clone() {
            spawn_dispatch(move || sink(response_code, command_code, &payload));
        }
    }
}

/// Run a sink on a helper task when a runtime is available, inline
/// otherwise (tests may dispatch outside a runtime).
fn spawn_dispatch(f: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unregistered_sinks_are_noops() {
        let router = CallbackRouter::new();
        router.status_message("no listener");
        router.new_measurements(&[]);
        router.connection_terminated();
    }

    #[test]
    fn test_ordered_dispatch_runs_inline() {
        let router = CallbackRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        router.set_new_measurements(move |m| {
            counter.fetch_add(m.len(), Ordering::SeqCst);
        });

        let m = Measurement {
            signal_id: Uuid::nil(),
            value: 1.0,
            timestamp: Ticks(0),
            flags: 0,
        };
        router.new_measurements(&[m, m, m]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reregistration_replaces_sink() {
        let router = CallbackRouter::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&first);
        router.set_data_start_time(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        router.data_start_time(Ticks(1));

        let c = Arc::clone(&second);
        router.set_data_start_time(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        router.data_start_time(Ticks(2));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}

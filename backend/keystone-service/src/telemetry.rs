//! Telemetry sink interface.
//!
//! Components report spans, metrics, and logs through [`TelemetrySink`];
//! nothing in a business path ever blocks on telemetry. The buffered sink
//! drops events once its channel fills and counts the drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    SpanStart { id: u64, name: String },
    SpanEnd { id: u64 },
    Metric { name: String, value: f64 },
    Log { level: LogLevel, message: String },
}

/// Narrow sink interface every component reports through.
pub trait TelemetrySink: Send + Sync {
    fn span_start(&self, name: &str) -> u64;
    fn span_end(&self, id: u64);
    fn record_metric(&self, name: &str, value: f64);
    fn log(&self, level: LogLevel, message: &str);

    /// Events discarded because the sink could not keep up.
    fn dropped(&self) -> u64 {
        0
    }
}

/// Sink that discards everything; used by tests.
#[derive(Debug, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn span_start(&self, _name: &str) -> u64 {
        0
    }
    fn span_end(&self, _id: u64) {}
    fn record_metric(&self, _name: &str, _value: f64) {}
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Buffered sink backed by `tracing`.
///
/// Events go through a bounded channel drained by a background task; a full
/// channel increments the drop counter instead of blocking the caller.
pub struct BufferedSink {
    tx: mpsc::Sender<TelemetryEvent>,
    next_span: AtomicU64,
    dropped: Arc<AtomicU64>,
}

impl BufferedSink {
    pub fn spawn(buffer_size: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel(buffer_size.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                emit(&event);
            }
        });
        Arc::new(Self {
            tx,
            next_span: AtomicU64::new(1),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    fn push(&self, event: TelemetryEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn emit(event: &TelemetryEvent) {
    match event {
        TelemetryEvent::SpanStart { id, name } => {
            tracing::trace!(span_id = id, span = %name, "span start");
        }
        TelemetryEvent::SpanEnd { id } => {
            tracing::trace!(span_id = id, "span end");
        }
        TelemetryEvent::Metric { name, value } => {
            tracing::debug!(metric = %name, value, "metric");
        }
        TelemetryEvent::Log { level, message } => match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        },
    }
}

impl TelemetrySink for BufferedSink {
    fn span_start(&self, name: &str) -> u64 {
        let id = self.next_span.fetch_add(1, Ordering::Relaxed);
        self.push(TelemetryEvent::SpanStart {
            id,
            name: name.to_string(),
        });
        id
    }

    fn span_end(&self, id: u64) {
        self.push(TelemetryEvent::SpanEnd { id });
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.push(TelemetryEvent::Metric {
            name: name.to_string(),
            value,
        });
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.push(TelemetryEvent::Log {
            level,
            message: message.to_string(),
        });
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Install the global tracing subscriber for the process.
pub fn init_tracing(json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keystone_service=info,info"));

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_sink_does_not_block_when_full() {
        let sink = BufferedSink::spawn(1);
        // Flood well past the buffer; calls must return immediately.
        for i in 0..1000 {
            sink.record_metric("flood", i as f64);
        }
        // At least some events were dropped rather than blocking.
        assert!(sink.dropped() > 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = NoopSink;
        let id = sink.span_start("x");
        sink.span_end(id);
        sink.record_metric("m", 1.0);
        sink.log(LogLevel::Info, "hello");
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_span_ids_are_unique() {
        let sink = BufferedSink::spawn(64);
        let a = sink.span_start("a");
        let b = sink.span_start("b");
        assert_ne!(a, b);
    }
}

//! Diagnostic log sink persisting log events to the store.
//!
//! [`StoreLogLayer`] is a tracing layer that hands INFO and above events to
//! a bounded channel without blocking; [`run_log_writer`] drains the channel
//! into the `logs` table in batches.

use crate::db::{LogEntry, Store};

use chrono::Utc;
use std::fmt::{self, Write as _};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_THRESHOLD: usize = 500;

/// Tracing layer feeding the log writer. A full channel drops the entry.
pub struct StoreLogLayer {
    tx: mpsc::Sender<LogEntry>,
}

/// Create the layer and the receiver to pass to [`run_log_writer`].
pub fn store_log_layer(capacity: usize) -> (StoreLogLayer, mpsc::Receiver<LogEntry>) {
    let (tx, rx) = mpsc::channel(capacity);
    (StoreLogLayer { tx }, rx)
}

impl<S: Subscriber> Layer<S> for StoreLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // Flush failures are logged from this module and must not loop back
        if *meta.level() > Level::INFO || meta.target() == module_path!() {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.try_send(LogEntry {
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.message,
            created_at: Utc::now(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.insert_str(0, value);
        } else {
            let _ = write!(self.message, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message.insert_str(0, &format!("{:?}", value));
        } else {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }
}

/// Run the batch writer that accumulates and flushes log entries.
///
/// Exits when the channel closes or `stop` fires, flushing what is pending.
pub async fn run_log_writer(
    mut rx: mpsc::Receiver<LogEntry>,
    store: Store,
    mut stop: broadcast::Receiver<()>,
) {
    let mut buffer: Vec<LogEntry> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(e) => {
                        buffer.push(e);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
            _ = stop.recv() => {
                while let Ok(e) = rx.try_recv() {
                    buffer.push(e);
                }
                flush_buffer(&store, &mut buffer);
                break;
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<LogEntry>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_logs(buffer) {
        tracing::error!("Failed to flush {} log entries: {}", buffer.len(), e);
    }

    buffer.clear();
}

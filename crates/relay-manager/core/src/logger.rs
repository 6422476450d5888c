use std::{fs::OpenOptions, path::Path};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{FormatFields, format::Writer},
    layer::{Context, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    error::RelayError,
    models::{LogEntry, Logger},
};

const LOG_FILENAME: &str = "relay-manager.log";
const DEFAULT_LOG_FILTER: &str = "debug,nostr_relay_pool=info,nostr_sdk=info,tungstenite=warn,tokio_tungstenite=warn,rustls=warn,rustyline=warn";

pub(crate) struct GlobalRelayLogger {
    /// Optional external log listener, that can receive a stream of log statements
    pub(crate) log_listener: Option<Box<dyn Logger>>,
}

impl<S> Layer<S> for GlobalRelayLogger
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().level() > &Level::INFO {
            return;
        }
        let Some(listener) = self.log_listener.as_ref() else {
            return;
        };

        let mut buf = String::new();
        if tracing_subscriber::fmt::format::DefaultFields::new()
            .format_fields(Writer::new(&mut buf), event)
            .is_ok()
        {
            listener.log(LogEntry {
                line: buf,
                level: event.metadata().level().to_string(),
            });
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// Everything passing `log_filter` is appended to `relay-manager.log` in
/// `log_dir`. INFO and above is also forwarded to `app_logger` when given.
pub fn init_logging(
    log_dir: &Path,
    app_logger: Option<Box<dyn Logger>>,
    log_filter: Option<String>,
) -> Result<(), RelayError> {
    std::fs::create_dir_all(log_dir).map_err(|e| RelayError::Generic(e.to_string()))?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILENAME))
        .map_err(|e| RelayError::Generic(e.to_string()))?;

    let filter = log_filter.unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_line_number(true)
                .with_writer(log_file),
        )
        .with(GlobalRelayLogger {
            log_listener: app_logger,
        })
        .try_init()
        .map_err(|e| RelayError::Generic(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct CollectingLogger {
        entries: Arc<Mutex<Vec<LogEntry>>>,
    }

    impl Logger for CollectingLogger {
        fn log(&self, l: LogEntry) {
            self.entries.lock().unwrap().push(l);
        }
    }

    #[test]
    fn test_forwards_info_and_above() {
        let entries = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(GlobalRelayLogger {
            log_listener: Some(Box::new(CollectingLogger {
                entries: entries.clone(),
            })),
        });

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("connect attempt 1 failed");
            tracing::info!("Connected to relay wss://a.relay");
            tracing::warn!("Giving up on relay wss://b.relay");
        });

        let entries = entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, "INFO");
        assert!(entries[0].line.contains("wss://a.relay"));
        assert_eq!(entries[1].level, "WARN");
    }
}

//! Structured logging callbacks
//!
//! [`Loggers`] is the telemetry sink handed to the cluster. Callbacks are
//! purely observational. When a callback is not set, events go to `tracing`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One round-trip to a node
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub node: String,
    pub island: u32,
    pub table: String,
    pub op: &'static str,
    pub elapsed: Duration,
    pub rows: usize,
    pub error: Option<String>,
}

/// An error that was intentionally not propagated
#[derive(Debug, Clone)]
pub struct SwallowedErrorEvent {
    /// Where the error was swallowed, e.g. `privacy:load` or `prewarm`
    pub place: String,
    pub entity: String,
    pub error: String,
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Loggers {
    client_query: Option<Callback<QueryEvent>>,
    swallowed_error: Option<Callback<SwallowedErrorEvent>>,
}

impl Loggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_query(mut self, f: impl Fn(&QueryEvent) + Send + Sync + 'static) -> Self {
        self.client_query = Some(Arc::new(f));
        self
    }

    pub fn with_swallowed_error(
        mut self,
        f: impl Fn(&SwallowedErrorEvent) + Send + Sync + 'static,
    ) -> Self {
        self.swallowed_error = Some(Arc::new(f));
        self
    }

    pub fn client_query(&self, event: &QueryEvent) {
        match &self.client_query {
            Some(f) => f(event),
            None => debug!(
                node = %event.node,
                island = event.island,
                table = %event.table,
                op = event.op,
                elapsed_ms = event.elapsed.as_millis() as u64,
                rows = event.rows,
                error = event.error.as_deref().unwrap_or(""),
                "query"
            ),
        }
    }

    pub fn swallowed_error(&self, event: &SwallowedErrorEvent) {
        match &self.swallowed_error {
            Some(f) => f(event),
            None => warn!(
                place = %event.place,
                entity = %event.entity,
                "Swallowed error: {}",
                event.error
            ),
        }
    }
}

impl fmt::Debug for Loggers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loggers")
            .field("client_query", &self.client_query.is_some())
            .field("swallowed_error", &self.swallowed_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_callbacks_receive_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let loggers = Loggers::new()
            .with_swallowed_error(move |e| sink.lock().unwrap().push(e.place.clone()));

        loggers.swallowed_error(&SwallowedErrorEvent {
            place: "privacy:load".to_string(),
            entity: "comments".to_string(),
            error: "denied".to_string(),
        });
        // No callback set: goes to tracing, must not panic
        loggers.client_query(&QueryEvent {
            node: "island0-master".to_string(),
            island: 0,
            table: "users".to_string(),
            op: "select",
            elapsed: Duration::from_millis(3),
            rows: 1,
            error: None,
        });

        assert_eq!(seen.lock().unwrap().as_slice(), ["privacy:load".to_string()]);
    }
}

//! Query metrics and tracing spans
//!
//! With the `metrics` feature, [`METRICS`] records OpenTelemetry instruments from the global
//! meter provider; call [`install_prometheus_exporter`] once at startup, before the first query,
//! to expose them through a `prometheus::Registry`. With the `tracing` feature,
//! [`tracing_helpers`] builds the spans the executor and unit of work enter.

#[cfg(feature = "metrics")]
pub use otel::{install_prometheus_exporter, MetricsError, TouchlineMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram},
        KeyValue,
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use std::time::Duration;

    pub static METRICS: Lazy<TouchlineMetrics> = Lazy::new(TouchlineMetrics::init);

    #[derive(Debug, thiserror::Error)]
    #[error("failed to install prometheus exporter: {0}")]
    pub struct MetricsError(String);

    /// Route the global meter provider into `registry`
    pub fn install_prometheus_exporter(registry: &prometheus::Registry) -> Result<(), MetricsError> {
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| MetricsError(e.to_string()))?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        global::set_meter_provider(provider);
        Ok(())
    }

    pub struct TouchlineMetrics {
        pub queries_total: Counter<u64>,
        pub query_errors_total: Counter<u64>,
        pub query_duration: Histogram<f64>,
        pub connection_wait: Histogram<f64>,
        pub transactions_total: Counter<u64>,
    }

    impl TouchlineMetrics {
        pub fn init() -> Self {
            let meter = global::meter("touchline");

            let queries_total = meter
                .u64_counter("touchline_queries_total")
                .with_description("Total statements executed")
                .build();

            let query_errors_total = meter
                .u64_counter("touchline_query_errors_total")
                .with_description("Statements that returned an error")
                .build();

            let query_duration = meter
                .f64_histogram("touchline_query_duration_seconds")
                .with_description("Duration of statements")
                .build();

            let connection_wait = meter
                .f64_histogram("touchline_connection_wait_seconds")
                .with_description("Time spent establishing connections")
                .build();

            let transactions_total = meter
                .u64_counter("touchline_transactions_total")
                .with_description("Transactions finished, by outcome")
                .build();

            Self {
                queries_total,
                query_errors_total,
                query_duration,
                connection_wait,
                transactions_total,
            }
        }

        pub fn record_query_duration(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_connection_wait(&self, elapsed: Duration) {
            self.connection_wait.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_transaction(&self, outcome: &'static str) {
            self.transactions_total
                .add(1, &[KeyValue::new("outcome", outcome)]);
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    /// Longest statement prefix recorded on a span
    const MAX_STATEMENT_LEN: usize = 512;

    fn truncate(sql: &str) -> &str {
        match sql.char_indices().nth(MAX_STATEMENT_LEN) {
            Some((idx, _)) => &sql[..idx],
            None => sql,
        }
    }

    pub fn execute_query_span(sql: &str) -> Span {
        info_span!("touchline.query", db.system = "postgresql", db.statement = truncate(sql))
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("touchline.transaction.begin", db.system = "postgresql")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("touchline.transaction.commit", db.system = "postgresql")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("touchline.transaction.rollback", db.system = "postgresql")
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("touchline.connect", db.system = "postgresql")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_truncate_long_statement() {
            let sql = "x".repeat(MAX_STATEMENT_LEN + 10);
            assert_eq!(truncate(&sql).len(), MAX_STATEMENT_LEN);
            assert_eq!(truncate("SELECT 1"), "SELECT 1");
        }
    }
}

use histogram::{AtomicHistogram, Histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// Error that occurred upon a metrics operation.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Histogram error: {0}")]
    HistogramError(#[from] Arc<dyn std::error::Error + Send + Sync>),
    #[error("Histogram is empty")]
    Empty,
}

/// Counters and a latency histogram describing the health of the pools:
/// connection churn, reconnect pressure and connection-setup latency.
pub struct Metrics {
    total_connections: AtomicU64,
    connection_timeouts: AtomicU64,
    reconnect_attempts: AtomicU64,
    pools_opened: AtomicU64,
    pools_closed: AtomicU64,
    setup_histogram: Arc<AtomicHistogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Increments the live-connection gauge.
    pub(crate) fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, ORDER_TYPE);
    }

    /// Decrements the live-connection gauge.
    pub(crate) fn dec_total_connections(&self) {
        self.total_connections.fetch_sub(1, ORDER_TYPE);
    }

    /// Increments counter for connection attempts that hit the connect
    /// timeout.
    pub(crate) fn inc_connection_timeouts(&self) {
        self.connection_timeouts.fetch_add(1, ORDER_TYPE);
    }

    /// Increments counter for reconnect attempts issued by pools.
    pub(crate) fn inc_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn inc_pools_opened(&self) {
        self.pools_opened.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn inc_pools_closed(&self) {
        self.pools_closed.fetch_add(1, ORDER_TYPE);
    }

    /// Saves to histogram the latency of establishing a connection, in
    /// microseconds.
    pub(crate) fn log_connection_setup_latency(&self, latency: u64) -> Result<(), MetricsError> {
        if let Err(err) = self.setup_histogram.increment(latency) {
            Err(MetricsError::HistogramError(Arc::new(err)))
        } else {
            Ok(())
        }
    }

    /// Returns the number of currently open connections.
    pub fn get_total_connections(&self) -> u64 {
        self.total_connections.load(ORDER_TYPE)
    }

    /// Returns counter for connect timeouts.
    pub fn get_connection_timeouts(&self) -> u64 {
        self.connection_timeouts.load(ORDER_TYPE)
    }

    /// Returns counter for reconnect attempts issued by pools.
    pub fn get_reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(ORDER_TYPE)
    }

    /// Returns counter for pools that completed their initial fill.
    pub fn get_pools_opened(&self) -> u64 {
        self.pools_opened.load(ORDER_TYPE)
    }

    /// Returns counter for pools that were closed and removed.
    pub fn get_pools_closed(&self) -> u64 {
        self.pools_closed.load(ORDER_TYPE)
    }

    /// Returns average connection-setup latency in microseconds.
    pub fn get_setup_latency_avg_us(&self) -> Result<u64, MetricsError> {
        Self::mean(&self.setup_histogram.load())
    }

    /// Returns connection-setup latency from the histogram for a given
    /// percentile (0.0 - 100.0).
    pub fn get_setup_latency_percentile_us(&self, percentile: f64) -> Result<u64, MetricsError> {
        let res = self.setup_histogram.load().percentile(percentile);

        match res {
            Err(err) => Err(MetricsError::HistogramError(Arc::new(err))),
            Ok(None) => Err(MetricsError::Empty),
            Ok(Some(p)) => Ok(p.count()),
        }
    }

    // Compute the mean (count each bucket as its interval's center).
    fn mean(h: &Histogram) -> Result<u64, MetricsError> {
        let mut weighted_sum = 0_u128;
        let mut count = 0_u128;

        for bucket in h {
            let mid = ((bucket.start() + bucket.end()) / 2) as u128;
            weighted_sum += mid * bucket.count() as u128;
            count += bucket.count() as u128;
        }

        if count != 0 {
            Ok((weighted_sum / count) as u64)
        } else {
            Err(MetricsError::Empty)
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        // Configuration:
        //  - exponent of max value: n = 16
        //  - inverse exponent of relative error: p = 12
        // Reference for calculating these values:
        //  - https://observablehq.com/@iopsystems/h2histogram
        let max_value_power = 16;
        let grouping_power = 12;

        Self {
            total_connections: AtomicU64::new(0),
            connection_timeouts: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            pools_opened: AtomicU64::new(0),
            pools_closed: AtomicU64::new(0),
            setup_histogram: Arc::new(AtomicHistogram::new(grouping_power, max_value_power).unwrap()),
        }
    }
}

use std::time::Duration;

#[derive(Clone, Debug)]
#[allow(missing_copy_implementations)]
/// Settings for a [`DatafrontClient`](crate::DatafrontClient).
pub struct DatafrontSettings {
    /// How long a sent request may wait for its response before it resolves
    /// with a retryable timeout error.
    ///
    /// ## Default
    /// 10 seconds
    pub request_timeout: Duration,
    /// How long a query without observers is kept before it is evicted.
    /// Survives quick unmount/remount cycles such as navigation.
    ///
    /// ## Default
    /// 30 seconds
    pub query_gc_grace: Duration,
    /// How long an entity no query references is kept after it was last
    /// written.
    ///
    /// ## Default
    /// 30 seconds
    pub entity_gc_grace: Duration,
    /// Maximum number of outbound messages waiting for a transport.
    /// Sends beyond this fail immediately with a retryable network error.
    ///
    /// ## Default
    /// 500
    pub outbound_capacity: usize,
    /// Warn when the outbound queue exceeds this percentage of its capacity.
    ///
    /// ## Default
    /// 80
    pub outbound_warning_threshold: u8,
    /// Capacity of the bounded channel a transport link writes into.
    ///
    /// ## Default
    /// 64
    pub transport_channel_capacity: usize,
}

impl Default for DatafrontSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            query_gc_grace: Duration::from_secs(30),
            entity_gc_grace: Duration::from_secs(30),
            outbound_capacity: 500,
            outbound_warning_threshold: 80,
            transport_channel_capacity: 64,
        }
    }
}

impl DatafrontSettings {
    /// Queue depth at which a warning is logged.
    pub(crate) fn outbound_warning_depth(&self) -> usize {
        self.outbound_capacity * usize::from(self.outbound_warning_threshold.min(100)) / 100
    }
}

use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("gateway_requests_total", "Total number of requests").unwrap();
    pub static ref RATE_LIMITED: Counter =
        register_counter!("gateway_rate_limited_total", "Requests rejected by admission control").unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("gateway_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("gateway_cache_misses_total", "Total cache misses").unwrap();
    pub static ref CACHE_WRITE_FAILURES: Counter = register_counter!(
        "gateway_cache_write_failures_total",
        "Cache writes that failed or timed out"
    )
    .unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "gateway_request_latency_seconds",
        "Request latency in seconds"
    )
    .unwrap();
    pub static ref TRACKED_CLIENTS: Gauge =
        register_gauge!("gateway_tracked_clients", "Clients currently held by the rate limiter").unwrap();
}

//! Telemetry metrics used throughout QuicFuscate.
//!
//! Currently exported metrics:
//! - `encoded_packets_total` / `decoded_packets_total`: FEC throughput.
//! - `loss_rate_percent`: Current estimated loss rate multiplied by 100.
//! - `fec_mode` / `fec_mode_switch_total`: Active FEC mode and transitions.
//! - `dns_errors_total`: Number of DoH resolution errors.
//! - `bytes_sent_total` / `bytes_received_total`: UDP bytes via the connection core.
//! - `path_mtu_outgoing` / `path_mtu_incoming`: Current validated MTU per direction.
//! - `mtu_blackholes_total`: Path MTU blackhole detections.
//! - `bbr_state`: Active BBRv2 state as a numeric value.
//! - `bbr_pacing_rate_bps` / `bbr_cwnd_bytes`: Current BBRv2 pacing rate and cwnd.
//! - `path_migrations_total` / `path_migration_failures_total`: Migration outcomes.
//! - `cpu_feature_mask` / `simd_active_policy`: Detected CPU features and
//!   whether `crypto` selected a SIMD-accelerated cipher, set once by
//!   `record_cpu_features` from `CipherSuiteSelector::new`.
//! - `memory_usage_bytes`: Resident memory usage of the process.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};
use sysinfo::{PidExt, SystemExt};

lazy_static! {
    pub static ref ENCODED_PACKETS: IntCounter =
        register_int_counter!("encoded_packets_total", "Total encoded packets").unwrap();
    pub static ref DECODED_PACKETS: IntCounter =
        register_int_counter!("decoded_packets_total", "Total decoded packets").unwrap();
    pub static ref LOSS_RATE: IntGauge =
        register_int_gauge!("loss_rate_percent", "Current loss rate * 100").unwrap();
    pub static ref FEC_MODE: IntGauge =
        register_int_gauge!("fec_mode", "Current FEC mode").unwrap();
    pub static ref FEC_MODE_SWITCHES: IntCounter =
        register_int_counter!("fec_mode_switch_total", "FEC mode transitions").unwrap();
    pub static ref DNS_ERRORS: IntCounter =
        register_int_counter!("dns_errors_total", "Number of DoH resolution errors").unwrap();
    pub static ref BYTES_SENT: IntCounter =
        register_int_counter!("bytes_sent_total", "Total UDP bytes sent").unwrap();
    pub static ref BYTES_RECEIVED: IntCounter =
        register_int_counter!("bytes_received_total", "Total UDP bytes received").unwrap();
    pub static ref PATH_MTU_OUTGOING: IntGauge =
        register_int_gauge!("path_mtu_outgoing", "Current outgoing path MTU").unwrap();
    pub static ref PATH_MTU_INCOMING: IntGauge =
        register_int_gauge!("path_mtu_incoming", "Current incoming path MTU").unwrap();
    pub static ref MTU_BLACKHOLES: IntCounter =
        register_int_counter!("mtu_blackholes_total", "Path MTU blackhole detections").unwrap();
    pub static ref BBR_STATE: IntGauge =
        register_int_gauge!("bbr_state", "Active BBRv2 state").unwrap();
    pub static ref BBR_PACING_RATE_BPS: IntGauge =
        register_int_gauge!("bbr_pacing_rate_bps", "Current BBRv2 pacing rate in bits/sec").unwrap();
    pub static ref BBR_CWND_BYTES: IntGauge =
        register_int_gauge!("bbr_cwnd_bytes", "Current BBRv2 congestion window in bytes").unwrap();
    pub static ref PATH_MIGRATIONS: IntCounter =
        register_int_counter!("path_migrations_total", "Successful connection migrations").unwrap();
    pub static ref PATH_MIGRATION_FAILURES: IntCounter = register_int_counter!(
        "path_migration_failures_total",
        "Connection migration attempts that failed"
    )
    .unwrap();
    pub static ref CPU_FEATURE_MASK: IntGauge =
        register_int_gauge!("cpu_feature_mask", "Detected CPU features bitmask").unwrap();
    pub static ref SIMD_ACTIVE: IntGauge =
        register_int_gauge!("simd_active_policy", "Active SIMD policy").unwrap();
    pub static ref MEMORY_USAGE_BYTES: IntGauge =
        register_int_gauge!("memory_usage_bytes", "Resident memory usage of the process").unwrap();
}

/// Records the detected CPU feature bitmask and the SIMD policy `crypto`
/// selected from it, so both are visible on the metrics endpoint without the
/// caller threading a selector reference through telemetry.
pub fn record_cpu_features(mask: i64, simd_active: bool) {
    CPU_FEATURE_MASK.set(mask);
    SIMD_ACTIVE.set(simd_active as i64);
}

pub fn update_memory_usage() {
    let mut sys = sysinfo::System::new();
    sys.refresh_process(sysinfo::get_current_pid().unwrap());
    if let Some(proc) = sys.process(sysinfo::get_current_pid().unwrap()) {
        MEMORY_USAGE_BYTES.set(proc.memory() as i64 * 1024);
    }
}

pub fn serve(addr: &str) {
    use std::io::Write;
    use std::net::TcpListener;
    let listener = TcpListener::bind(addr).expect("bind metrics");
    std::thread::spawn(move || {
        let encoder = TextEncoder::new();
        for stream in listener.incoming() {
            if let Ok(mut s) = stream {
                let metrics = prometheus::gather();
                let mut buf = Vec::new();
                encoder.encode(&metrics, &mut buf).unwrap();
                let _ = s.write_all(&buf);
            }
        }
    });
}

pub fn flush() {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&metrics, &mut buf).is_ok() {
        log::info!("\n{}", String::from_utf8_lossy(&buf));
    }
}

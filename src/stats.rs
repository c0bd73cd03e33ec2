//! Turns raw counters into throughput, loss and CPU "hog factor".
//!
//! All time values are expressed in ticks of 1/100 s, the unit the server
//! uses for its CPU time on the wire. Ratios are computed in floating point
//! and reported without truncation.

use crate::config::{Direction, IpVersion, Protocol};
use crate::protocol::ResultReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Ticks per second for every tick value in this module.
pub const TICKS_PER_SECOND: u64 = 100;

/// Converts a duration into whole ticks.
pub fn to_ticks(duration: Duration) -> u64 {
    (duration.as_millis() / (1000 / TICKS_PER_SECOND as u128)) as u64
}

/// Everything the client knows when the result report has arrived.
#[derive(Debug, Clone)]
pub struct StatsInput {
    /// Client wall time from loop entry to loop exit
    pub elapsed: Duration,
    /// Client CPU time (user + system) over the same window
    pub client_cpu: Duration,
    pub packets_sent: u64,
    pub report: ResultReport,
    /// Window of one UDP receive; each server timeout removes this much
    pub udp_timeout: Duration,
    pub packet_len: usize,
    pub direction: Direction,
}

/// Derived figures of one session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Measurement window in ticks after the timeout correction, at least 1
    pub effective_ticks: u64,
    pub throughput_kib_per_sec: f64,
    pub lost_packets: u64,
    pub loss_percent: f64,
    /// Client CPU as a percentage of the measurement window
    pub client_hog_percent: f64,
    /// Server CPU as a percentage of the measurement window
    pub server_hog_percent: f64,
}

impl Statistics {
    /// Computes the statistics of a finished session.
    ///
    /// Time the server spent waiting out UDP timeouts is removed from the
    /// window first, so idle waiting on lost datagrams does not lower the
    /// throughput. The window never drops below one tick.
    ///
    /// # Examples
    ///
    /// ```
    /// use attract::protocol::ResultReport;
    /// use attract::stats::{Statistics, StatsInput};
    /// use attract::Direction;
    /// use std::time::Duration;
    ///
    /// let stats = Statistics::compute(&StatsInput {
    ///     elapsed: Duration::from_secs(1),
    ///     client_cpu: Duration::from_millis(250),
    ///     packets_sent: 2048,
    ///     report: ResultReport { packets_received: 2048, timeouts: 0, server_cpu_ticks: 50 },
    ///     udp_timeout: Duration::from_secs(5),
    ///     packet_len: 512,
    ///     direction: Direction::Uni,
    /// });
    ///
    /// assert_eq!(stats.throughput_kib_per_sec, 1024.0);
    /// assert_eq!(stats.loss_percent, 0.0);
    /// assert_eq!(stats.client_hog_percent, 25.0);
    /// assert_eq!(stats.server_hog_percent, 50.0);
    /// ```
    pub fn compute(input: &StatsInput) -> Self {
        let idle_ticks = input
            .report
            .timeouts
            .saturating_mul(to_ticks(input.udp_timeout));
        let effective_ticks = to_ticks(input.elapsed).saturating_sub(idle_ticks).max(1);
        let window = effective_ticks as f64;

        let received = input.report.packets_received;
        let bytes = received as f64 * input.packet_len as f64 * input.direction.factor() as f64;
        let throughput_kib_per_sec = bytes * TICKS_PER_SECOND as f64 / window / 1024.0;

        let lost_packets = input.packets_sent.saturating_sub(received);
        let loss_percent = if input.packets_sent == 0 {
            0.0
        } else {
            lost_packets as f64 * 100.0 / input.packets_sent as f64
        };

        let client_hog_percent = to_ticks(input.client_cpu) as f64 * 100.0 / window;
        let server_hog_percent = input.report.server_cpu_ticks as f64 * 100.0 / window;

        Statistics {
            effective_ticks,
            throughput_kib_per_sec,
            lost_packets,
            loss_percent,
            client_hog_percent,
            server_hog_percent,
        }
    }

    /// The corrected measurement window in seconds.
    pub fn effective_secs(&self) -> f64 {
        self.effective_ticks as f64 / TICKS_PER_SECOND as f64
    }
}

/// Host and time the report was produced on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    pub system_info: String,
    pub timestamp: i64,
    pub timestamp_str: String,
}

pub fn get_system_info() -> SystemInfo {
    let now = chrono::Utc::now();
    SystemInfo {
        version: format!("attract {}", env!("CARGO_PKG_VERSION")),
        system_info: format!(
            "{} {} {}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        ),
        timestamp_str: now.to_rfc2822(),
        timestamp: now.timestamp(),
    }
}

/// Final result of a client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Family the control connection actually used
    pub ip_version: IpVersion,
    pub protocol: Protocol,
    pub direction: Direction,
    pub packet_len: usize,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub server_timeouts: u64,
    #[serde(flatten)]
    pub stats: Statistics,
    pub system: SystemInfo,
}

impl Report {
    /// One line of space-separated fields for scripts:
    /// `ipver direction protocol length sent secs KiB/s lost loss% hog-client hog-server`.
    pub fn raw_line(&self) -> String {
        format!(
            "{} {:<3} {} {:6} {:8} {:7.2} {:9.0} {:9} {:6.2} {:7.2} {:7.2}",
            self.ip_version,
            self.direction,
            self.protocol,
            self.packet_len,
            self.packets_sent,
            self.stats.effective_secs(),
            self.stats.throughput_kib_per_sec,
            self.stats.lost_packets,
            self.stats.loss_percent,
            self.stats.client_hog_percent,
            self.stats.server_hog_percent,
        )
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Uni => "Uni",
            Direction::Bi => "Bi",
        };
        let protocol = match self.protocol {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        };

        writeln!(
            f,
            "{}directional transfer via {}v{} with size {} bytes:",
            direction, protocol, self.ip_version, self.packet_len
        )?;
        writeln!(
            f,
            "\t{} packets in {:.2} seconds = {:.0} K/s ({} packets lost = {:.2}%)",
            self.packets_sent,
            self.stats.effective_secs(),
            self.stats.throughput_kib_per_sec,
            self.stats.lost_packets,
            self.stats.loss_percent
        )?;
        write!(
            f,
            "\thog-factor client: {:.2}%, hog-factor server: {:.2}%",
            self.stats.client_hog_percent, self.stats.server_hog_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(sent: u64, received: u64, timeouts: u64) -> StatsInput {
        StatsInput {
            elapsed: Duration::from_secs(2),
            client_cpu: Duration::from_millis(500),
            packets_sent: sent,
            report: ResultReport {
                packets_received: received,
                timeouts,
                server_cpu_ticks: 20,
            },
            udp_timeout: Duration::from_millis(100),
            packet_len: 1024,
            direction: Direction::Uni,
        }
    }

    #[test]
    fn test_to_ticks() {
        assert_eq!(to_ticks(Duration::from_secs(1)), 100);
        assert_eq!(to_ticks(Duration::from_millis(19)), 1);
        assert_eq!(to_ticks(Duration::ZERO), 0);
    }

    #[test]
    fn test_zero_received_means_zero_throughput() {
        let stats = Statistics::compute(&input(100, 0, 0));
        assert_eq!(stats.throughput_kib_per_sec, 0.0);
        assert_eq!(stats.lost_packets, 100);
        assert_eq!(stats.loss_percent, 100.0);
    }

    #[test]
    fn test_nothing_sent_is_zero_loss() {
        let stats = Statistics::compute(&input(0, 0, 0));
        assert_eq!(stats.loss_percent, 0.0);
        assert_eq!(stats.lost_packets, 0);
    }

    #[test]
    fn test_loss_percent_bounds() {
        for (sent, received) in [(1, 0), (1, 1), (10, 3), (1000, 999), (7, 9)] {
            let stats = Statistics::compute(&input(sent, received, 0));
            assert!(stats.loss_percent >= 0.0 && stats.loss_percent <= 100.0);
        }
    }

    #[test]
    fn test_timeouts_shrink_window() {
        // 2 s elapsed, 5 timeouts of 100 ms: 1.5 s effective
        let stats = Statistics::compute(&input(100, 90, 5));
        assert_eq!(stats.effective_ticks, 150);
        assert_eq!(stats.effective_secs(), 1.5);
        assert_eq!(stats.lost_packets, 10);
        assert_eq!(stats.loss_percent, 10.0);
        // 90 KiB over 1.5 s
        assert!((stats.throughput_kib_per_sec - 60.0).abs() < 1e-9);
        assert!((stats.client_hog_percent - 100.0 * 50.0 / 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_floored_at_one_tick() {
        let mut short = input(10, 10, 1000);
        short.elapsed = Duration::from_millis(3);
        let stats = Statistics::compute(&short);
        assert_eq!(stats.effective_ticks, 1);
        assert!(stats.throughput_kib_per_sec.is_finite());
    }

    #[test]
    fn test_bidirectional_doubles_throughput() {
        let uni = Statistics::compute(&input(100, 100, 0));
        let mut bi_input = input(100, 100, 0);
        bi_input.direction = Direction::Bi;
        let bi = Statistics::compute(&bi_input);
        assert_eq!(bi.throughput_kib_per_sec, 2.0 * uni.throughput_kib_per_sec);
    }

    #[test]
    fn test_report_formats() {
        let report = Report {
            ip_version: IpVersion::V6,
            protocol: Protocol::Tcp,
            direction: Direction::Uni,
            packet_len: 512,
            packets_sent: 100,
            packets_received: 100,
            server_timeouts: 0,
            stats: Statistics::compute(&StatsInput {
                elapsed: Duration::from_secs(1),
                client_cpu: Duration::ZERO,
                packets_sent: 100,
                report: ResultReport {
                    packets_received: 100,
                    timeouts: 0,
                    server_cpu_ticks: 0,
                },
                udp_timeout: Duration::from_secs(5),
                packet_len: 512,
                direction: Direction::Uni,
            }),
            system: get_system_info(),
        };

        let text = report.to_string();
        assert!(text.starts_with("Unidirectional transfer via TCPv6 with size 512 bytes:"));
        assert!(text.contains("100 packets in 1.00 seconds = 50 K/s (0 packets lost = 0.00%)"));

        let raw = report.raw_line();
        let fields: Vec<&str> = raw.split_whitespace().collect();
        assert_eq!(fields.len(), 11);
        assert_eq!(&fields[..5], &["6", "uni", "tcp", "512", "100"]);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["ip_version"], "V6");
        assert_eq!(json["lost_packets"], 0);
    }
}

use log::debug;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Phase of one side's measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Packets are flowing.
    Running,
    /// The end-of-transfer packet has been sent or seen; the result report
    /// is being exchanged.
    Draining,
    /// Nothing left to do.
    Done,
}

/// User plus system CPU time consumed by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub user: Duration,
    pub system: Duration,
}

impl CpuTimes {
    /// Takes a snapshot of the process CPU usage.
    ///
    /// The figure covers the whole process, so concurrent server sessions
    /// see each other's CPU time.
    #[cfg(unix)]
    pub fn now() -> Self {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
        if rc != 0 {
            debug!("getrusage failed: {}", std::io::Error::last_os_error());
            return Self::default();
        }

        Self {
            user: timeval_to_duration(usage.ru_utime),
            system: timeval_to_duration(usage.ru_stime),
        }
    }

    #[cfg(not(unix))]
    pub fn now() -> Self {
        Self::default()
    }

    pub fn total(&self) -> Duration {
        self.user + self.system
    }

    /// CPU time spent between `earlier` and `self`.
    pub fn since(&self, earlier: &CpuTimes) -> Duration {
        self.total().saturating_sub(earlier.total())
    }
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Counters of one measurement, owned by exactly one worker.
///
/// Nothing here is shared: the client owns its state for the whole run and
/// every server worker creates its own.
#[derive(Debug, Clone)]
pub struct MeasurementState {
    pub phase: Phase,
    pub packets_sent: u64,
    /// Packets received (server) or echoes received (bidirectional client)
    pub packets_received: u64,
    /// UDP receives that ran into the timeout window
    pub timeouts: u64,
    pub started: Instant,
    pub finished: Option<Instant>,
    pub cpu_start: CpuTimes,
    pub cpu_end: Option<CpuTimes>,
}

impl MeasurementState {
    /// Starts the clock and takes the first CPU snapshot.
    pub fn start() -> Self {
        Self {
            phase: Phase::Running,
            packets_sent: 0,
            packets_received: 0,
            timeouts: 0,
            started: Instant::now(),
            finished: None,
            cpu_start: CpuTimes::now(),
            cpu_end: None,
        }
    }

    /// Leaves the packet loop. The clock keeps running until [`stop_clock`].
    ///
    /// [`stop_clock`]: MeasurementState::stop_clock
    pub fn begin_drain(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        self.phase = Phase::Draining;
        debug!(
            "draining after {} sent, {} received, {} timeouts",
            self.packets_sent, self.packets_received, self.timeouts
        );
    }

    /// Freezes elapsed time and takes the closing CPU snapshot. Only the
    /// first call counts.
    pub fn stop_clock(&mut self) {
        if self.finished.is_none() {
            self.finished = Some(Instant::now());
            self.cpu_end = Some(CpuTimes::now());
        }
    }

    pub fn finish(&mut self) {
        self.stop_clock();
        self.phase = Phase::Done;
    }

    /// Wall time from loop entry until the clock was stopped (or until now).
    pub fn elapsed(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }

    /// CPU time consumed over the same window as [`elapsed`](Self::elapsed).
    pub fn cpu_used(&self) -> Duration {
        self.cpu_end
            .unwrap_or_else(CpuTimes::now)
            .since(&self.cpu_start)
    }
}

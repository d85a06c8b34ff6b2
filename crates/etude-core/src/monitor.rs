//! Resource monitoring thread
//!
//! Samples process CPU time and resident memory on a fixed interval and
//! publishes snapshots over a bounded channel. When the receiver lags the
//! oldest snapshot is dropped, so the sampling thread never blocks on a
//! slow consumer.
//!
//! Real numbers are available on Linux (`/proc/self`); other platforms
//! report `None` rather than a synthetic value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, warn};

use crate::error::{Error, Result};

/// One sample of process resource usage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    /// Milliseconds since the Unix epoch at sample time.
    pub timestamp_ms: u64,

    /// Resident set size in bytes, if the platform exposes it.
    pub rss_bytes: Option<u64>,

    /// Process CPU utilization over the last interval, percent of one
    /// core (can exceed 100 on multi-threaded work).
    pub cpu_percent: Option<f32>,
}

const CHANNEL_DEPTH: usize = 64;

/// Background sampler. Reads registries and `/proc`; mutates nothing.
pub struct ResourceMonitor {
    interval: Duration,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    rx: Receiver<ResourceSnapshot>,
    tx_template: Option<Sender<ResourceSnapshot>>,
}

impl ResourceMonitor {
    /// Creates a monitor that will sample every `interval` once started.
    pub fn new(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::invalid_argument("monitor interval must be > 0"));
        }
        let (tx, rx) = bounded(CHANNEL_DEPTH);
        Ok(Self {
            interval,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
            rx,
            tx_template: Some(tx),
        })
    }

    /// Spawns the sampling thread. A second call while running returns
    /// [`Error::AlreadyInitialized`].
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::AlreadyInitialized("resource monitor"));
        }
        let tx = self
            .tx_template
            .take()
            .ok_or(Error::NotInitialized("resource monitor channel"))?;
        let stop = Arc::clone(&self.stop);
        let interval = self.interval;

        self.handle = Some(std::thread::spawn(move || {
            sample_loop(tx, stop, interval);
        }));
        debug!("resource monitor started ({:?} interval)", self.interval);
        Ok(())
    }

    /// Receiver end of the snapshot stream.
    pub fn snapshots(&self) -> &Receiver<ResourceSnapshot> {
        &self.rx
    }

    /// Drains the channel and returns the most recent snapshot, if any.
    pub fn latest(&self) -> Option<ResourceSnapshot> {
        let mut last = None;
        while let Ok(snapshot) = self.rx.try_recv() {
            last = Some(snapshot);
        }
        last
    }

    /// Signals the thread and joins it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("resource monitor thread panicked");
            }
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sample_loop(tx: Sender<ResourceSnapshot>, stop: Arc<AtomicBool>, interval: Duration) {
    let mut prev_cpu = cpu_time_seconds();
    let mut prev_wall = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(interval);
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let now_wall = Instant::now();
        let now_cpu = cpu_time_seconds();
        let cpu_percent = match (prev_cpu, now_cpu) {
            (Some(a), Some(b)) => {
                let wall = now_wall.duration_since(prev_wall).as_secs_f64();
                if wall > 0.0 {
                    Some((((b - a) / wall) * 100.0) as f32)
                } else {
                    None
                }
            }
            _ => None,
        };
        prev_cpu = now_cpu;
        prev_wall = now_wall;

        let snapshot = ResourceSnapshot {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            rss_bytes: rss_bytes(),
            cpu_percent,
        };

        match tx.try_send(snapshot) {
            Ok(()) => {}
            Err(TrySendError::Full(snapshot)) => {
                // Receiver is lagging; drop the oldest and retry once.
                // Never block the sampler.
                let _ = tx.try_send(snapshot);
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
}

/// Cumulative process CPU time (user + system) in seconds.
#[cfg(target_os = "linux")]
fn cpu_time_seconds() -> Option<f64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Field 2 (comm) may contain spaces; skip past the closing paren.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // utime and stime are fields 14 and 15 of the full line; after the
    // paren split they sit at indices 11 and 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    Some((utime + stime) as f64 / ticks_per_sec as f64)
}

#[cfg(not(target_os = "linux"))]
fn cpu_time_seconds() -> Option<f64> {
    None
}

/// Current resident set size in bytes.
#[cfg(target_os = "linux")]
fn rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            ResourceMonitor::new(Duration::ZERO),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_double_start_is_already_initialized() {
        let mut monitor = ResourceMonitor::new(Duration::from_millis(10)).unwrap();
        monitor.start().unwrap();
        assert!(matches!(
            monitor.start(),
            Err(Error::AlreadyInitialized(_))
        ));
        monitor.stop();
    }

    #[test]
    fn test_snapshots_arrive() {
        let mut monitor = ResourceMonitor::new(Duration::from_millis(5)).unwrap();
        monitor.start().unwrap();
        let snapshot = monitor
            .snapshots()
            .recv_timeout(Duration::from_secs(2))
            .expect("no snapshot within 2s");
        assert!(snapshot.timestamp_ms > 0);
        monitor.stop();
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_linux_exposes_rss() {
        assert!(rss_bytes().unwrap() > 0);
        assert!(cpu_time_seconds().is_some());
    }
}

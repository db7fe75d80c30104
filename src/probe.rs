//! Liveness probing for candidate addresses
//!
//! Provides:
//! - The `LivenessProbe` interface and an ICMP implementation using `ping`
//! - Windowed concurrent probing with cancellation of in-flight probes
//!
//! An address counts as free only when it produced no echo replies.

use crate::error::{Error, Result};
use crossbeam::channel;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of probing one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// At least one reply was received
    Responding,
    /// No reply within the probe window
    Silent,
    /// Probe abandoned because another candidate already won
    Cancelled,
}

/// Checks whether an address is answering on the wire
pub trait LivenessProbe: Send + Sync {
    /// Probe `ip`, giving up early once `cancel` is raised
    fn probe(&self, ip: Ipv4Addr, cancel: &AtomicBool) -> Result<Liveness>;
}

/// Flag and exit-status conventions of the system `ping`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingStyle {
    /// iputils: `-W` in seconds, exit 1 when nothing answered
    Linux,
    /// FreeBSD and macOS: `-W` in milliseconds, exit 2 when nothing answered
    Bsd,
}

impl PingStyle {
    /// Convention of the platform we were built for
    pub fn native() -> Self {
        if cfg!(any(target_os = "freebsd", target_os = "dragonfly", target_os = "macos")) {
            PingStyle::Bsd
        } else {
            PingStyle::Linux
        }
    }

    fn wait_arg(self, seconds: u64) -> String {
        match self {
            PingStyle::Linux => seconds.to_string(),
            PingStyle::Bsd => (seconds * 1000).to_string(),
        }
    }

    fn silent_code(self) -> i32 {
        match self {
            PingStyle::Linux => 1,
            PingStyle::Bsd => 2,
        }
    }
}

/// ICMP probe through the OS `ping` binary
#[derive(Debug, Clone)]
pub struct PingProbe {
    /// Ping executable
    command: String,
    /// Echo requests per probe
    count: u32,
    /// Per-request timeout in seconds
    timeout: u64,
    style: PingStyle,
}

impl PingProbe {
    pub fn new(command: &str, count: u32, timeout: u64) -> Self {
        Self {
            command: command.to_string(),
            count,
            timeout,
            style: PingStyle::native(),
        }
    }

    pub fn with_style(mut self, style: PingStyle) -> Self {
        self.style = style;
        self
    }

    /// Create a probe from the global configuration
    pub fn from_config(config: &crate::manifest::GlobalConfig) -> Self {
        Self::new(&config.ping_command, config.probe_count, config.probe_timeout)
            .with_style(config.ping_style)
    }

    /// Hard limit on one probe: every request timing out, plus a second of slack
    fn deadline(&self) -> Duration {
        Duration::from_secs(self.timeout * u64::from(self.count) + 1)
    }
}

impl LivenessProbe for PingProbe {
    fn probe(&self, ip: Ipv4Addr, cancel: &AtomicBool) -> Result<Liveness> {
        let mut child = Command::new(&self.command)
            .args([
                "-c",
                &self.count.to_string(),
                "-W",
                &self.style.wait_arg(self.timeout),
                &ip.to_string(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::ProbeUnavailable(format!("failed to run '{}': {}", self.command, e))
            })?;

        let deadline = self.deadline();
        let start = Instant::now();

        loop {
            if cancel.load(Ordering::SeqCst) {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(Liveness::Cancelled);
            }

            match child.try_wait() {
                // 0 when any reply arrived; the silent code depends on the style
                Ok(Some(status)) => {
                    return match status.code() {
                        Some(0) => Ok(Liveness::Responding),
                        Some(code) if code == self.style.silent_code() => Ok(Liveness::Silent),
                        code => Err(Error::ProbeUnavailable(format!(
                            "'{}' exited with {:?} probing {}",
                            self.command, code, ip
                        ))),
                    };
                }
                Ok(None) => {
                    if start.elapsed() > deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        log::debug!("Probe of {} ran past {:?}; no reply seen", ip, deadline);
                        return Ok(Liveness::Silent);
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::ProbeUnavailable(format!(
                        "failed to wait for '{}': {}",
                        self.command, e
                    )));
                }
            }
        }
    }
}

/// Probes candidates a window at a time on a bounded worker pool
pub struct ProbeScheduler<'a> {
    probe: &'a dyn LivenessProbe,
    /// Candidates probed concurrently
    window: usize,
    /// Worker threads per window
    workers: usize,
    /// Fail instead of assuming silence when the probe errors
    strict: bool,
}

impl<'a> ProbeScheduler<'a> {
    pub fn new(probe: &'a dyn LivenessProbe, window: usize, workers: usize, strict: bool) -> Self {
        Self {
            probe,
            window: window.max(1),
            workers: workers.max(1),
            strict,
        }
    }

    /// Find the first silent candidate that `accept` agrees to take
    ///
    /// Candidates keep their order: a silent address only wins once every
    /// earlier candidate in its window has been ruled out. `accept` is
    /// called in candidate order and may refuse (e.g. the address was
    /// leased by a concurrent caller), in which case the scan moves on.
    pub fn first_silent<F>(
        &self,
        candidates: &[Ipv4Addr],
        mut accept: F,
    ) -> Result<Option<Ipv4Addr>>
    where
        F: FnMut(Ipv4Addr) -> bool,
    {
        for window in candidates.chunks(self.window) {
            if let Some(ip) = self.scan_window(window, &mut accept)? {
                return Ok(Some(ip));
            }
        }
        Ok(None)
    }

    fn scan_window<F>(&self, window: &[Ipv4Addr], accept: &mut F) -> Result<Option<Ipv4Addr>>
    where
        F: FnMut(Ipv4Addr) -> bool,
    {
        let cancel = AtomicBool::new(false);
        let (job_tx, job_rx) = channel::unbounded::<(usize, Ipv4Addr)>();
        for job in window.iter().copied().enumerate() {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let workers = self.workers.min(window.len());
        let probe = self.probe;

        crossbeam::scope(|scope| {
            let (result_tx, result_rx) = channel::unbounded::<(usize, Result<Liveness>)>();
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let cancel = &cancel;
                scope.spawn(move |_| {
                    for (idx, ip) in job_rx.iter() {
                        if cancel.load(Ordering::SeqCst) {
                            break;
                        }
                        let outcome = probe.probe(ip, cancel);
                        if result_tx.send((idx, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            let mut outcomes: Vec<Option<Result<Liveness>>> =
                (0..window.len()).map(|_| None).collect();
            let mut next = 0;

            for (idx, outcome) in result_rx.iter() {
                outcomes[idx] = Some(outcome);

                while next < window.len() {
                    let Some(outcome) = outcomes[next].take() else {
                        break;
                    };
                    let ip = window[next];
                    next += 1;

                    let silent = match self.is_silent(ip, outcome) {
                        Ok(silent) => silent,
                        Err(e) => {
                            cancel.store(true, Ordering::SeqCst);
                            return Err(e);
                        }
                    };
                    if silent && accept(ip) {
                        cancel.store(true, Ordering::SeqCst);
                        return Ok(Some(ip));
                    }
                }
            }

            Ok(None)
        })
        .map_err(|_| Error::ProbeUnavailable("probe worker panicked".to_string()))?
    }

    fn is_silent(&self, ip: Ipv4Addr, outcome: Result<Liveness>) -> Result<bool> {
        match outcome {
            Ok(Liveness::Silent) => Ok(true),
            Ok(Liveness::Responding) => {
                log::debug!("{} answered the probe; skipping", ip);
                Ok(false)
            }
            Ok(Liveness::Cancelled) => Ok(false),
            Err(e) if self.strict => Err(e),
            Err(e) => {
                log::warn!("Probe of {} failed ({}); treating it as silent", ip, e);
                Ok(true)
            }
        }
    }
}

/// Scripted probe for tests
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct FakeProbe {
        live: HashSet<Ipv4Addr>,
        broken: HashSet<Ipv4Addr>,
        delays: HashMap<Ipv4Addr, Duration>,
        probed: Mutex<Vec<Ipv4Addr>>,
        cancelled: Mutex<Vec<Ipv4Addr>>,
    }

    impl FakeProbe {
        pub fn new() -> Self {
            Self::default()
        }

        /// Addresses that answer
        pub fn live(mut self, addrs: &[&str]) -> Self {
            self.live.extend(addrs.iter().map(|a| a.parse::<Ipv4Addr>().unwrap()));
            self
        }

        /// Addresses whose probe errors out
        pub fn broken(mut self, addrs: &[&str]) -> Self {
            self.broken.extend(addrs.iter().map(|a| a.parse::<Ipv4Addr>().unwrap()));
            self
        }

        /// Make probing `addr` take `millis`
        pub fn slow(mut self, addr: &str, millis: u64) -> Self {
            self.delays.insert(addr.parse().unwrap(), Duration::from_millis(millis));
            self
        }

        /// Every address probed so far, in completion order
        pub fn probed(&self) -> Vec<Ipv4Addr> {
            self.probed.lock().unwrap().clone()
        }

        /// Addresses whose probe was cut short by the cancel flag
        pub fn cancelled(&self) -> Vec<Ipv4Addr> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    impl LivenessProbe for FakeProbe {
        fn probe(&self, ip: Ipv4Addr, cancel: &AtomicBool) -> Result<Liveness> {
            if let Some(delay) = self.delays.get(&ip) {
                let start = Instant::now();
                while start.elapsed() < *delay {
                    if cancel.load(Ordering::SeqCst) {
                        self.cancelled.lock().unwrap().push(ip);
                        return Ok(Liveness::Cancelled);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
            self.probed.lock().unwrap().push(ip);
            if self.broken.contains(&ip) {
                return Err(Error::ProbeUnavailable(format!("no route to {}", ip)));
            }
            if self.live.contains(&ip) {
                Ok(Liveness::Responding)
            } else {
                Ok(Liveness::Silent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeProbe;
    use super::*;

    fn ips(addrs: &[&str]) -> Vec<Ipv4Addr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_skips_live_addresses() {
        let probe = FakeProbe::new().live(&["10.0.0.1", "10.0.0.2"]);
        let scheduler = ProbeScheduler::new(&probe, 4, 4, false);
        let found = scheduler
            .first_silent(&ips(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]), |_| true)
            .unwrap();
        assert_eq!(found, Some("10.0.0.3".parse().unwrap()));
    }

    #[test]
    fn test_keeps_candidate_order_under_concurrency() {
        // the first candidate is slow but silent; it must still win
        let probe = FakeProbe::new().slow("10.0.0.1", 100);
        let scheduler = ProbeScheduler::new(&probe, 3, 3, false);
        let found = scheduler
            .first_silent(&ips(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]), |_| true)
            .unwrap();
        assert_eq!(found, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_winner_cancels_slow_siblings() {
        // both are in flight when the first one comes back silent
        let probe = FakeProbe::new().slow("10.0.0.1", 100).slow("10.0.0.2", 5_000);
        let scheduler = ProbeScheduler::new(&probe, 2, 2, false);

        let start = Instant::now();
        let found = scheduler
            .first_silent(&ips(&["10.0.0.1", "10.0.0.2"]), |_| true)
            .unwrap();

        assert_eq!(found, Some("10.0.0.1".parse().unwrap()));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(probe.probed(), ips(&["10.0.0.1"]));
        assert_eq!(probe.cancelled(), ips(&["10.0.0.2"]));
    }

    #[test]
    fn test_refused_candidates_are_passed_over() {
        let probe = FakeProbe::new();
        let scheduler = ProbeScheduler::new(&probe, 2, 2, false);
        let taken: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let found = scheduler
            .first_silent(&ips(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]), |ip| ip != taken)
            .unwrap();
        assert_eq!(found, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_all_live_finds_nothing() {
        let probe = FakeProbe::new().live(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let scheduler = ProbeScheduler::new(&probe, 2, 1, false);
        let found = scheduler
            .first_silent(&ips(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]), |_| true)
            .unwrap();
        assert_eq!(found, None);
        assert_eq!(probe.probed().len(), 3);
    }

    #[test]
    fn test_probe_errors_are_lenient_unless_strict() {
        let probe = FakeProbe::new().broken(&["10.0.0.1"]);
        let candidates = ips(&["10.0.0.1", "10.0.0.2"]);

        let lenient = ProbeScheduler::new(&probe, 1, 1, false);
        assert_eq!(
            lenient.first_silent(&candidates, |_| true).unwrap(),
            Some("10.0.0.1".parse().unwrap())
        );

        let strict = ProbeScheduler::new(&probe, 1, 1, true);
        assert!(matches!(
            strict.first_silent(&candidates, |_| true),
            Err(Error::ProbeUnavailable(_))
        ));
    }

    #[test]
    fn test_ping_probe_exit_codes() {
        let cancel = AtomicBool::new(false);
        let ip: Ipv4Addr = "192.0.2.1".parse().unwrap();

        // coreutils true/false ignore their arguments
        let linux = |cmd: &str| PingProbe::new(cmd, 2, 2).with_style(PingStyle::Linux);
        assert_eq!(linux("true").probe(ip, &cancel).unwrap(), Liveness::Responding);
        assert_eq!(linux("false").probe(ip, &cancel).unwrap(), Liveness::Silent);
    }

    #[cfg(unix)]
    fn exit_script(dir: &std::path::Path, code: i32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join(format!("ping-exit-{}", code));
        let body = format!("#!/bin/sh\necho \"$@\" > {}\nexit {}\n", dir.join("args").display(), code);
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn test_bsd_ping_conventions() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = AtomicBool::new(false);
        let ip: Ipv4Addr = "192.0.2.1".parse().unwrap();
        let script = exit_script(dir.path(), 2);

        let bsd = PingProbe::new(&script, 2, 2).with_style(PingStyle::Bsd);
        assert_eq!(bsd.probe(ip, &cancel).unwrap(), Liveness::Silent);
        // -W is in milliseconds on BSD
        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert_eq!(args.trim(), "-c 2 -W 2000 192.0.2.1");

        // exit 2 is an error for iputils
        let linux = PingProbe::new(&script, 2, 2).with_style(PingStyle::Linux);
        assert!(matches!(linux.probe(ip, &cancel), Err(Error::ProbeUnavailable(_))));
        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert_eq!(args.trim(), "-c 2 -W 2 192.0.2.1");
    }

    #[test]
    fn test_ping_style_from_toml() {
        #[derive(Deserialize)]
        struct Probe {
            style: PingStyle,
        }
        let probe: Probe = toml::from_str(r#"style = "bsd""#).unwrap();
        assert_eq!(probe.style, PingStyle::Bsd);
        assert!(toml::from_str::<Probe>(r#"style = "plan9""#).is_err());
    }

    #[test]
    fn test_ping_probe_missing_binary() {
        let cancel = AtomicBool::new(false);
        let probe = PingProbe::new("/nonexistent/sitenet-ping", 2, 2);
        assert!(matches!(
            probe.probe("192.0.2.1".parse().unwrap(), &cancel),
            Err(Error::ProbeUnavailable(_))
        ));
    }

    #[test]
    fn test_ping_probe_cancelled() {
        let cancel = AtomicBool::new(true);
        let probe = PingProbe::new("sleep", 1, 5);
        // `sleep -c 1 -W 5 <ip>` is never waited on once cancel is set
        assert_eq!(
            probe.probe("192.0.2.1".parse().unwrap(), &cancel).unwrap(),
            Liveness::Cancelled
        );
    }
}

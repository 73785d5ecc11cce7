/// Subnet scanner that locates the mixer when no static address is
/// configured, and a monitor that notices when it moves.
///
/// A scan probes every host in the subnet with a bounded number of probes in
/// flight, then verifies the hosts with an open port one at a time in
/// ascending address order. The first host that passes verification wins.
///
/// The last good result is kept in memory as a fast path: `find_mixer()`
/// re-checks it before paying for a full scan. Nothing is persisted.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::probe::{DeviceProbe, TcpProbe};
use crate::settings::DiscoverySettings;
use crate::subnet::Subnet;
use crate::Endpoint;

/// Outcome of one discovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub endpoint: Endpoint,
    pub verified: bool,
    pub timestamp: SystemTime,
}

impl DiscoveryResult {
    fn verified(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            verified: true,
            timestamp: SystemTime::now(),
        }
    }
}

pub struct DiscoveryScanner {
    settings: DiscoverySettings,
    probe: Arc<dyn DeviceProbe>,
    last_known: Mutex<Option<DiscoveryResult>>,
}

impl DiscoveryScanner {
    pub fn new(settings: DiscoverySettings, probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            settings,
            probe,
            last_known: Mutex::new(None),
        }
    }

    /// Scanner backed by real TCP probes against `port`.
    pub fn with_tcp_probe(settings: DiscoverySettings, port: u16) -> Self {
        let probe = TcpProbe::new(port, settings.probe_timeout, settings.verify_window);
        Self::new(settings, Arc::new(probe))
    }

    /// Most recent verified result, if any.
    pub fn last_known(&self) -> Option<DiscoveryResult> {
        *self.last_known.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed the fast path, e.g. from an address learned elsewhere.
    pub fn remember(&self, endpoint: Endpoint) {
        *self.last_known.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(DiscoveryResult::verified(endpoint));
    }

    fn last_known_address(&self) -> Option<Ipv4Addr> {
        self.last_known().map(|r| r.endpoint.address)
    }

    /// Probe every host in `subnet` and return the first verified mixer.
    pub async fn scan_subnet(&self, subnet: Subnet) -> Option<Endpoint> {
        let started = Instant::now();
        let concurrency = self.settings.concurrency.max(1);

        info!(
            subnet = %subnet,
            hosts = subnet.host_count(),
            concurrency = concurrency,
            "Scanning subnet for mixer"
        );

        let probe = &self.probe;
        let mut open: Vec<Ipv4Addr> = stream::iter(subnet.hosts())
            .map(|address| async move { (address, probe.probe_port(address).await) })
            .buffer_unordered(concurrency)
            .filter_map(|(address, is_open)| async move { is_open.then_some(address) })
            .collect()
            .await;
        open.sort_unstable();

        debug!(
            subnet = %subnet,
            candidates = ?open,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Port probe pass complete"
        );

        for address in open {
            if self.probe.verify_device(address).await {
                let endpoint = Endpoint::new(address, self.probe.port());
                info!(
                    endpoint = %endpoint,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Mixer found"
                );
                return Some(endpoint);
            }
            debug!(address = %address, "Open port but verification failed");
        }

        info!(
            subnet = %subnet,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "No mixer found on subnet"
        );
        None
    }

    /// Locate the mixer: last known address first, full scan second.
    pub async fn find_mixer(&self) -> Option<Endpoint> {
        if let Some(address) = self.last_known_address() {
            if self.probe.probe_port(address).await && self.probe.verify_device(address).await {
                let endpoint = Endpoint::new(address, self.probe.port());
                debug!(endpoint = %endpoint, "Last known mixer address still valid");
                self.remember(endpoint);
                return Some(endpoint);
            }
            info!(address = %address, "Last known mixer address no longer answers");
        }

        let found = self.scan_subnet(self.settings.subnet.resolve()).await;
        if let Some(endpoint) = found {
            self.remember(endpoint);
        }
        found
    }

    /// Watch for the mixer moving until `cancel` fires.
    ///
    /// Every `check_interval` the last known address is re-probed and a
    /// rescan runs at once if it stopped answering. Every `scan_interval` a
    /// rescan runs regardless. A rescan that finds a different address
    /// records it and publishes it on `changes`.
    pub async fn run_monitor(
        self: Arc<Self>,
        changes: mpsc::Sender<Endpoint>,
        cancel: CancellationToken,
    ) {
        let start = tokio::time::Instant::now();
        let (check_every, scan_every) = (self.settings.check_interval, self.settings.scan_interval);
        let mut check = interval_at(start + check_every, check_every);
        let mut scan = interval_at(start + scan_every, scan_every);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            check_secs = self.settings.check_interval.as_secs_f32(),
            scan_secs = self.settings.scan_interval.as_secs_f32(),
            "Discovery monitor started"
        );

        loop {
            let rescan = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = check.tick() => self.last_known_unreachable().await,
                _ = scan.tick() => {
                    debug!("Periodic discovery rescan");
                    true
                }
            };

            if !rescan {
                continue;
            }

            let found = tokio::select! {
                _ = cancel.cancelled() => break,
                found = self.scan_subnet(self.settings.subnet.resolve()) => found,
            };

            let Some(endpoint) = found else {
                continue;
            };

            let previous = self.last_known_address();
            self.remember(endpoint);
            if previous == Some(endpoint.address) {
                continue;
            }

            info!(
                previous = ?previous,
                current = %endpoint,
                "Mixer address changed"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = changes.send(endpoint) => {
                    if sent.is_err() {
                        debug!("Address change receiver gone, stopping monitor");
                        break;
                    }
                }
            }
        }

        info!("Discovery monitor stopped");
    }

    async fn last_known_unreachable(&self) -> bool {
        match self.last_known_address() {
            Some(address) => {
                if self.probe.probe_port(address).await {
                    false
                } else {
                    warn!(
                        address = %address,
                        "Mixer unreachable at last known address, rescanning"
                    );
                    true
                }
            }
            // Nothing known yet: keep looking
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::settings::SubnetSetting;

    /// Probe answering from in-memory host sets.
    #[derive(Default)]
    struct MockProbe {
        open: Mutex<HashSet<Ipv4Addr>>,
        verified: Mutex<HashSet<Ipv4Addr>>,
        port_probes: AtomicUsize,
        verifications: AtomicUsize,
    }

    impl MockProbe {
        fn with_hosts(open: &[Ipv4Addr], verified: &[Ipv4Addr]) -> Arc<Self> {
            let probe = Self::default();
            probe.set_hosts(open, verified);
            Arc::new(probe)
        }

        fn set_hosts(&self, open: &[Ipv4Addr], verified: &[Ipv4Addr]) {
            *self.open.lock().unwrap() = open.iter().copied().collect();
            *self.verified.lock().unwrap() = verified.iter().copied().collect();
        }

        fn port_probes(&self) -> usize {
            self.port_probes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceProbe for MockProbe {
        async fn probe_port(&self, address: Ipv4Addr) -> bool {
            self.port_probes.fetch_add(1, Ordering::SeqCst);
            self.open.lock().unwrap().contains(&address)
        }

        async fn verify_device(&self, address: Ipv4Addr) -> bool {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            self.verified.lock().unwrap().contains(&address)
        }

        fn port(&self) -> u16 {
            51325
        }
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            subnet: SubnetSetting::Fixed("10.0.0.0/24".parse().unwrap()),
            ..DiscoverySettings::default()
        }
    }

    fn subnet() -> Subnet {
        "10.0.0.0/24".parse().unwrap()
    }

    #[tokio::test]
    async fn test_scan_finds_single_mixer() {
        let probe = MockProbe::with_hosts(&[ip(42)], &[ip(42)]);
        let scanner = DiscoveryScanner::new(settings(), probe.clone());

        let found = scanner.scan_subnet(subnet()).await;
        assert_eq!(found, Some(Endpoint::new(ip(42), 51325)));
        assert_eq!(probe.port_probes(), 254);
    }

    #[tokio::test]
    async fn test_scan_returns_none_on_empty_subnet() {
        let probe = MockProbe::with_hosts(&[], &[]);
        let scanner = DiscoveryScanner::new(settings(), probe);

        assert_eq!(scanner.scan_subnet(subnet()).await, None);
    }

    #[tokio::test]
    async fn test_scan_skips_open_hosts_that_fail_verification() {
        // .10 has the port open (some other service), .42 is the mixer
        let probe = MockProbe::with_hosts(&[ip(10), ip(42)], &[ip(42)]);
        let scanner = DiscoveryScanner::new(settings(), probe.clone());

        assert_eq!(
            scanner.scan_subnet(subnet()).await,
            Some(Endpoint::new(ip(42), 51325))
        );
        assert_eq!(probe.verifications.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scan_prefers_lowest_verified_address() {
        let probe = MockProbe::with_hosts(&[ip(200), ip(7), ip(99)], &[ip(200), ip(99)]);
        let scanner = DiscoveryScanner::new(settings(), probe);

        assert_eq!(
            scanner.scan_subnet(subnet()).await,
            Some(Endpoint::new(ip(99), 51325))
        );
    }

    #[tokio::test]
    async fn test_open_but_unverified_only_returns_none() {
        let probe = MockProbe::with_hosts(&[ip(5)], &[]);
        let scanner = DiscoveryScanner::new(settings(), probe);

        assert_eq!(scanner.scan_subnet(subnet()).await, None);
    }

    #[tokio::test]
    async fn test_find_mixer_fast_path_skips_scan() {
        let probe = MockProbe::with_hosts(&[ip(42)], &[ip(42)]);
        let scanner = DiscoveryScanner::new(settings(), probe.clone());
        scanner.remember(Endpoint::new(ip(42), 51325));

        let found = scanner.find_mixer().await;
        assert_eq!(found, Some(Endpoint::new(ip(42), 51325)));
        // One probe for the cached address, no subnet sweep
        assert_eq!(probe.port_probes(), 1);
    }

    #[tokio::test]
    async fn test_find_mixer_falls_back_to_scan_and_remembers() {
        let probe = MockProbe::with_hosts(&[ip(77)], &[ip(77)]);
        let scanner = DiscoveryScanner::new(settings(), probe.clone());
        scanner.remember(Endpoint::new(ip(42), 51325));

        let found = scanner.find_mixer().await;
        assert_eq!(found, Some(Endpoint::new(ip(77), 51325)));
        assert_eq!(probe.port_probes(), 1 + 254);

        let last = scanner.last_known().unwrap();
        assert_eq!(last.endpoint.address, ip(77));
        assert!(last.verified);
    }

    #[tokio::test]
    async fn test_find_mixer_without_cache_scans() {
        let probe = MockProbe::with_hosts(&[ip(3)], &[ip(3)]);
        let scanner = DiscoveryScanner::new(settings(), probe);

        assert!(scanner.last_known().is_none());
        assert_eq!(scanner.find_mixer().await, Some(Endpoint::new(ip(3), 51325)));
        assert_eq!(scanner.last_known().unwrap().endpoint.address, ip(3));
    }

    #[tokio::test]
    async fn test_monitor_publishes_moved_mixer() {
        let probe = MockProbe::with_hosts(&[ip(42)], &[ip(42)]);
        let scanner = Arc::new(DiscoveryScanner::new(
            DiscoverySettings {
                check_interval: Duration::from_millis(50),
                ..settings()
            },
            probe.clone(),
        ));
        scanner.remember(Endpoint::new(ip(42), 51325));

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(Arc::clone(&scanner).run_monitor(tx, cancel.clone()));

        // Mixer moves from .42 to .77
        probe.set_hosts(&[ip(77)], &[ip(77)]);

        let moved = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("monitor should notice the move")
            .expect("channel open");
        assert_eq!(moved, Endpoint::new(ip(77), 51325));
        assert_eq!(scanner.last_known().unwrap().endpoint.address, ip(77));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_monitor_stays_quiet_while_mixer_answers() {
        let probe = MockProbe::with_hosts(&[ip(42)], &[ip(42)]);
        let scanner = Arc::new(DiscoveryScanner::new(
            DiscoverySettings {
                check_interval: Duration::from_millis(20),
                ..settings()
            },
            probe.clone(),
        ));
        scanner.remember(Endpoint::new(ip(42), 51325));

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(Arc::clone(&scanner).run_monitor(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        monitor.await.unwrap();

        assert!(rx.try_recv().is_err());
        // Only the cheap re-probe of .42 ran, never a sweep
        assert!(probe.port_probes() < 254);
    }

    #[tokio::test]
    async fn test_monitor_cancels_during_long_wait() {
        // Default 30s / 300s cadence: cancellation must not wait for a tick
        let probe = MockProbe::with_hosts(&[], &[]);
        let scanner = Arc::new(DiscoveryScanner::new(settings(), probe));

        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(Arc::clone(&scanner).run_monitor(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(500), monitor)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}

//! Scan orchestration. Owns the inventory, drives discovery and the per-host probe
//! fan-out, funnels every result through `Inventory::apply`, and exposes the
//! public operation surface (start/stop, RTSP probing, ONVIF fetch, credentials).

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::arp::{ArpScanner, arp_table_supported};
use super::gate::Gates;
use super::hostname::reverse_lookup;
use super::http::{fetch_title, fingerprint};
use super::mdns::BonjourBrowser;
use super::onvif::{OnvifClient, OnvifDiscovery};
use super::port::{HTTP_PORTS, HTTPS_PORTS, PortScanner};
use super::rtsp::RtspProber;
use super::scope::{ResolvedScope, detect_active_subnet, resolve_scope};
use super::ssdp::SsdpScanner;
use super::{ArpEntry, ScanType, capability_note, check_scan_capabilities};
use crate::config::{EngineConfig, ScanMode, ScopeRequest};
use crate::error::ScanError;
use crate::inventory::{
    DeviceRecord, Evidence, FollowUp, HostRecord, Inventory, MergeOutcome, RtspProbeResult,
    ScanStatus, ScanSummary,
};
use crate::oui::{NoVendorLookup, VendorLookup};

const EVENT_CAPACITY: usize = 1024;
const EVIDENCE_CAPACITY: usize = 256;

/// Why an ONVIF RTSP-URI fetch was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnvifFetchReason {
    /// Triggered by WS-Discovery reporting XAddrs for a device without a URI
    Auto,
    /// Requested by the operator
    Manual,
}

/// Change notifications for live consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ScanEvent {
    HostUpdated(Ipv4Addr),
    DeviceUpdated(Ipv4Addr),
    StatusChanged(ScanStatus),
    SweepFinished(ScanSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Point-in-time copy of everything the engine knows
#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    pub summary: ScanSummary,
    pub status_message: String,
    pub progress: Progress,
    pub hosts: Vec<HostRecord>,
    pub devices: Vec<DeviceRecord>,
    pub capability_notes: Vec<String>,
}

struct EngineState {
    inventory: Inventory,
    summary: ScanSummary,
    status_message: String,
    progress: Progress,
    capability_notes: BTreeSet<String>,
    running: bool,
    /// Addresses of the scope being swept; summary counts are limited to these
    scope_hosts: HashSet<Ipv4Addr>,
    /// Bumped per `start_scan`; a finishing run only touches status if it is still current
    generation: u64,
}

/// Manages one scan session
#[derive(Clone)]
pub struct ScanManager {
    config: Arc<RwLock<EngineConfig>>,
    state: Arc<RwLock<EngineState>>,
    cancel: Arc<RwLock<CancellationToken>>,
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
    vendor_lookup: Arc<dyn VendorLookup>,
    gates: Gates,
    events: broadcast::Sender<ScanEvent>,
}

impl ScanManager {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inventory = Inventory::new(&config.probe.ports, config.mode);
        let summary = ScanSummary {
            safe_mode: config.safe_mode,
            mode: config.mode,
            ..ScanSummary::default()
        };

        Self {
            config: Arc::new(RwLock::new(config)),
            state: Arc::new(RwLock::new(EngineState {
                inventory,
                summary,
                status_message: "Idle".to_string(),
                progress: Progress::default(),
                capability_notes: BTreeSet::new(),
                running: false,
                scope_hosts: HashSet::new(),
                generation: 0,
            })),
            cancel: Arc::new(RwLock::new(CancellationToken::new())),
            task: Arc::new(RwLock::new(None)),
            vendor_lookup: Arc::new(NoVendorLookup),
            gates: Gates::new(),
            events,
        }
    }

    /// Use `lookup` to resolve MAC vendors
    pub fn with_vendor_lookup(mut self, lookup: Arc<dyn VendorLookup>) -> Self {
        self.vendor_lookup = lookup;
        self
    }

    pub async fn config(&self) -> EngineConfig {
        self.config.read().await.clone()
    }

    pub async fn set_safe_mode(&self, enabled: bool) {
        self.config.write().await.safe_mode = enabled;
        info!(safe_mode = enabled, "Safe mode updated");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> ScanSnapshot {
        let state = self.state.read().await;
        ScanSnapshot {
            summary: Self::live_summary(&state),
            status_message: state.status_message.clone(),
            progress: state.progress,
            hosts: state.inventory.hosts().cloned().collect(),
            devices: state.inventory.devices().cloned().collect(),
            capability_notes: state.capability_notes.iter().cloned().collect(),
        }
    }

    pub async fn scan_summary(&self) -> ScanSummary {
        Self::live_summary(&*self.state.read().await)
    }

    pub async fn device(&self, ip: Ipv4Addr) -> Option<DeviceRecord> {
        self.state.read().await.inventory.device(ip).cloned()
    }

    pub async fn host(&self, ip: Ipv4Addr) -> Option<HostRecord> {
        self.state.read().await.inventory.host(ip).cloned()
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    fn live_summary(state: &EngineState) -> ScanSummary {
        let mut summary = state.summary.clone();
        if summary.status == ScanStatus::Running {
            Self::count_scope(state, &mut summary);
        }
        summary
    }

    fn count_scope(state: &EngineState, summary: &mut ScanSummary) {
        summary.alive_hosts = state.inventory.alive_count_in(&state.scope_hosts);
        summary.interesting_devices = state.inventory.device_count_in(&state.scope_hosts);
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn set_status_message(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(status = %message, "Scan status");
        self.state.write().await.status_message = message;
    }

    async fn add_capability_note(&self, scan_type: ScanType) {
        let note = capability_note(scan_type);
        let mut state = self.state.write().await;
        if state.capability_notes.insert(note.clone()) {
            warn!(scanner = %scan_type, note = %note, "Capability degraded");
        }
    }

    /// Single write path into the inventory
    async fn apply(&self, evidence: Evidence) -> MergeOutcome {
        let ip = evidence.ip();
        let outcome = self.state.write().await.inventory.apply(evidence, Utc::now());
        if outcome.host_changed {
            self.emit(ScanEvent::HostUpdated(ip));
        }
        if outcome.device_changed {
            self.emit(ScanEvent::DeviceUpdated(ip));
        }
        outcome
    }

    /// Start a sweep (or a continuous series of sweeps) in the background.
    ///
    /// The scope is resolved up front so scope errors reach the caller and no
    /// network activity happens for an unusable request.
    pub async fn start_scan(
        &self,
        enable_onvif: bool,
        enable_service_discovery: bool,
        enable_arp_warmup: bool,
        scope: ScopeRequest,
        mode: ScanMode,
    ) -> Result<(), ScanError> {
        {
            let state = self.state.read().await;
            if state.running {
                return Err(ScanError::AlreadyRunning);
            }
        }

        let resolved = match Self::resolve(&scope) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail(&e).await;
                return Err(e);
            }
        };

        {
            let mut config = self.config.write().await;
            config.enable_onvif_discovery = enable_onvif;
            config.enable_service_discovery = enable_service_discovery;
            config.enable_arp_warmup = enable_arp_warmup;
            config.scope = scope;
            config.mode = mode;
        }

        let token = CancellationToken::new();
        *self.cancel.write().await = token.clone();

        let generation = {
            let mut state = self.state.write().await;
            if state.running {
                return Err(ScanError::AlreadyRunning);
            }
            state.running = true;
            state.generation += 1;
            state.inventory.set_scan_mode(mode);
            state.generation
        };

        info!(
            scope = %resolved.description,
            candidates = resolved.hosts.len(),
            mode = %mode,
            "Starting scan"
        );

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.run(resolved, generation, token).await;
        });
        *self.task.write().await = Some(handle);
        Ok(())
    }

    fn resolve(scope: &ScopeRequest) -> Result<ResolvedScope, ScanError> {
        resolve_scope(scope, detect_active_subnet())
    }

    async fn fail(&self, error: &ScanError) {
        warn!(error = %error, "Scan aborted");
        {
            let mut state = self.state.write().await;
            state.summary.status = ScanStatus::Failed;
            state.summary.finished_at = Some(Utc::now());
            state.status_message = format!("Failed: {}", error);
        }
        self.emit(ScanEvent::StatusChanged(ScanStatus::Failed));
    }

    /// Stop the current scan. Safe to call in any state.
    pub async fn stop_scan(&self) {
        self.cancel.read().await.cancel();

        let stopped = {
            let mut state = self.state.write().await;
            if state.running {
                state.running = false;
                state.summary.status = ScanStatus::Stopped;
                state.summary.finished_at = Some(Utc::now());
                let mut summary = state.summary.clone();
                Self::count_scope(&state, &mut summary);
                state.summary = summary;
                state.status_message = "Stopped".to_string();
                true
            } else {
                false
            }
        };

        if stopped {
            info!("Scan stopped");
            self.emit(ScanEvent::StatusChanged(ScanStatus::Stopped));
        } else {
            debug!("Stop requested with no scan running");
        }
    }

    /// Wait for the background scan task, if any, to exit
    pub async fn wait(&self) {
        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.state.read().await.generation == generation
    }

    async fn run(&self, first_scope: ResolvedScope, generation: u64, cancel: CancellationToken) {
        let mut scope = Some(first_scope);

        loop {
            let resolved = match scope.take() {
                Some(resolved) => resolved,
                None => {
                    let request = self.config.read().await.scope.clone();
                    match Self::resolve(&request) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            if self.is_current(generation).await {
                                self.fail(&e).await;
                                self.state.write().await.running = false;
                            }
                            return;
                        }
                    }
                }
            };

            self.sweep(&resolved, generation, &cancel).await;

            let (mode, interval) = {
                let config = self.config.read().await;
                (config.mode, config.scan_interval_secs.unwrap_or(0))
            };
            if cancel.is_cancelled() || mode == ScanMode::OneShot {
                break;
            }

            self.set_status_message(format!("Waiting {}s before next sweep", interval)).await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            }
        }

        let mut state = self.state.write().await;
        if state.generation == generation {
            state.running = false;
        }
    }

    async fn sweep(&self, scope: &ResolvedScope, generation: u64, cancel: &CancellationToken) {
        let config = self.config.read().await.clone();

        {
            let mut state = self.state.write().await;
            // stop_scan cancels before taking the lock, so this sees either flag
            if state.generation != generation || !state.running || cancel.is_cancelled() {
                return;
            }
            state.summary = ScanSummary {
                started_at: Some(Utc::now()),
                finished_at: None,
                scope: scope.description.clone(),
                candidate_count: scope.hosts.len(),
                alive_hosts: 0,
                interesting_devices: 0,
                safe_mode: config.safe_mode,
                mode: config.mode,
                status: ScanStatus::Running,
            };
            state.progress = Progress {
                completed: 0,
                total: scope.hosts.len(),
            };
            state.scope_hosts = scope.hosts.iter().copied().collect();
            state.status_message = format!("Scanning {}", scope.description);
        }
        self.emit(ScanEvent::StatusChanged(ScanStatus::Running));

        if config.enable_arp_warmup && !cancel.is_cancelled() {
            self.set_status_message("Warming ARP cache").await;
            ArpScanner::new()
                .with_timeout(config.probe.warmup_timeout_ms)
                .warmup(&scope.hosts, &self.gates.warmup, cancel)
                .await;
        }

        let capabilities = check_scan_capabilities();
        if !capabilities.can_multicast {
            if config.enable_service_discovery {
                self.add_capability_note(ScanType::Ssdp).await;
                self.add_capability_note(ScanType::Bonjour).await;
            }
            if config.enable_onvif_discovery {
                self.add_capability_note(ScanType::Onvif).await;
            }
        }
        let services = config.enable_service_discovery && capabilities.can_multicast;
        let onvif = config.enable_onvif_discovery && capabilities.can_multicast;

        let (tx, rx) = mpsc::channel(EVIDENCE_CAPACITY);
        let merger = self.spawn_merger(rx, cancel.clone());

        self.set_status_message(format!("Sweeping {} hosts", scope.hosts.len())).await;
        tokio::join!(
            self.run_ssdp(services, &tx, cancel),
            self.run_bonjour(services, &tx, cancel),
            self.run_onvif(onvif, &tx, cancel),
            self.sweep_hosts(scope, &config, &tx, cancel),
        );

        if !cancel.is_cancelled() {
            self.enrich(&tx, capabilities.can_arp, cancel).await;
        }

        drop(tx);
        let _ = merger.await;

        self.finish_sweep(generation, cancel).await;
    }

    async fn finish_sweep(&self, generation: u64, cancel: &CancellationToken) {
        let summary = {
            let mut state = self.state.write().await;
            if state.generation != generation {
                return;
            }
            state.summary.finished_at = Some(Utc::now());
            let mut summary = state.summary.clone();
            Self::count_scope(&state, &mut summary);
            state.summary = summary;
            if cancel.is_cancelled() {
                state.summary.status = ScanStatus::Stopped;
                state.status_message = "Stopped".to_string();
            } else {
                state.summary.status = ScanStatus::Completed;
                state.status_message = format!(
                    "Completed: {} alive, {} devices",
                    state.summary.alive_hosts, state.summary.interesting_devices
                );
            }
            state.summary.clone()
        };

        info!(
            scope = %summary.scope,
            alive = summary.alive_hosts,
            devices = summary.interesting_devices,
            status = %summary.status,
            "Sweep finished"
        );
        self.emit(ScanEvent::StatusChanged(summary.status));
        self.emit(ScanEvent::SweepFinished(summary));
    }

    /// Consume evidence in arrival order. ONVIF follow-ups run as their own tasks
    /// and are drained once the evidence stream closes.
    fn spawn_merger(
        &self,
        mut rx: mpsc::Receiver<Evidence>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut fetches = JoinSet::new();
            while let Some(evidence) = rx.recv().await {
                let outcome = manager.apply(evidence).await;
                if let Some(FollowUp::FetchOnvifRtsp(ip)) = outcome.follow_up {
                    let fetcher = manager.clone();
                    let cancel = cancel.clone();
                    fetches.spawn(async move {
                        let fetched = fetcher
                            .fetch_onvif_rtsp_until(ip, OnvifFetchReason::Auto, &cancel)
                            .await;
                        if let Err(e) = fetched {
                            debug!(ip = %ip, error = %e, "Automatic ONVIF fetch skipped");
                        }
                    });
                }
            }
            while fetches.join_next().await.is_some() {}
        })
    }

    async fn run_ssdp(
        &self,
        enabled: bool,
        tx: &mpsc::Sender<Evidence>,
        cancel: &CancellationToken,
    ) {
        if !enabled {
            return;
        }
        let (results_tx, results_rx) = mpsc::channel(EVIDENCE_CAPACITY);
        let forwarder = forward(results_rx, tx.clone(), Evidence::Ssdp);
        let outcome = SsdpScanner::new()
            .discover(&results_tx, &self.gates.http, cancel)
            .await;
        drop(results_tx);
        let _ = forwarder.await;

        if !outcome.multicast_available {
            self.add_capability_note(ScanType::Ssdp).await;
        }
    }

    async fn run_bonjour(
        &self,
        enabled: bool,
        tx: &mpsc::Sender<Evidence>,
        cancel: &CancellationToken,
    ) {
        if !enabled {
            return;
        }
        let (results_tx, results_rx) = mpsc::channel(EVIDENCE_CAPACITY);
        let forwarder = forward(results_rx, tx.clone(), Evidence::Bonjour);
        let outcome = BonjourBrowser::new()
            .discover(results_tx, cancel.clone())
            .await;
        let _ = forwarder.await;

        if !outcome.multicast_available {
            self.add_capability_note(ScanType::Bonjour).await;
        }
    }

    async fn run_onvif(
        &self,
        enabled: bool,
        tx: &mpsc::Sender<Evidence>,
        cancel: &CancellationToken,
    ) {
        if !enabled {
            return;
        }
        let (results_tx, results_rx) = mpsc::channel(EVIDENCE_CAPACITY);
        let forwarder = forward(results_rx, tx.clone(), Evidence::Onvif);
        let outcome = OnvifDiscovery::new().discover(&results_tx, cancel).await;
        drop(results_tx);
        let _ = forwarder.await;

        if !outcome.multicast_available {
            self.add_capability_note(ScanType::Onvif).await;
        }
    }

    /// Per-host fan-out: host gate around the sequential port probes, then a
    /// title fetch when a web port answered
    async fn sweep_hosts(
        &self,
        scope: &ResolvedScope,
        config: &EngineConfig,
        tx: &mpsc::Sender<Evidence>,
        cancel: &CancellationToken,
    ) {
        let scanner = Arc::new(
            PortScanner::new()
                .with_timeout(config.probe.connect_timeout_ms)
                .with_ports(config.probe.ports.clone()),
        );

        let mut tasks = JoinSet::new();
        for &ip in &scope.hosts {
            if cancel.is_cancelled() {
                break;
            }
            let manager = self.clone();
            let scanner = Arc::clone(&scanner);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if cancel.is_cancelled() {
                    return;
                }
                let result = manager
                    .gates
                    .host
                    .run(scanner.probe_host(ip, &manager.gates.port, &cancel))
                    .await;

                let web_ports: Vec<u16> = HTTP_PORTS
                    .iter()
                    .chain(HTTPS_PORTS)
                    .copied()
                    .filter(|p| result.open_ports.contains(p))
                    .collect();
                let _ = tx
                    .send(Evidence::OpenPorts {
                        ip,
                        ports: result.open_ports,
                    })
                    .await;

                if !web_ports.is_empty() && !cancel.is_cancelled() {
                    let title = manager.gates.http.run(fetch_title(ip, &web_ports)).await;
                    if let Some(title) = title {
                        let _ = tx.send(Evidence::HttpTitle { ip, title }).await;
                    }
                }

                manager.state.write().await.progress.completed += 1;
            });
        }

        while tasks.join_next().await.is_some() {}
    }

    /// Post-sweep passes over what the sweep found
    async fn enrich(&self, tx: &mpsc::Sender<Evidence>, can_arp: bool, cancel: &CancellationToken) {
        let (scope, alive) = {
            let state = self.state.read().await;
            let alive: Vec<(Ipv4Addr, bool, Vec<u16>)> = state
                .inventory
                .hosts()
                .filter(|h| h.alive && state.scope_hosts.contains(&h.ip))
                .map(|h| (h.ip, h.hostname.is_some(), h.open_ports.iter().copied().collect()))
                .collect();
            (state.scope_hosts.clone(), alive)
        };

        self.set_status_message("Resolving hostnames").await;
        let lookups = alive
            .iter()
            .filter(|(_, named, _)| !named)
            .map(|&(ip, _, _)| async move {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(hostname) = reverse_lookup(ip, &self.gates.dns).await {
                    let _ = tx.send(Evidence::Hostname { ip, hostname }).await;
                }
            });
        futures::future::join_all(lookups).await;

        if cancel.is_cancelled() {
            return;
        }
        self.set_status_message("Reading ARP table").await;
        let entries = self.read_arp(can_arp).await;
        for entry in entries.into_iter().filter(|e| scope.contains(&e.ip)) {
            let _ = tx.send(Evidence::Arp(entry)).await;
        }

        if cancel.is_cancelled() {
            return;
        }
        self.set_status_message("Fingerprinting web interfaces").await;
        let fingerprints = alive.iter().flat_map(|(ip, _, ports)| {
            ports
                .iter()
                .copied()
                .filter(|p| HTTP_PORTS.contains(p) || HTTPS_PORTS.contains(p))
                .map(move |port| (*ip, port))
        });
        let fetches = fingerprints.map(|(ip, port)| async move {
            if cancel.is_cancelled() {
                return;
            }
            if let Some(fingerprint) = self.gates.http.run(fingerprint(ip, port)).await {
                let _ = tx.send(Evidence::Http { ip, fingerprint }).await;
            }
        });
        futures::future::join_all(fetches).await;
    }

    /// ARP table entries, or nothing (with a capability note) when unreadable
    async fn read_arp(&self, can_arp: bool) -> Vec<ArpEntry> {
        if !can_arp {
            self.add_capability_note(ScanType::Arp).await;
            return Vec::new();
        }
        match ArpScanner::new().read_table(self.vendor_lookup.as_ref()).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "ARP table read failed");
                self.add_capability_note(ScanType::Arp).await;
                Vec::new()
            }
        }
    }

    /// Re-read the OS ARP table and merge it
    pub async fn refresh_arp(&self) -> Result<(), ScanError> {
        let entries = self.read_arp(arp_table_supported()).await;
        let count = entries.len();
        for entry in entries {
            self.apply(Evidence::Arp(entry)).await;
        }
        debug!(entries = count, "ARP refresh applied");
        Ok(())
    }

    /// Probe the candidate RTSP paths of a known device
    pub async fn probe_rtsp(&self, ip: Ipv4Addr) -> Result<(), ScanError> {
        let (safe_mode, port) = {
            let config = self.config.read().await;
            (config.safe_mode, config.probe.rtsp_port)
        };
        if safe_mode {
            warn!(ip = %ip, "Safe mode is on; RTSP probe skipped");
            return Ok(());
        }

        let credentials = {
            let mut state = self.state.write().await;
            let device = state
                .inventory
                .device(ip)
                .ok_or(ScanError::UnknownDevice(ip))?;
            if device.rtsp_in_progress {
                debug!(ip = %ip, "RTSP probe already running");
                return Ok(());
            }
            let credentials = device.credentials.clone();
            state.inventory.mark_rtsp_in_progress(ip, true);
            credentials
        };
        self.emit(ScanEvent::DeviceUpdated(ip));

        info!(ip = %ip, port, "Probing RTSP");
        // Operator-triggered; not tied to the sweep's cancellation
        let results = RtspProber::new()
            .with_port(port)
            .probe_all(ip, credentials.as_ref(), &self.gates.rtsp, &CancellationToken::new())
            .await;

        self.apply(Evidence::RtspResults {
            ip,
            results,
            manual: false,
        })
        .await;
        Ok(())
    }

    /// Ask a device's ONVIF media service for its RTSP stream URI
    pub async fn fetch_onvif_rtsp(
        &self,
        ip: Ipv4Addr,
        reason: OnvifFetchReason,
    ) -> Result<(), ScanError> {
        self.fetch_onvif_rtsp_until(ip, reason, &CancellationToken::new())
            .await
    }

    /// ONVIF fetch that is abandoned, leaving the device untouched, once `cancel` fires
    async fn fetch_onvif_rtsp_until(
        &self,
        ip: Ipv4Addr,
        reason: OnvifFetchReason,
        cancel: &CancellationToken,
    ) -> Result<(), ScanError> {
        if self.config.read().await.safe_mode {
            warn!(ip = %ip, reason = ?reason, "Safe mode is on; ONVIF RTSP fetch skipped");
            return Ok(());
        }

        let (xaddrs, credentials, has_uri) = {
            let state = self.state.read().await;
            let device = state
                .inventory
                .device(ip)
                .ok_or(ScanError::UnknownDevice(ip))?;
            (
                device.onvif_xaddrs.iter().cloned().collect::<Vec<_>>(),
                device.credentials.clone(),
                device.onvif_rtsp_uri.is_some(),
            )
        };
        if reason == OnvifFetchReason::Auto && has_uri {
            return Ok(());
        }

        debug!(ip = %ip, reason = ?reason, xaddrs = xaddrs.len(), "Fetching ONVIF stream URI");
        let fetch = async {
            match OnvifClient::new() {
                Ok(client) => {
                    let creds = credentials.as_ref();
                    let uri = client.fetch_stream_uri(&xaddrs, creds, &self.gates.soap);
                    self.gates.onvif_rtsp.run(uri).await
                }
                Err(e) => Err(e),
            }
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(ip = %ip, reason = ?reason, "ONVIF stream URI fetch abandoned");
                return Ok(());
            }
            result = fetch => result,
        };

        match &result {
            Ok(uri) => info!(ip = %ip, uri = %uri, "ONVIF stream URI resolved"),
            Err(e) => debug!(ip = %ip, error = %e, "ONVIF stream URI fetch failed"),
        }
        self.apply(Evidence::OnvifStreamUri { ip, result }).await;
        Ok(())
    }

    /// Set or clear (both empty) the credentials used for a device
    pub async fn update_credentials(
        &self,
        ip: Ipv4Addr,
        username: &str,
        password: &str,
    ) -> Result<(), ScanError> {
        let updated = self
            .state
            .write()
            .await
            .inventory
            .set_credentials(ip, username, password);
        if !updated {
            return Err(ScanError::UnknownDevice(ip));
        }
        let cleared = username.is_empty() && password.is_empty();
        debug!(ip = %ip, cleared, "Credentials updated");
        self.emit(ScanEvent::DeviceUpdated(ip));
        Ok(())
    }

    /// Merge RTSP results produced outside the engine
    pub async fn apply_manual_rtsp_results(
        &self,
        ip: Ipv4Addr,
        results: Vec<RtspProbeResult>,
    ) -> Result<(), ScanError> {
        self.apply(Evidence::RtspResults {
            ip,
            results,
            manual: true,
        })
        .await;
        Ok(())
    }
}

/// Re-tag a protocol client's result stream as evidence
fn forward<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<Evidence>,
    wrap: fn(T) -> Evidence,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if tx.send(wrap(item)).await.is_err() {
                break;
            }
        }
    })
}

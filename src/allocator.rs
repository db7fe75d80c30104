//! Address allocation for provisioned hosts
//!
//! Provides:
//! - Baremetal allocation inside the in-use span of a vlan
//! - Virtual allocation from reservation rows, with pool expansion
//! - Leases so concurrent callers never win the same address
//! - Commit/release of an allocation decision
//!
//! Every address handed out (except the baremetal fallback) has been probed
//! and produced no replies. Only host addresses of the matched rule's cidr
//! are ever considered, and records of other sites sharing the vlan are
//! left out of the pool.

use crate::error::{Error, Result};
use crate::manifest::{GlobalConfig, SitenetConfig};
use crate::network::mac::ip_to_mac;
use crate::network::range::{AddressRange, next_ip};
use crate::probe::{LivenessProbe, ProbeScheduler};
use crate::remap::{Criteria, NetworkRule, Resolver};
use crate::store::{Binding, NetworkRecord, Query, RecordStore};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::iter;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

/// Allocator tuning taken from the global configuration
#[derive(Debug, Clone)]
pub struct AllocatorSettings {
    /// Candidates probed concurrently
    pub probe_window: usize,
    /// Worker threads per probe window
    pub probe_workers: usize,
    /// Treat probe failures as fatal
    pub strict_probe: bool,
    /// Reservations created per pool expansion
    pub pool_expansion: usize,
    /// Prefix for derived virtual MACs
    pub mac_prefix: String,
}

impl AllocatorSettings {
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            probe_window: config.probe_window,
            probe_workers: config.probe_workers,
            strict_probe: config.strict_probe,
            pool_expansion: config.pool_expansion,
            mac_prefix: config.mac_prefix.clone(),
        }
    }
}

/// Kind of host an address is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    Baremetal,
    Virtual,
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationKind::Baremetal => write!(f, "baremetal"),
            AllocationKind::Virtual => write!(f, "virtual"),
        }
    }
}

/// What the caller wants an address for
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    /// Target vlan; resolved from the rules when absent
    pub vlan: Option<u16>,
    pub realm: Option<String>,
    pub site_id: Option<String>,
    pub interface: Option<String>,
    /// Allow creating new reservations when the pool is exhausted
    pub autogen: bool,
}

impl AllocationRequest {
    fn criteria(&self) -> Criteria {
        let mut criteria = Criteria::new();
        if let Some(vlan) = self.vlan {
            criteria = criteria.vlan(vlan);
        }
        if let Some(site) = &self.site_id {
            criteria = criteria.site_id(site);
        }
        if let Some(interface) = &self.interface {
            criteria = criteria.interface(interface);
        }
        if let Some(realm) = &self.realm {
            criteria = criteria.realm(realm);
        }
        criteria
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(vlan) = self.vlan {
            parts.push(format!("vlan={}", vlan));
        }
        if let Some(site) = &self.site_id {
            parts.push(format!("site_id={}", site));
        }
        if let Some(interface) = &self.interface {
            parts.push(format!("interface={}", interface));
        }
        if let Some(realm) = &self.realm {
            parts.push(format!("realm={}", realm));
        }
        if parts.is_empty() {
            "an empty request".to_string()
        } else {
            parts.join(" ")
        }
    }
}

#[cfg(test)]
impl AllocationRequest {
    pub fn vlan(vlan: u16) -> Self {
        Self {
            vlan: Some(vlan),
            ..Default::default()
        }
    }

    pub fn with_site(mut self, site: &str) -> Self {
        self.site_id = Some(site.to_string());
        self
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = Some(realm.to_string());
        self
    }

    pub fn with_autogen(mut self, autogen: bool) -> Self {
        self.autogen = autogen;
        self
    }
}

/// An address chosen for a host, held under lease until committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub kind: AllocationKind,
    pub vlan: u16,
    pub ip: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub interface: Option<String>,
    /// Derived MAC for virtual NICs
    pub mac: Option<String>,
    pub site_id: Option<String>,
    pub realm: Option<String>,
    /// False when the address came from the unprobed baremetal fallback
    pub probed: bool,
}

/// Chooses free addresses from persisted records and liveness probes
pub struct Allocator {
    config: SitenetConfig,
    resolver: Resolver,
    settings: AllocatorSettings,
    store: Arc<dyn RecordStore>,
    probe: Arc<dyn LivenessProbe>,
    /// Addresses handed out but not yet committed or released
    ///
    /// A lease lives as long as the allocator. Callers that drop an
    /// allocation without committing it must `release` it, or the address
    /// stays out of reach until the allocator goes away.
    leases: Mutex<HashSet<(u16, Ipv4Addr)>>,
}

impl Allocator {
    pub fn new(
        config: &SitenetConfig,
        store: Arc<dyn RecordStore>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            config: config.clone(),
            resolver: config.resolver(),
            settings: AllocatorSettings::from_config(&config.config),
            store,
            probe,
            leases: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate an address of the given kind
    pub fn allocate(
        &self,
        kind: AllocationKind,
        request: &AllocationRequest,
    ) -> Result<Allocation> {
        match kind {
            AllocationKind::Baremetal => self.next_baremetal_ip(request),
            AllocationKind::Virtual => self.next_virtual_ip(request),
        }
    }

    /// Next address for a physical host
    ///
    /// Candidates span from the lowest in-use address of the rule's pool
    /// (never below the rule's `first_static_ip`) to the highest one. Known
    /// in-use and answering addresses are skipped. When the span holds
    /// nothing free, the next host address after the span is used without
    /// probing.
    pub fn next_baremetal_ip(&self, request: &AllocationRequest) -> Result<Allocation> {
        let (vlan, rule) = self.placement(request)?;
        let first_static = rule.first_static_ip.ok_or_else(|| {
            Error::Configuration(format!("network rule for vlan {} has no first_static_ip", vlan))
        })?;
        let site = site_of(rule, request);

        let in_use = self.store.query(&Query::new().vlan(vlan).in_use())?;
        let known: HashSet<Ipv4Addr> = in_use.iter().filter_map(|r| r.ip).collect();
        let pool: Vec<Ipv4Addr> = in_use
            .iter()
            .filter(|r| in_pool(rule, site.as_deref(), r))
            .filter_map(|r| r.ip)
            .collect();
        let first = pool.first().map_or(first_static, |lowest| (*lowest).max(first_static));
        let last = pool.last().map_or(first_static, |highest| (*highest).max(first_static));

        let candidates: Vec<Ipv4Addr> = AddressRange::bounded(first, last)
            .addresses()?
            .into_iter()
            .filter(|ip| is_host(rule, *ip) && !known.contains(ip) && !self.is_leased(vlan, *ip))
            .collect();

        log::debug!(
            "Baremetal vlan {}: {} candidates between {} and {}",
            vlan,
            candidates.len(),
            first,
            last
        );

        if let Some(ip) = self.scheduler().first_silent(&candidates, |ip| self.try_lease(vlan, ip))? {
            log::info!("Allocated baremetal address {} on vlan {}", ip, vlan);
            return Ok(self.allocation(AllocationKind::Baremetal, vlan, rule, request, ip, true));
        }

        let ip = self.fallback_after(vlan, rule, last, &known)?;
        log::warn!(
            "No silent address between {} and {} on vlan {}; using {} without probing",
            first,
            last,
            vlan,
            ip
        );
        Ok(self.allocation(AllocationKind::Baremetal, vlan, rule, request, ip, false))
    }

    /// Next address for a virtual host
    ///
    /// Reservations in the rule's pool are probed in address order. With
    /// `autogen`, an exhausted pool is extended once and scanned again.
    pub fn next_virtual_ip(&self, request: &AllocationRequest) -> Result<Allocation> {
        let (vlan, rule) = self.placement(request)?;
        let site = site_of(rule, request);

        if let Some(ip) = self.scan_reservations(vlan, rule, site.as_deref())? {
            log::info!("Allocated virtual address {} on vlan {}", ip, vlan);
            return Ok(self.allocation(AllocationKind::Virtual, vlan, rule, request, ip, true));
        }

        if !request.autogen {
            return Err(Error::AllocationExhausted { vlan });
        }

        self.expand_pool(vlan, rule, request)?;

        match self.scan_reservations(vlan, rule, site.as_deref())? {
            Some(ip) => {
                log::info!("Allocated virtual address {} on vlan {} after pool expansion", ip, vlan);
                Ok(self.allocation(AllocationKind::Virtual, vlan, rule, request, ip, true))
            }
            None => Err(Error::AllocationExhausted { vlan }),
        }
    }

    /// Persist an allocation for a server and drop its lease
    ///
    /// Baremetal allocations insert a new row; virtual ones claim their
    /// reservation. Either fails with `AddressTaken` if the slot was lost.
    pub fn commit(&self, allocation: &Allocation, binding: Binding) -> Result<NetworkRecord> {
        let result = match allocation.kind {
            AllocationKind::Baremetal => {
                let record = NetworkRecord {
                    ip: Some(allocation.ip),
                    vlan: Some(allocation.vlan),
                    netmask: allocation.netmask,
                    interface: allocation.interface.clone(),
                    mac: binding.mac.clone(),
                    server_id: Some(binding.server_id),
                    hw_tag: binding.hw_tag.clone(),
                    site_id: allocation.site_id.clone(),
                    realm: allocation.realm.clone(),
                    ..Default::default()
                };
                self.store.insert(record.clone()).map(|_| record)
            }
            AllocationKind::Virtual => {
                let binding = Binding {
                    mac: binding.mac.or_else(|| allocation.mac.clone()),
                    ..binding
                };
                self.store.attach(allocation.vlan, allocation.ip, &binding)
            }
        };

        self.release(allocation);
        if let Ok(record) = &result {
            log::info!(
                "Committed {} on vlan {} to server {:?}",
                allocation.ip,
                allocation.vlan,
                record.server_id
            );
        }
        result
    }

    /// Give up an allocation without persisting it
    ///
    /// Must be called for every allocation that is not committed.
    pub fn release(&self, allocation: &Allocation) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(allocation.vlan, allocation.ip));
    }

    /// Resolve the rule and vlan a request lands on
    fn placement(&self, request: &AllocationRequest) -> Result<(u16, &NetworkRule)> {
        let what = request.describe();
        let rule = self.resolver.require(&request.criteria(), &what)?;
        let vlan = request
            .vlan
            .or(rule.vlan)
            .ok_or_else(|| Error::Configuration(format!("no vlan configured for {}", what)))?;
        Ok((vlan, rule))
    }

    fn scheduler(&self) -> ProbeScheduler<'_> {
        ProbeScheduler::new(
            self.probe.as_ref(),
            self.settings.probe_window,
            self.settings.probe_workers,
            self.settings.strict_probe,
        )
    }

    /// Take the lease on an address; false if someone else holds it
    fn try_lease(&self, vlan: u16, ip: Ipv4Addr) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((vlan, ip))
    }

    fn is_leased(&self, vlan: u16, ip: Ipv4Addr) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(vlan, ip))
    }

    /// First unleased, unknown host address after `last`, within the rule's cidr
    fn fallback_after(
        &self,
        vlan: u16,
        rule: &NetworkRule,
        last: Ipv4Addr,
        known: &HashSet<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let mut ip = last;
        loop {
            ip = next_ip(ip).map_err(|_| Error::AllocationExhausted { vlan })?;
            if rule.cidr.is_some_and(|cidr| !cidr.contains(ip)) {
                return Err(Error::AllocationExhausted { vlan });
            }
            if is_host(rule, ip) && !known.contains(&ip) && self.try_lease(vlan, ip) {
                return Ok(ip);
            }
        }
    }

    fn scan_reservations(
        &self,
        vlan: u16,
        rule: &NetworkRule,
        site: Option<&str>,
    ) -> Result<Option<Ipv4Addr>> {
        let reservations = self.store.query(&Query::new().vlan(vlan).unassigned())?;
        let candidates: Vec<Ipv4Addr> = reservations
            .iter()
            .filter(|r| in_pool(rule, site, r))
            .filter_map(|r| r.ip)
            .filter(|ip| is_host(rule, *ip) && !self.is_leased(vlan, *ip))
            .collect();
        log::debug!("Virtual vlan {}: {} reservations to probe", vlan, candidates.len());
        self.scheduler().first_silent(&candidates, |ip| self.try_lease(vlan, ip))
    }

    /// Create reservation rows after the last address used in the pool
    ///
    /// At most `pool_expansion` addresses are considered. The run stops at
    /// the end of the rule's cidr and skips its network and broadcast
    /// addresses, so fewer rows (or none) may be created.
    fn expand_pool(
        &self,
        vlan: u16,
        rule: &NetworkRule,
        request: &AllocationRequest,
    ) -> Result<Vec<Ipv4Addr>> {
        let site_id = site_of(rule, request);
        let records = self.store.query(&Query::new().vlan(vlan))?;
        let last_used = records
            .iter()
            .filter(|r| in_pool(rule, site_id.as_deref(), r))
            .filter_map(|r| r.ip)
            .max();
        let start = match last_used {
            Some(last_used) => next_ip(last_used).map_err(|_| Error::AllocationExhausted { vlan })?,
            None => self.first_virtual_ip(site_id.as_deref(), request)?,
        };

        let netmask = rule.cidr.map(|c| c.netmask());
        let interface = request.interface.clone().or_else(|| rule.interface.clone());
        let realm = request.realm.clone().or_else(|| rule.effective_realm());

        let mut created = Vec::new();
        let run = iter::successors(Some(start), |ip| next_ip(*ip).ok())
            .take(self.settings.pool_expansion)
            .take_while(|ip| rule.cidr.is_none_or(|cidr| cidr.contains(*ip)))
            .filter(|ip| is_host(rule, *ip));
        for ip in run {
            let record = NetworkRecord {
                ip: Some(ip),
                vlan: Some(vlan),
                netmask,
                interface: interface.clone(),
                site_id: site_id.clone(),
                realm: realm.clone(),
                ..Default::default()
            };
            match self.store.insert(record) {
                Ok(()) => created.push(ip),
                Err(Error::AddressTaken { .. }) => {
                    log::debug!("Reservation {} on vlan {} already exists", ip, vlan);
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Expanded vlan {} with {} reservations starting at {}",
            vlan,
            created.len(),
            start
        );
        Ok(created)
    }

    fn first_virtual_ip(&self, site: Option<&str>, request: &AllocationRequest) -> Result<Ipv4Addr> {
        let site = site
            .ok_or_else(|| Error::Configuration(format!("no site known for {}", request.describe())))?;
        self.config
            .get_site(site)
            .and_then(|s| s.first_virtual_ip)
            .ok_or_else(|| Error::Configuration(format!("site '{}' has no first_virtual_ip", site)))
    }

    fn allocation(
        &self,
        kind: AllocationKind,
        vlan: u16,
        rule: &NetworkRule,
        request: &AllocationRequest,
        ip: Ipv4Addr,
        probed: bool,
    ) -> Allocation {
        let mac = match kind {
            AllocationKind::Virtual => Some(ip_to_mac(ip, &self.settings.mac_prefix)),
            AllocationKind::Baremetal => None,
        };
        Allocation {
            kind,
            vlan,
            ip,
            netmask: rule.cidr.map(|c| c.netmask()),
            gateway: rule.gw,
            interface: request.interface.clone().or_else(|| rule.interface.clone()),
            mac,
            site_id: site_of(rule, request),
            realm: request.realm.clone().or_else(|| rule.effective_realm()),
            probed,
        }
    }
}

fn site_of(rule: &NetworkRule, request: &AllocationRequest) -> Option<String> {
    request
        .site_id
        .clone()
        .or_else(|| rule.site_id.clone())
        .or_else(|| rule.domain_site())
}

/// Whether a record belongs to the pool `rule` describes for `site`
///
/// Records outside the rule's cidr, or tagged with another site, share the
/// vlan but not the pool.
fn in_pool(rule: &NetworkRule, site: Option<&str>, record: &NetworkRecord) -> bool {
    let Some(ip) = record.ip else {
        return false;
    };
    let same_site = match (site, record.site_id.as_deref()) {
        (Some(site), Some(owner)) => site == owner,
        _ => true,
    };
    same_site && rule.cidr.is_none_or(|cidr| cidr.contains(ip))
}

/// Usable as a host address under the rule's cidr
fn is_host(rule: &NetworkRule, ip: Ipv4Addr) -> bool {
    rule.cidr.is_none_or(|cidr| cidr.is_host(ip))
}

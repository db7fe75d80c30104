//! Persisted network records
//!
//! Provides:
//! - The `NetworkRecord` row and its reservation/in-use states
//! - Typed query filters instead of string-built predicates
//! - `RecordStore`, the narrow datastore interface the allocator consumes
//! - In-memory and JSON-file implementations

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// One network interface row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRecord {
    pub ip: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub vlan: Option<u16>,
    pub netmask: Option<Ipv4Addr>,
    pub mac: Option<String>,
    /// Owning server; `None` means unassigned
    pub server_id: Option<u64>,
    /// Hardware asset tag of the physical host
    pub hw_tag: Option<String>,
    pub site_id: Option<String>,
    pub realm: Option<String>,
    pub bond_options: Option<String>,
    pub static_route: Option<String>,
    pub public_ip: Option<Ipv4Addr>,
    pub switch: Option<String>,
    pub switch_port: Option<String>,
}

impl NetworkRecord {
    /// Unowned row pre-allocated for a future host
    pub fn is_reservation(&self) -> bool {
        self.server_id.is_none() && self.hw_tag.is_none()
    }

    /// Row with an address bound to hardware
    pub fn is_in_use(&self) -> bool {
        self.ip.is_some() && self.hw_tag.is_some()
    }

    fn same_slot(&self, vlan: u16, ip: Ipv4Addr) -> bool {
        self.vlan == Some(vlan) && self.ip == Some(ip)
    }

    /// Release the row from its server
    ///
    /// Protected interfaces (out-of-band management) keep their addressing.
    fn detach(&mut self, protected: bool) {
        self.server_id = None;
        if !protected {
            self.vlan = None;
            self.ip = None;
            self.netmask = None;
            self.bond_options = None;
            self.public_ip = None;
            self.static_route = None;
        }
    }
}

/// Server binding applied when a row is claimed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binding {
    pub server_id: u64,
    pub hw_tag: Option<String>,
    pub mac: Option<String>,
}

/// Supported query clauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Vlan(u16),
    SiteId(String),
    ServerId(u64),
    /// `server_id IS NULL AND hw_tag IS NULL`
    Unassigned,
    /// `ip IS NOT NULL AND hw_tag IS NOT NULL`
    InUse,
}

impl Filter {
    fn accepts(&self, record: &NetworkRecord) -> bool {
        match self {
            Filter::Vlan(vlan) => record.vlan == Some(*vlan),
            Filter::SiteId(site) => record.site_id.as_deref() == Some(site.as_str()),
            Filter::ServerId(id) => record.server_id == Some(*id),
            Filter::Unassigned => record.is_reservation(),
            Filter::InUse => record.is_in_use(),
        }
    }
}

/// Conjunction of filters; results are always ordered by ip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    filters: Vec<Filter>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn vlan(self, vlan: u16) -> Self {
        self.filter(Filter::Vlan(vlan))
    }

    pub fn site_id(self, site: &str) -> Self {
        self.filter(Filter::SiteId(site.to_string()))
    }

    pub fn server_id(self, id: u64) -> Self {
        self.filter(Filter::ServerId(id))
    }

    pub fn unassigned(self) -> Self {
        self.filter(Filter::Unassigned)
    }

    pub fn in_use(self) -> Self {
        self.filter(Filter::InUse)
    }

    fn accepts(&self, record: &NetworkRecord) -> bool {
        self.filters.iter().all(|f| f.accepts(record))
    }
}

/// Datastore operations needed by the allocator
pub trait RecordStore: Send + Sync {
    /// Rows matching every filter, ordered by ip (rows without ip last)
    fn query(&self, query: &Query) -> Result<Vec<NetworkRecord>>;

    /// Insert a row; fails with `AddressTaken` if `(vlan, ip)` already exists
    fn insert(&self, record: NetworkRecord) -> Result<()>;

    /// Bind the reservation at `(vlan, ip)` to a server
    fn attach(&self, vlan: u16, ip: Ipv4Addr, binding: &Binding) -> Result<NetworkRecord>;

    /// Detach every row of a server, returning how many rows changed
    fn detach(&self, server_id: u64, protected_interfaces: &[String]) -> Result<usize>;
}

fn query_records(records: &[NetworkRecord], query: &Query) -> Vec<NetworkRecord> {
    let mut found: Vec<NetworkRecord> =
        records.iter().filter(|r| query.accepts(r)).cloned().collect();
    found.sort_by_key(|r| (r.ip.is_none(), r.ip.map(u32::from)));
    found
}

fn insert_record(records: &mut Vec<NetworkRecord>, record: NetworkRecord) -> Result<()> {
    if let (Some(vlan), Some(ip)) = (record.vlan, record.ip) {
        if records.iter().any(|r| r.same_slot(vlan, ip)) {
            return Err(Error::AddressTaken { vlan, ip });
        }
    }
    records.push(record);
    Ok(())
}

fn attach_record(
    records: &mut [NetworkRecord],
    vlan: u16,
    ip: Ipv4Addr,
    binding: &Binding,
) -> Result<NetworkRecord> {
    let record = records
        .iter_mut()
        .find(|r| r.same_slot(vlan, ip))
        .ok_or_else(|| Error::RecordNotFound(format!("{} on vlan {}", ip, vlan)))?;

    if !record.is_reservation() {
        return Err(Error::AddressTaken { vlan, ip });
    }

    record.server_id = Some(binding.server_id);
    record.hw_tag = binding.hw_tag.clone();
    if binding.mac.is_some() {
        record.mac = binding.mac.clone();
    }
    Ok(record.clone())
}

fn detach_records(
    records: &mut [NetworkRecord],
    server_id: u64,
    protected_interfaces: &[String],
) -> usize {
    let mut changed = 0;
    for record in records.iter_mut().filter(|r| r.server_id == Some(server_id)) {
        let protected = record
            .interface
            .as_ref()
            .is_some_and(|name| protected_interfaces.contains(name));
        record.detach(protected);
        changed += 1;
    }
    changed
}

fn lock(records: &Mutex<Vec<NetworkRecord>>) -> Result<MutexGuard<'_, Vec<NetworkRecord>>> {
    records
        .lock()
        .map_err(|_| Error::Io(io::Error::other("record store lock poisoned")))
}

/// Records held in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<NetworkRecord>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with rows
    pub fn with_records(records: Vec<NetworkRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[cfg(test)]
impl RecordStore for MemoryStore {
    fn query(&self, query: &Query) -> Result<Vec<NetworkRecord>> {
        Ok(query_records(&lock(&self.records)?, query))
    }

    fn insert(&self, record: NetworkRecord) -> Result<()> {
        insert_record(&mut *lock(&self.records)?, record)
    }

    fn attach(&self, vlan: u16, ip: Ipv4Addr, binding: &Binding) -> Result<NetworkRecord> {
        attach_record(&mut lock(&self.records)?, vlan, ip, binding)
    }

    fn detach(&self, server_id: u64, protected_interfaces: &[String]) -> Result<usize> {
        Ok(detach_records(&mut lock(&self.records)?, server_id, protected_interfaces))
    }
}

/// Records persisted as a JSON array, rewritten after every change
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    records: Mutex<Vec<NetworkRecord>>,
}

impl JsonStore {
    /// Open a store file; a missing file is an empty store
    pub fn open(path: &Path) -> Result<Self> {
        let records = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| Error::StoreRead {
                path: path.to_path_buf(),
                source: e,
            })?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Vec::new()
        };

        log::debug!("Loaded {} network records from {}", records.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write through a temporary file so readers never see a partial store
    fn save(&self, records: &[NetworkRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(records)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RecordStore for JsonStore {
    fn query(&self, query: &Query) -> Result<Vec<NetworkRecord>> {
        Ok(query_records(&lock(&self.records)?, query))
    }

    fn insert(&self, record: NetworkRecord) -> Result<()> {
        let mut records = lock(&self.records)?;
        let mut updated = records.clone();
        insert_record(&mut updated, record)?;
        self.save(&updated)?;
        *records = updated;
        Ok(())
    }

    fn attach(&self, vlan: u16, ip: Ipv4Addr, binding: &Binding) -> Result<NetworkRecord> {
        let mut records = lock(&self.records)?;
        let mut updated = records.clone();
        let record = attach_record(&mut updated, vlan, ip, binding)?;
        self.save(&updated)?;
        *records = updated;
        Ok(record)
    }

    fn detach(&self, server_id: u64, protected_interfaces: &[String]) -> Result<usize> {
        let mut records = lock(&self.records)?;
        let mut updated = records.clone();
        let changed = detach_records(&mut updated, server_id, protected_interfaces);
        if changed > 0 {
            self.save(&updated)?;
            *records = updated;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn row(addr: &str, vlan: u16, hw_tag: Option<&str>) -> NetworkRecord {
        NetworkRecord {
            ip: Some(ip(addr)),
            vlan: Some(vlan),
            hw_tag: hw_tag.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_record_states() {
        assert!(row("10.0.0.1", 10, None).is_reservation());
        assert!(!row("10.0.0.1", 10, None).is_in_use());
        assert!(row("10.0.0.1", 10, Some("HW1")).is_in_use());
        assert!(!row("10.0.0.1", 10, Some("HW1")).is_reservation());
    }

    #[test]
    fn test_query_filters_and_order() {
        let store = MemoryStore::with_records(vec![
            row("10.0.0.12", 100, Some("A")),
            row("10.0.0.11", 100, None),
            row("10.0.0.10", 100, Some("B")),
            row("10.0.1.5", 200, Some("C")),
        ]);

        let in_use = store.query(&Query::new().vlan(100).in_use()).unwrap();
        let ips: Vec<_> = in_use.iter().filter_map(|r| r.ip).collect();
        assert_eq!(ips, vec![ip("10.0.0.10"), ip("10.0.0.12")]);

        let free = store.query(&Query::new().vlan(100).unassigned()).unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].ip, Some(ip("10.0.0.11")));
    }

    #[test]
    fn test_insert_is_conditional() {
        let store = MemoryStore::new();
        store.insert(row("10.0.0.5", 100, None)).unwrap();
        let err = store.insert(row("10.0.0.5", 100, None)).unwrap_err();
        assert!(matches!(err, Error::AddressTaken { vlan: 100, .. }));
        // same address on another vlan is a different slot
        store.insert(row("10.0.0.5", 101, None)).unwrap();
    }

    #[test]
    fn test_attach_only_reservations() {
        let store = MemoryStore::with_records(vec![row("10.0.0.5", 100, None)]);
        let binding = Binding {
            server_id: 7,
            hw_tag: None,
            mac: Some("14:6E:0A:00:00:05".into()),
        };
        let record = store.attach(100, ip("10.0.0.5"), &binding).unwrap();
        assert_eq!(record.server_id, Some(7));
        assert_eq!(record.mac.as_deref(), Some("14:6E:0A:00:00:05"));

        let err = store.attach(100, ip("10.0.0.5"), &binding).unwrap_err();
        assert!(matches!(err, Error::AddressTaken { .. }));
        assert!(matches!(
            store.attach(100, ip("10.0.0.6"), &binding),
            Err(Error::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_detach_keeps_protected_interfaces() {
        let mut eth0 = row("10.0.0.5", 100, Some("HW9"));
        eth0.interface = Some("eth0".into());
        eth0.server_id = Some(9);
        eth0.bond_options = Some("mode=4".into());
        let mut ipmi = row("10.9.0.5", 900, Some("HW9"));
        ipmi.interface = Some("ipmi".into());
        ipmi.server_id = Some(9);

        let store = MemoryStore::with_records(vec![eth0, ipmi]);
        let changed = store.detach(9, &["ipmi".to_string()]).unwrap();
        assert_eq!(changed, 2);

        let rows = store.query(&Query::new()).unwrap();
        let ipmi = rows.iter().find(|r| r.interface.as_deref() == Some("ipmi")).unwrap();
        assert_eq!(ipmi.ip, Some(ip("10.9.0.5")));
        assert_eq!(ipmi.server_id, None);

        let eth0 = rows.iter().find(|r| r.interface.as_deref() == Some("eth0")).unwrap();
        assert_eq!(eth0.ip, None);
        assert_eq!(eth0.vlan, None);
        assert_eq!(eth0.bond_options, None);
        assert_eq!(eth0.hw_tag.as_deref(), Some("HW9"));
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("records.json");

        let store = JsonStore::open(&path).unwrap();
        store.insert(row("10.0.0.20", 100, None)).unwrap();
        store.insert(row("10.0.0.21", 100, Some("HW2"))).unwrap();
        assert!(path.exists());

        let reopened = JsonStore::open(&path).unwrap();
        let rows = reopened.query(&Query::new().vlan(100)).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(
            reopened.insert(row("10.0.0.20", 100, None)),
            Err(Error::AddressTaken { .. })
        ));
    }

    #[test]
    fn test_json_store_failed_save_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        // a plain file where the store directory should be
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let path = blocker.join("records.json");

        let store = JsonStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(store.insert(row("10.0.0.30", 100, None)).is_err());
        assert!(store.query(&Query::new()).unwrap().is_empty());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(JsonStore::open(&path), Err(Error::StoreParse(_))));
    }
}

//! Network rule resolution ("remap")
//!
//! Rules come from the `[[networks]]` tables of the configuration and are
//! evaluated in the order they are written. The first rule whose specified
//! columns all agree with the request wins, so more specific rules must be
//! listed before broader ones.

use crate::error::{Error, Result};
use crate::network::cidr::{Cidr, parse_ipv4};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// A single network placement rule
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkRule {
    /// Site identifier (otherwise derived from `domain`)
    pub site_id: Option<String>,

    /// VLAN number
    pub vlan: Option<u16>,

    /// Interface name
    #[serde(alias = "nic")]
    pub interface: Option<String>,

    /// Address block served by this rule
    pub cidr: Option<Cidr>,

    /// DNS domain, `<realm>.<site>.<tld parts>`
    pub domain: Option<String>,

    /// Default gateway
    pub gw: Option<Ipv4Addr>,

    /// Realm (environment) name
    pub realm: Option<String>,

    /// Lowest address handed out to baremetal hosts on this vlan
    pub first_static_ip: Option<Ipv4Addr>,

    /// Any other columns, compared and returned as raw values
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl NetworkRule {
    /// Site decomposed from the domain: its third-from-last component
    pub fn domain_site(&self) -> Option<String> {
        let domain = self.domain.as_deref()?;
        let parts: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
        if parts.len() < 3 {
            return None;
        }
        Some(parts[parts.len() - 3].to_string())
    }

    /// Realm decomposed from the domain: the component before the site
    pub fn domain_realm(&self) -> Option<String> {
        let domain = self.domain.as_deref()?;
        let parts: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
        if parts.len() < 4 {
            return None;
        }
        Some(parts[parts.len() - 4].to_string())
    }

    /// Realm column, or the realm inside the domain
    pub fn effective_realm(&self) -> Option<String> {
        self.realm.clone().or_else(|| self.domain_realm())
    }

    /// Raw value of a rule column, stringified
    pub fn column(&self, name: &str) -> Option<String> {
        match name {
            "site_id" => self.site_id.clone(),
            "vlan" => self.vlan.map(|v| v.to_string()),
            "interface" | "nic" => self.interface.clone(),
            "cidr" => self.cidr.map(|c| c.to_string()),
            "domain" => self.domain.clone(),
            "gw" => self.gw.map(|g| g.to_string()),
            "realm" => self.realm.clone(),
            "first_static_ip" => self.first_static_ip.map(|ip| ip.to_string()),
            other => self.extra.get(other).map(|value| match value {
                toml::Value::String(s) => s.clone(),
                value => value.to_string(),
            }),
        }
    }
}

/// One selector of a resolution request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// Matched against the rule's `site_id`, or the site inside its `domain`
    SiteId(String),
    Vlan(u16),
    Interface(String),
    /// Matched against the rule's `realm`, or the realm inside its `domain`
    Realm(String),
    /// Matched by CIDR membership against the rule's `cidr`
    Ip(Ipv4Addr),
    /// Raw equality against any other column
    Column { name: String, value: String },
}

impl Criterion {
    /// Build a criterion from a `key=value` selector
    pub fn parse(key: &str, value: &str) -> Result<Self> {
        match key {
            "site_id" | "siteid" => Ok(Criterion::SiteId(value.to_string())),
            "vlan" => value
                .parse()
                .map(Criterion::Vlan)
                .map_err(|_| Error::InvalidRequest(format!("vlan '{}' is not a number", value))),
            "interface" | "nic" => Ok(Criterion::Interface(value.to_string())),
            "realm" => Ok(Criterion::Realm(value.to_string())),
            "ip" => parse_ipv4(value).map(Criterion::Ip),
            _ => Ok(Criterion::Column {
                name: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Columns the rule does not specify never reject a request
    fn matches(&self, rule: &NetworkRule) -> bool {
        match self {
            Criterion::SiteId(site) => match (&rule.site_id, rule.domain_site()) {
                (Some(id), _) => id == site,
                (None, Some(from_domain)) => &from_domain == site,
                (None, None) => true,
            },
            Criterion::Realm(realm) => rule.effective_realm().is_none_or(|r| &r == realm),
            Criterion::Vlan(vlan) => rule.vlan.is_none_or(|v| v == *vlan),
            Criterion::Interface(name) => rule.interface.as_deref().is_none_or(|i| i == name),
            Criterion::Ip(ip) => rule.cidr.is_none_or(|cidr| cidr.contains(*ip)),
            Criterion::Column { name, value } => rule.column(name).is_none_or(|v| &v == value),
        }
    }
}

/// The full set of selectors for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria(Vec<Criterion>);

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` selector pairs
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        pairs
            .iter()
            .map(|(key, value)| Criterion::parse(key, value))
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn with(mut self, criterion: Criterion) -> Self {
        self.0.push(criterion);
        self
    }

    pub fn site_id(self, site: &str) -> Self {
        self.with(Criterion::SiteId(site.to_string()))
    }

    pub fn vlan(self, vlan: u16) -> Self {
        self.with(Criterion::Vlan(vlan))
    }

    pub fn interface(self, name: &str) -> Self {
        self.with(Criterion::Interface(name.to_string()))
    }

    pub fn realm(self, realm: &str) -> Self {
        self.with(Criterion::Realm(realm.to_string()))
    }

    #[cfg(test)]
    pub fn ip(self, ip: Ipv4Addr) -> Self {
        self.with(Criterion::Ip(ip))
    }

    #[cfg(test)]
    pub fn column(self, name: &str, value: &str) -> Self {
        self.with(Criterion::Column {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    fn has_vlan_or_ip(&self) -> bool {
        self.0
            .iter()
            .any(|c| matches!(c, Criterion::Vlan(_) | Criterion::Ip(_)))
    }

    fn matches(&self, rule: &NetworkRule) -> bool {
        self.0.iter().all(|c| c.matches(rule))
    }
}

/// A value to extract from the winning rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// `siteid`: site decomposed from the domain
    SiteId,
    /// `mask`: netmask derived from the rule's cidr
    Mask,
    /// `ip`: network prefix with trailing zero octets dropped, e.g. `10.20.`
    Prefix,
    /// `gw`: gateway, needs a vlan or ip selector
    Gateway,
    /// Any raw rule column
    Column(String),
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidRequest("empty field name".to_string()));
        }
        Ok(match s {
            "siteid" => Field::SiteId,
            "mask" => Field::Mask,
            "ip" => Field::Prefix,
            "gw" => Field::Gateway,
            other => Field::Column(other.to_string()),
        })
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::SiteId => write!(f, "siteid"),
            Field::Mask => write!(f, "mask"),
            Field::Prefix => write!(f, "ip"),
            Field::Gateway => write!(f, "gw"),
            Field::Column(name) => write!(f, "{}", name),
        }
    }
}

impl Field {
    fn extract(&self, rule: &NetworkRule) -> Option<String> {
        match self {
            Field::SiteId => rule.domain_site().or_else(|| rule.site_id.clone()),
            Field::Mask => rule.cidr.map(|c| c.netmask().to_string()),
            Field::Prefix => rule.cidr.map(|c| network_prefix(c.network())),
            Field::Gateway => rule.gw.map(|g| g.to_string()),
            Field::Column(name) => rule.column(name),
        }
    }
}

/// Requested fields: a single name or an ordered list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fields {
    One(Field),
    Many(Vec<Field>),
}

impl Fields {
    /// Parse a comma-separated list; a single name yields `Fields::One`
    pub fn parse(list: &str) -> Result<Self> {
        let fields = list
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<Field>>>()?;
        Ok(match <[Field; 1]>::try_from(fields) {
            Ok([field]) => Fields::One(field),
            Err(fields) => Fields::Many(fields),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        match self {
            Fields::One(field) => std::slice::from_ref(field).iter(),
            Fields::Many(fields) => fields.iter(),
        }
    }
}

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// No rule matched; callers decide whether that is fatal
    NotFound,
    One(Option<String>),
    Many(Vec<Option<String>>),
}

impl Resolved {
    /// Treat an unmatched request as a configuration error
    pub fn required(self, what: &str) -> Result<Self> {
        match self {
            Resolved::NotFound => Err(Error::Configuration(format!("no network rule matches {}", what))),
            found => Ok(found),
        }
    }
}

/// Strip trailing `.0` octets and append a dot: `10.20.0.0` -> `10.20.`
fn network_prefix(network: Ipv4Addr) -> String {
    let mut prefix = network.to_string();
    while let Some(stripped) = prefix.strip_suffix(".0") {
        prefix = stripped.to_string();
    }
    format!("{}.", prefix)
}

/// Resolve `fields` from the first rule matching every criterion
pub fn resolve(
    rules: &[NetworkRule],
    fields: &Fields,
    criteria: &Criteria,
) -> Result<Resolved> {
    if fields.iter().any(|f| *f == Field::Gateway) && !criteria.has_vlan_or_ip() {
        return Err(Error::InvalidRequest(
            "gateway lookup needs a vlan or ip selector".to_string(),
        ));
    }

    let Some(rule) = rules.iter().find(|rule| criteria.matches(rule)) else {
        return Ok(Resolved::NotFound);
    };

    Ok(match fields {
        Fields::One(field) => Resolved::One(field.extract(rule)),
        Fields::Many(fields) => Resolved::Many(fields.iter().map(|f| f.extract(rule)).collect()),
    })
}

/// Immutable rule table loaded once from configuration
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    rules: Vec<NetworkRule>,
}

impl Resolver {
    pub fn new(rules: Vec<NetworkRule>) -> Self {
        Self { rules }
    }

    pub fn resolve(&self, fields: &Fields, criteria: &Criteria) -> Result<Resolved> {
        resolve(&self.rules, fields, criteria)
    }

    /// First rule matching every criterion
    pub fn first_match(&self, criteria: &Criteria) -> Option<&NetworkRule> {
        self.rules.iter().find(|rule| criteria.matches(rule))
    }

    /// Like `first_match`, but a missing rule is a configuration error
    pub fn require(&self, criteria: &Criteria, what: &str) -> Result<&NetworkRule> {
        self.first_match(criteria)
            .ok_or_else(|| Error::Configuration(format!("no network rule matches {}", what)))
    }
}

//! sitenet - network rule resolver and IPv4 allocator
//!
//! Resolves per-site network settings from a TOML rule table and hands out
//! probe-validated addresses for baremetal and virtual hosts.

mod allocator;
mod cli;
mod error;
mod manifest;
mod network;
mod probe;
mod remap;
mod store;

use allocator::{AllocationRequest, Allocator};
use cli::{Cli, Commands};
use error::Result;
use network::cidr::{broadcast, netmask, network, parse_ipv4, wildcard, within};
use network::mac::{DEFAULT_MAC_PREFIX, ip_to_mac, mac_to_oid, validate_prefix};
use network::{Cidr, generate_range};
use probe::PingProbe;
use remap::{Criteria, Fields, Resolved};
use store::{Binding, JsonStore, NetworkRecord, Query, RecordStore};

use std::sync::Arc;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        // Commands that don't require config
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            return Ok(());
        }
        Commands::Cidr { cidr } => {
            let cidr: Cidr = cidr.parse()?;
            let prefix_len = cidr.prefix_len();
            let net = network(cidr.addr(), prefix_len)?;
            let wild = wildcard(prefix_len)?;
            println!("address:   {}", cidr.addr());
            println!("prefix:    /{}", prefix_len);
            println!("netmask:   {}", netmask(prefix_len)?);
            println!("wildcard:  {}", wild);
            println!("network:   {}", net);
            println!("broadcast: {}", broadcast(net, wild));
            return Ok(());
        }
        Commands::Within { ip, cidr } => {
            println!("{}", within(Some(&ip), &cidr)?);
            return Ok(());
        }
        Commands::Range { first, count, last } => {
            let first = parse_ipv4(&first)?;
            let last = last.as_deref().map(parse_ipv4).transpose()?;
            for ip in generate_range(first, count, last)? {
                println!("{}", ip);
            }
            return Ok(());
        }
        Commands::Oid { mac } => {
            println!("{}", mac_to_oid(&mac)?);
            return Ok(());
        }
        Commands::Mac { ip, prefix } => {
            let ip = parse_ipv4(&ip)?;
            let prefix = match prefix {
                Some(prefix) => prefix,
                // Fall back to the configured prefix when a config is present
                None if cli.config.exists() => manifest::load(&cli.config)?.config.mac_prefix,
                None => DEFAULT_MAC_PREFIX.to_string(),
            };
            validate_prefix(&prefix)?;
            println!("{}", ip_to_mac(ip, &prefix));
            return Ok(());
        }
        _ => {}
    }

    let config = manifest::load(&cli.config)?;
    log::debug!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Commands::Check => {
            println!(
                "Configuration OK: {} sites, {} network rules",
                config.sites.len(),
                config.networks.len()
            );
            for site in &config.sites {
                match &site.description {
                    Some(description) => println!("  {} ({})", site.id, description),
                    None => println!("  {}", site.id),
                }
            }
            for (idx, rule) in config.networks.iter().enumerate() {
                if rule.vlan.is_none() && rule.cidr.is_none() {
                    log::warn!("networks[{}] has neither vlan nor cidr and matches broadly", idx);
                }
            }
        }

        Commands::Resolve { fields, criteria, json } => {
            let fields = Fields::parse(&fields)?;
            let criteria = Criteria::from_pairs(&criteria)?;
            let values = match config
                .resolver()
                .resolve(&fields, &criteria)?
                .required("the given selectors")?
            {
                Resolved::One(value) => vec![value],
                Resolved::Many(values) => values,
                Resolved::NotFound => Vec::new(),
            };
            print_resolved(&fields, values, json)?;
        }

        Commands::Allocate {
            kind,
            vlan,
            site,
            realm,
            interface,
            autogen,
            server_id,
            hw_tag,
            json,
        } => {
            let store = Arc::new(JsonStore::open(&config.config.store)?);
            log::debug!("Using record store {}", store.path().display());
            let probe = Arc::new(PingProbe::from_config(&config.config));
            let allocator = Allocator::new(&config, store, probe);

            let request = AllocationRequest {
                vlan,
                realm,
                site_id: site,
                interface,
                autogen,
            };
            let allocation = allocator.allocate(kind.into(), &request)?;

            match server_id {
                Some(server_id) => {
                    let binding = Binding {
                        server_id,
                        hw_tag,
                        mac: None,
                    };
                    let record = allocator.commit(&allocation, binding)?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&record)?);
                    } else {
                        println!(
                            "Assigned {} (vlan {}) to server {}",
                            allocation.ip, allocation.vlan, server_id
                        );
                    }
                }
                None if json => println!("{}", serde_json::to_string_pretty(&allocation)?),
                None => {
                    println!("{}", allocation.ip);
                    log::info!(
                        "Not committed; pass --server-id to record {} as {} on vlan {}",
                        allocation.ip,
                        allocation.kind,
                        allocation.vlan
                    );
                }
            }
        }

        Commands::Records {
            vlan,
            site,
            unassigned,
            server_id,
            json,
        } => {
            let store = JsonStore::open(&config.config.store)?;
            let mut query = Query::new();
            if let Some(vlan) = vlan {
                query = query.vlan(vlan);
            }
            if let Some(site) = &site {
                query = query.site_id(site);
            }
            if let Some(server_id) = server_id {
                query = query.server_id(server_id);
            }
            if unassigned {
                query = query.unassigned();
            }
            let records = store.query(&query)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        }

        Commands::Decommission { server_id, dry_run } => {
            let store = JsonStore::open(&config.config.store)?;
            if dry_run {
                let records = store.query(&Query::new().server_id(server_id))?;
                println!(
                    "[dry-run] Would release {} records of server {}",
                    records.len(),
                    server_id
                );
                print_records(&records);
            } else {
                let changed = store.detach(server_id, &config.config.protected_interfaces)?;
                println!("Released {} records of server {}", changed, server_id);
            }
        }

        // Already handled above
        Commands::Completion { .. }
        | Commands::Cidr { .. }
        | Commands::Within { .. }
        | Commands::Range { .. }
        | Commands::Oid { .. }
        | Commands::Mac { .. } => unreachable!(),
    }

    Ok(())
}

fn print_resolved(fields: &Fields, values: Vec<Option<String>>, json: bool) -> Result<()> {
    let pairs: Vec<(String, Option<String>)> =
        fields.iter().map(ToString::to_string).zip(values).collect();

    match (fields, json) {
        (Fields::One(_), true) => {
            let value = pairs.into_iter().next().and_then(|(_, v)| v);
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        (Fields::Many(_), true) => {
            let object: serde_json::Map<String, serde_json::Value> = pairs
                .into_iter()
                .map(|(k, v)| (k, v.map_or(serde_json::Value::Null, serde_json::Value::String)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&object)?);
        }
        (Fields::One(_), false) => {
            let value = pairs.into_iter().next().and_then(|(_, v)| v);
            println!("{}", value.unwrap_or_default());
        }
        (Fields::Many(_), false) => {
            for (field, value) in pairs {
                println!("{}={}", field, value.unwrap_or_default());
            }
        }
    }
    Ok(())
}

fn print_records(records: &[NetworkRecord]) {
    if records.is_empty() {
        println!("No records.");
        return;
    }

    println!(
        "{:<16} {:<6} {:<10} {:<10} {:<12} {:<8} {}",
        "IP", "VLAN", "INTERFACE", "SERVER", "HW TAG", "SITE", "REALM"
    );
    for record in records {
        println!(
            "{:<16} {:<6} {:<10} {:<10} {:<12} {:<8} {}",
            record.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into()),
            record.vlan.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            record.interface.as_deref().unwrap_or("-"),
            record.server_id.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            record.hw_tag.as_deref().unwrap_or("-"),
            record.site_id.as_deref().unwrap_or("-"),
            record.realm.as_deref().unwrap_or("-"),
        );
    }
}

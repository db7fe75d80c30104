//! Command-line interface for sitenet
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::allocator::AllocationKind;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// sitenet - network rule resolver and IPv4 allocator
#[derive(Parser)]
#[command(name = "sitenet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "sitenet.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration
    Check,

    /// Look up fields of the first matching network rule
    Resolve {
        /// Field or comma-separated fields (siteid, mask, ip, gw, or any column)
        fields: String,

        /// Selector (KEY=VALUE), e.g. vlan=100 or site_id=iad1
        #[arg(short = 'w', long = "where", value_parser = parse_key_val)]
        criteria: Vec<(String, String)>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show netmask, network, wildcard and broadcast of a CIDR
    Cidr {
        /// Block in CIDR notation (e.g., 192.168.1.130/26)
        cidr: String,
    },

    /// Test whether an address falls inside a CIDR
    Within {
        /// IPv4 address
        ip: String,

        /// Block in CIDR notation
        cidr: String,
    },

    /// Print a sequence of consecutive addresses
    Range {
        /// First address
        first: String,

        /// Number of addresses
        #[arg(short = 'n', long, conflicts_with = "last")]
        count: Option<usize>,

        /// Last address (inclusive)
        #[arg(short, long)]
        last: Option<String>,
    },

    /// Derive the MAC for a virtual NIC address
    Mac {
        /// IPv4 address
        ip: String,

        /// Two-byte MAC prefix (defaults to the configured one)
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Convert a MAC to its decimal OID suffix
    Oid {
        /// Colon-delimited MAC address
        mac: String,
    },

    /// Allocate an address for a host
    Allocate {
        /// Kind of host
        #[arg(value_enum)]
        kind: HostKind,

        /// Target vlan (resolved from the rules when omitted)
        #[arg(long)]
        vlan: Option<u16>,

        /// Site id
        #[arg(short, long)]
        site: Option<String>,

        /// Realm
        #[arg(short, long)]
        realm: Option<String>,

        /// Interface name
        #[arg(short, long)]
        interface: Option<String>,

        /// Create reservations when the virtual pool is exhausted
        #[arg(long)]
        autogen: bool,

        /// Commit the allocation to this server
        #[arg(long)]
        server_id: Option<u64>,

        /// Hardware tag recorded with a committed allocation
        #[arg(long, requires = "server_id")]
        hw_tag: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List network records
    Records {
        /// Only this vlan
        #[arg(long)]
        vlan: Option<u16>,

        /// Only this site
        #[arg(short, long)]
        site: Option<String>,

        /// Only unassigned reservations
        #[arg(long, conflicts_with = "server_id")]
        unassigned: bool,

        /// Only rows of this server
        #[arg(long)]
        server_id: Option<u64>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Release every network record of a server
    Decommission {
        /// Server id
        server_id: u64,

        /// Show what would be done without making changes
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Host kinds accepted by `allocate`
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HostKind {
    Baremetal,
    Virtual,
}

impl From<HostKind> for AllocationKind {
    fn from(kind: HostKind) -> Self {
        match kind {
            HostKind::Baremetal => AllocationKind::Baremetal,
            HostKind::Virtual => AllocationKind::Virtual,
        }
    }
}

/// Parse key=value pairs for rule selectors
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "sitenet", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_resolve_selectors() {
        let cli = Cli::try_parse_from(["sitenet", "resolve", "mask,gw", "-w", "vlan=100", "--where", "site_id=iad1"])
            .unwrap();
        match cli.command {
            Commands::Resolve { fields, criteria, json } => {
                assert_eq!(fields, "mask,gw");
                assert_eq!(
                    criteria,
                    vec![
                        ("vlan".to_string(), "100".to_string()),
                        ("site_id".to_string(), "iad1".to_string()),
                    ]
                );
                assert!(!json);
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn test_selector_needs_equals() {
        assert!(Cli::try_parse_from(["sitenet", "resolve", "mask", "-w", "vlan"]).is_err());
    }

    #[test]
    fn test_range_bounds_conflict() {
        assert!(Cli::try_parse_from(["sitenet", "range", "10.0.0.1", "-n", "3", "--last", "10.0.0.9"]).is_err());
    }

    #[test]
    fn test_hw_tag_requires_server() {
        assert!(Cli::try_parse_from(["sitenet", "allocate", "baremetal", "--hw-tag", "HW1"]).is_err());
        assert!(
            Cli::try_parse_from(["sitenet", "allocate", "baremetal", "--hw-tag", "HW1", "--server-id", "7"]).is_ok()
        );
    }
}

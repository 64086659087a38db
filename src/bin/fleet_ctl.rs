//! Offline editor for the proxy config document
//!
//! Usage:
//!   proxyfleet-ctl add <url> <port> [options]
//!   proxyfleet-ctl delete <port>
//!   proxyfleet-ctl disable <port>
//!   proxyfleet-ctl retain <port>...
//!   proxyfleet-ctl list [--json]
//!   proxyfleet-ctl recommend
//!
//! Changes take effect on the next boot or `create-config` call.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use proxyfleet::config::{
    is_supported_device_type, DEFAULT_MANAGEMENT_PORT, DEFAULT_USABLE_PORT_START,
};
use proxyfleet::{ConfigStore, PortAllocator, PortDecision, ProxyEntry};
use std::collections::HashSet;
use std::path::PathBuf;

/// Edit the proxy config document without a running daemon
#[derive(Parser, Debug)]
#[command(name = "proxyfleet-ctl")]
#[command(version = "1.0.0")]
#[command(about = "Manage proxy entries in the proxyfleet config document")]
struct Args {
    /// Proxy config document
    #[arg(long, env = "PROXY_CONFIG", default_value = "./config/proxy_config.json")]
    config: PathBuf,

    /// Management port; defaults to SERVER.PORT of the document
    #[arg(long, env = "MANAGEMENT_PORT")]
    management_port: Option<u16>,

    /// First port probed for recommendations
    #[arg(long, env = "USABLE_PORT_START", default_value_t = DEFAULT_USABLE_PORT_START)]
    usable_port_start: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a proxy entry
    Add {
        /// Backend URL (e.g., https://10.0.0.1:8443)
        url: String,

        /// Local proxy port
        port: u16,

        /// Device type
        #[arg(short = 't', long, default_value = "default")]
        device_type: String,

        /// Device name
        #[arg(short = 'n', long, default_value = "")]
        name: String,

        /// Device code
        #[arg(short = 'c', long, default_value = "")]
        code: String,

        /// Description
        #[arg(short = 'd', long, default_value = "")]
        desc: String,

        /// Store the entry with its use flag cleared
        #[arg(long)]
        disabled: bool,
    },

    /// Delete every entry on a port
    Delete {
        port: u16,
    },

    /// Clear the use flag of entries on a port
    Disable {
        port: u16,
    },

    /// Keep only entries on the given ports
    Retain {
        #[arg(required = true)]
        ports: Vec<u16>,
    },

    /// Remove every entry
    Clear,

    /// List all entries
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the port that would replace a conflicting request
    Recommend,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let management_port = match args.management_port {
        Some(port) => port,
        None => ConfigStore::new(&args.config, DEFAULT_MANAGEMENT_PORT)
            .document()?
            .server
            .port
            .unwrap_or(DEFAULT_MANAGEMENT_PORT),
    };
    let store = ConfigStore::new(&args.config, management_port);
    let allocator = PortAllocator::new(management_port, args.usable_port_start);

    match args.command {
        Commands::Add {
            url,
            port,
            device_type,
            name,
            code,
            desc,
            disabled,
        } => {
            if !is_supported_device_type(&device_type) {
                bail!("Unsupported device type: {}", device_type);
            }

            let entries = store.load()?;
            match allocator.check(&entries, port, &url) {
                PortDecision::Reserved => bail!("Port {} is the management port", port),
                PortDecision::Conflict { recommended } => {
                    let hint = recommended
                        .map(|p| format!(" (try {})", p))
                        .unwrap_or_default();
                    bail!("Port {} is already mapped to another URL{}", port, hint);
                }
                PortDecision::ExactMatch | PortDecision::Available => {}
            }

            let mut entry = ProxyEntry::new(&url, port);
            entry.ip = url::Url::parse(&url).ok().and_then(|u| u.host_str().map(str::to_string));
            entry.device_type = device_type.to_ascii_lowercase();
            entry.device_name = name;
            entry.device_code = code;
            entry.description = desc;
            entry.use_flag = !disabled;

            store.upsert_entry(entry.clone())?;
            println!("Added entry:");
            print_entry(&entry);
        }

        Commands::Delete { port } => {
            let removed = store.remove_by_port(port)?;
            if removed > 0 {
                println!("Deleted {} entr{} on port {}", removed, plural(removed), port);
            } else {
                eprintln!("No entries found on port {}", port);
                std::process::exit(1);
            }
        }

        Commands::Disable { port } => {
            let touched = store.disable_by_port(port)?;
            if touched == 0 {
                eprintln!("No entries found on port {}", port);
                std::process::exit(1);
            }
            println!("Disabled {} entr{} on port {}", touched, plural(touched), port);
        }

        Commands::Retain { ports } => {
            let keep: HashSet<u16> = ports.into_iter().collect();
            let removed = store.remove_all_except_ports(&keep)?;
            println!("Removed {} entr{}", removed, plural(removed));
        }

        Commands::Clear => {
            store.clear_all()?;
            println!("Cleared {}", store.path().display());
        }

        Commands::List { json } => {
            let entries = store.load()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }

            if entries.is_empty() {
                println!("No entries found");
                return Ok(());
            }

            println!(
                "{:<8} {:<36} {:<20} {:<8} {:<10} {:<5}",
                "PORT", "URL", "NAME", "CODE", "TYPE", "USE"
            );
            println!("{}", "-".repeat(92));
            for entry in &entries {
                println!(
                    "{:<8} {:<36} {:<20} {:<8} {:<10} {:<5}",
                    entry.proxy_port,
                    entry.url,
                    entry.device_name,
                    entry.device_code,
                    entry.device_type,
                    if entry.use_flag { "yes" } else { "no" }
                );
            }
            println!("\nTotal: {} entr{}", entries.len(), plural(entries.len()));
        }

        Commands::Recommend => match allocator.recommend_port(&store.load()?) {
            Some(port) => println!("{}", port),
            None => bail!("No free port at or above {}", args.usable_port_start),
        },
    }

    Ok(())
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        "y"
    } else {
        "ies"
    }
}

fn print_entry(entry: &ProxyEntry) {
    println!("  URL:         {}", entry.url);
    println!("  Proxy Port:  {}", entry.proxy_port);
    println!("  Device:      {} ({})", entry.device_name, entry.device_type);
    if !entry.device_code.is_empty() {
        println!("  Code:        {}", entry.device_code);
    }
    println!("  Enabled:     {}", entry.use_flag);
}

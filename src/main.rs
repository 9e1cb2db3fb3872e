//! mcache - A small command-line memcached client
//!
//! Runs one command against one or more memcached servers and prints the
//! reply. Useful for poking at a cache by hand.

use anyhow::{bail, Context};
use memcache_client::{
    ClientConfig, CommandOptions, MemcacheClient, Routing, ServerConfig, StoreOptions,
};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Command-line configuration
#[derive(Default)]
struct Config {
    /// Servers to talk to
    servers: Vec<String>,
    /// Command timeout in milliseconds
    cmd_timeout: Option<u64>,
    /// Route keys over a consistent hash ring
    hash_ring: bool,
    /// The subcommand and its arguments
    command: Vec<String>,
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--server" | "-s" => {
                    if i + 1 < args.len() {
                        config.servers.push(args[i + 1].clone());
                        i += 2;
                    } else {
                        eprintln!("Error: --server requires a value");
                        std::process::exit(1);
                    }
                }
                "--cmd-timeout" | "-t" => {
                    if i + 1 < args.len() {
                        config.cmd_timeout = Some(args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid timeout");
                            std::process::exit(1);
                        }));
                        i += 2;
                    } else {
                        eprintln!("Error: --cmd-timeout requires a value");
                        std::process::exit(1);
                    }
                }
                "--hash-ring" => {
                    config.hash_ring = true;
                    i += 1;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("mcache version {}", memcache_client::VERSION);
                    std::process::exit(0);
                }
                arg if arg.starts_with('-') => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
                _ => {
                    config.command = args[i..].to_vec();
                    break;
                }
            }
        }

        if config.servers.is_empty() {
            config.servers.push(format!("127.0.0.1:{}", memcache_client::config::defaults::PORT));
        }
        if config.command.is_empty() {
            print_help();
            std::process::exit(1);
        }

        config
    }

    fn client_config(&self) -> ClientConfig {
        let mut config =
            ClientConfig::new(ServerConfig::list(self.servers.iter())).with_default_connect_timeout();
        if self.hash_ring {
            config = config.with_routing(Routing::ConsistentHash);
        }
        if let Some(ms) = self.cmd_timeout {
            config = config.with_cmd_timeout(Duration::from_millis(ms));
        }
        config
    }
}

fn print_help() {
    println!(
        r#"
mcache - A command-line memcached client

USAGE:
    mcache [OPTIONS] <COMMAND> [ARGS...]

OPTIONS:
    -s, --server <ADDR>      Server address, repeatable (default: 127.0.0.1:11211)
    -t, --cmd-timeout <MS>   Command timeout in milliseconds (default: 5000)
        --hash-ring          Route keys over a consistent hash ring
    -v, --version            Print version information
    -h, --help               Print this help message

COMMANDS:
    get <KEY>                      Print a value
    gets <KEY>                     Print a value and its cas unique
    set <KEY> <VALUE> [LIFETIME]   Store a value
    add <KEY> <VALUE> [LIFETIME]   Store a value if the key is free
    delete <KEY>                   Remove a value
    incr <KEY> <DELTA>             Increment a counter
    decr <KEY> <DELTA>             Decrement a counter
    touch <KEY> <LIFETIME>         Update a lifetime
    version                        Print the server version
    stats                          Print server statistics

EXAMPLES:
    mcache set greeting hello 300
    mcache --server cache-a:11211 --server cache-b:11211 get greeting
    RUST_LOG=debug mcache stats
"#
    );
}

fn arg<'a>(command: &'a [String], index: usize, name: &str) -> anyhow::Result<&'a str> {
    command
        .get(index)
        .map(String::as_str)
        .with_context(|| format!("{} requires <{}>", command[0], name))
}

fn store_options(command: &[String]) -> anyhow::Result<StoreOptions> {
    let mut options = StoreOptions::new();
    if let Some(lifetime) = command.get(3) {
        options = options.lifetime(lifetime.parse().context("invalid lifetime")?);
    }
    Ok(options)
}

fn print_tokens(reply: Option<Vec<String>>) {
    match reply {
        Some(tokens) => println!("{}", tokens.join(" ")),
        None => println!("(no reply)"),
    }
}

async fn run(client: &MemcacheClient, command: &[String]) -> anyhow::Result<()> {
    match command[0].as_str() {
        "get" | "gets" => {
            let key = arg(command, 1, "KEY")?;
            let item = if command[0] == "get" {
                client.get(key).await?
            } else {
                client.gets(key).await?
            };
            match item {
                Some(item) => match item.cas_unique {
                    Some(cas) => println!("{} (flags {}, cas {})", item.value, item.flags, cas),
                    None => println!("{} (flags {})", item.value, item.flags),
                },
                None => println!("(not found)"),
            }
        }
        "set" | "add" => {
            let key = arg(command, 1, "KEY")?;
            let value = arg(command, 2, "VALUE")?;
            let options = store_options(command)?;
            let reply = if command[0] == "set" {
                client.set(key, value, options).await?
            } else {
                client.add(key, value, options).await?
            };
            print_tokens(reply);
        }
        "delete" => {
            let key = arg(command, 1, "KEY")?;
            print_tokens(client.delete(key, CommandOptions::default()).await?);
        }
        "incr" | "decr" => {
            let key = arg(command, 1, "KEY")?;
            let delta = arg(command, 2, "DELTA")?
                .parse()
                .context("invalid delta")?;
            let value = if command[0] == "incr" {
                client.incr(key, delta, CommandOptions::default()).await?
            } else {
                client.decr(key, delta, CommandOptions::default()).await?
            };
            match value {
                Some(value) => println!("{}", value),
                None => println!("(no reply)"),
            }
        }
        "touch" => {
            let key = arg(command, 1, "KEY")?;
            let lifetime = arg(command, 2, "LIFETIME")?
                .parse()
                .context("invalid lifetime")?;
            print_tokens(client.touch(key, lifetime, CommandOptions::default()).await?);
        }
        "version" => {
            println!("{}", client.version().await?);
        }
        "stats" => {
            let mut stats: Vec<_> = client.stats().await?.into_iter().collect();
            stats.sort();
            for (name, value) in stats {
                println!("{:<24} {}", name, value);
            }
        }
        other => bail!("unknown command: {}", other),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging, quiet unless RUST_LOG says otherwise
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let client = MemcacheClient::new(config.client_config())?;
    debug!(servers = ?config.servers, "Client ready");

    let result = run(&client, &config.command).await;
    client.shutdown();
    result
}

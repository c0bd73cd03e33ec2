use anyhow::Context;
use attract::{Client, Config, Direction, IpVersion, Protocol, Server, DEFAULT_PORT};
use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "attract")]
#[command(about = "Network throughput tester - TCP/UDP, IPv4/IPv6, uni- or bidirectional", long_about = None)]
#[command(version)]
struct Cli {
    /// Run in server mode
    #[arg(short = 's', long)]
    server: bool,

    /// IP version: auto, 4 or 6
    #[arg(short = 'v', long = "ip-version", default_value = "auto")]
    ip_version: IpVersion,

    /// Data protocol: t(cp) or u(dp)
    #[arg(short = 'p', long, default_value = "t")]
    protocol: Protocol,

    /// Direction: u(ni) or b(i)
    #[arg(short = 'd', long, default_value = "u")]
    direction: Direction,

    /// Packet length in bytes
    #[arg(short = 'l', long, default_value = "512")]
    length: usize,

    /// Number of packets to send; overrides --time
    #[arg(short = 'c', long)]
    count: Option<u64>,

    /// Transfer time in seconds
    #[arg(short = 't', long, default_value = "10")]
    time: u64,

    /// Control port
    #[arg(short = 'P', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Print a single raw result line
    #[arg(short = 'r', long, conflicts_with = "json")]
    raw: bool,

    /// Print the result as JSON
    #[arg(short = 'J', long)]
    json: bool,

    /// Bind the server to this address only
    #[arg(short = 'b', long)]
    bind: Option<IpAddr>,

    /// Server to connect to (client mode)
    #[arg(required_unless_present = "server")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if cli.server {
        let mut config = Config::server(cli.port);
        if let Some(bind) = cli.bind {
            config = config.with_bind_addr(bind);
        }
        config.validate()?;

        let server = Server::new(config);
        let shutdown = server.cancellation_token().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
        server.run().await?;
        return Ok(());
    }

    let host = cli.host.context("no server host given")?;
    let mut config = Config::client(host, cli.port)
        .with_ip_version(cli.ip_version)
        .with_protocol(cli.protocol)
        .with_direction(cli.direction)
        .with_packet_len(cli.length)
        .with_duration(Duration::from_secs(cli.time));
    if let Some(count) = cli.count {
        config = config.with_count(count);
    }

    let report = Client::new(config)?.run().await?;

    if cli.json {
        println!("{}", report.to_json()?);
    } else if cli.raw {
        println!("{}", report.raw_line());
    } else {
        println!("{}", report);
    }

    Ok(())
}

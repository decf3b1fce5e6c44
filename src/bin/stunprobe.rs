use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use stunprobe::{
    init_logging, resolver, BehaviorClient, ClassicClient, ProbeConfig, DEFAULT_STUN_PORT,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "STUN NAT mapping and filtering discovery", long_about = None)]
struct Args {
    /// STUN server (host[:port], port defaults to 3478)
    #[arg(default_value = "stun.stunprotocol.org")]
    server: String,

    /// Local bind address
    #[arg(short, long, default_value = "0.0.0.0:0")]
    local: SocketAddr,

    /// Probe binding and mapping behavior over TCP instead of UDP
    #[arg(long)]
    tcp: bool,

    /// Run the legacy RFC 3489 classification instead of behavior discovery
    #[arg(long)]
    classic: bool,

    /// Per-attempt receive timeout in milliseconds
    #[arg(long, default_value_t = 1600)]
    timeout_ms: u64,

    /// Send/receive attempts per test
    #[arg(long, default_value_t = 1)]
    attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let server = resolver::resolve_server(&args.server, DEFAULT_STUN_PORT).await?;
    let config = ProbeConfig {
        recv_timeout: Duration::from_millis(args.timeout_ms),
        attempts: args.attempts,
        ..ProbeConfig::default()
    };

    if args.classic {
        if args.tcp {
            anyhow::bail!("classic classification runs over UDP only");
        }
        let mut client = ClassicClient::bind(server, args.local)
            .await?
            .with_config(config);
        let result = client.query().await?;

        println!("Server:          {server}");
        println!("NAT type:        {}", result.nat_type);
        if let Some(public) = result.public_endpoint {
            println!("Public endpoint: {public}");
        }
    } else {
        let mut client = if args.tcp {
            BehaviorClient::tcp(server, args.local)?
        } else {
            BehaviorClient::bind_udp(server, args.local).await?
        }
        .with_config(config);
        let result = client.query().await?;

        println!("Server:             {server}");
        println!("Binding test:       {}", result.binding);
        println!("Mapping behavior:   {}", result.mapping);
        if !args.tcp {
            println!("Filtering behavior: {}", result.filtering);
        }
        if let Some(endpoint) = result.local_endpoint {
            println!("Local endpoint:     {endpoint}");
        }
        if let Some(endpoint) = result.public_endpoint {
            println!("Public endpoint:    {endpoint}");
        }
        if let Some(endpoint) = result.other_endpoint {
            println!("Alternate server:   {endpoint}");
        }
    }

    Ok(())
}

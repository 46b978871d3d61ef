//! trellisctl -- operator CLI for a Trellis cluster
//!
//! Talks to any node's RPC surface: list nodes, peers, and routes, manage
//! the authorised-peer set, and reserve routes.

use anyhow::Result;
use clap::{Parser, Subcommand};

use trellis_proto::Client;

/// Operator CLI for a Trellis cluster
#[derive(Parser)]
#[command(name = "trellisctl", version, about)]
struct Cli {
    /// RPC address of any cluster node
    #[arg(long, short, default_value = "127.0.0.1:9000", env = "TRELLIS_ADDR")]
    addr: String,

    /// Disable TLS certificate verification
    #[arg(long)]
    skip_verify: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Node management
    Nodes {
        #[command(subcommand)]
        command: NodesCommand,
    },
    /// Peer management
    Peers {
        #[command(subcommand)]
        command: PeersCommand,
    },
    /// Route management
    Routes {
        #[command(subcommand)]
        command: RoutesCommand,
    },
}

#[derive(Subcommand)]
enum NodesCommand {
    /// List cluster nodes
    List,
}

#[derive(Subcommand)]
enum PeersCommand {
    /// List peers
    List,
    /// List authorised peer IDs
    Authorized,
    /// Authorise a peer ID
    Authorize { id: String },
    /// Deauthorise a peer ID and evict it
    Deauthorize { id: String },
}

#[derive(Subcommand)]
enum RoutesCommand {
    /// List routes
    List,
    /// Reserve a route through a node
    Create { node_id: String, network: String },
    /// Delete a route
    Delete { network: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::builder()
        .skip_verify(cli.skip_verify)
        .build(&cli.addr)?;

    match cli.command {
        Commands::Nodes { command } => match command {
            NodesCommand::List => {
                let nodes = client.nodes().await?;
                println!(
                    "{:<24} {:<24} {:<16} {}",
                    "ID", "ADDR", "GATEWAY", "PUBLIC KEY"
                );
                for node in nodes {
                    println!(
                        "{:<24} {:<24} {:<16} {}",
                        node.id, node.addr, node.gateway_ip, node.key_pair.public_key
                    );
                }
            }
        },
        Commands::Peers { command } => match command {
            PeersCommand::List => {
                let peers = client.peers().await?;
                println!(
                    "{:<24} {:<46} {:<24} {}",
                    "ID", "PUBLIC KEY", "ENDPOINT", "ALLOWED IPS"
                );
                for peer in peers {
                    println!(
                        "{:<24} {:<46} {:<24} {}",
                        peer.id,
                        peer.key_pair.public_key,
                        peer.endpoint,
                        peer.allowed_ips.join(", ")
                    );
                }
            }
            PeersCommand::Authorized => {
                println!("ID");
                for id in client.authorized_peers().await? {
                    println!("{id}");
                }
            }
            PeersCommand::Authorize { id } => {
                client.authorize_peer(&id).await?;
                println!("authorized {id}");
            }
            PeersCommand::Deauthorize { id } => {
                client.deauthorize_peer(&id).await?;
                println!("deauthorized {id}");
            }
        },
        Commands::Routes { command } => match command {
            RoutesCommand::List => {
                let routes = client.routes().await?;
                println!("{:<24} {}", "NODE", "NETWORK");
                for route in routes {
                    println!("{:<24} {}", route.node_id, route.network);
                }
            }
            RoutesCommand::Create { node_id, network } => {
                client.create_route(&node_id, &network).await?;
                println!("created route {network} via {node_id}");
            }
            RoutesCommand::Delete { network } => {
                client.delete_route(&network).await?;
                println!("deleted route {network}");
            }
        },
    }

    Ok(())
}

//! Embermesh headless node
//!
//! Terminal runner for the mesh engine: starts scanning, prints every
//! event stream, and accepts send commands on stdin. Any richer
//! presentation layer subscribes to the same streams this binary does.

use anyhow::Result;
use log::info;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use embermesh::{BtleplugRadio, JsonFileStore, MeshService};

const DEFAULT_STORE_PATH: &str = "embermesh.json";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let store_path =
        std::env::var("EMBERMESH_STORE").unwrap_or_else(|_| DEFAULT_STORE_PATH.to_string());
    let store = Arc::new(JsonFileStore::open(&store_path)?);
    let radio = Arc::new(BtleplugRadio::new());

    let service = Arc::new(MeshService::new(radio, store)?);

    info!("=== embermesh: decentralized BLE mesh messaging ===");
    println!(
        "node {}  friend code {}  nickname {}",
        service.identity().node_id,
        service.my_friend_code(),
        service.peer_manager().own_nickname().await,
    );
    println!("commands: <text> | /sos <text> | /dm <code> <text> | /add <code> | /name <nick> | /peers | /log | /status | /quit");

    spawn_printers(&service);
    service.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = run_command(&service, line).await {
            eprintln!("error: {e:#}");
        }
        if line == "/quit" {
            break;
        }
    }

    service.stop().await?;
    Ok(())
}

async fn run_command(service: &Arc<MeshService>, line: &str) -> Result<()> {
    match line.split_once(' ') {
        _ if line == "/quit" => Ok(()),
        _ if line == "/peers" => {
            for peer in service.peer_manager().online_peers() {
                println!(
                    "  {:04X}  {:<12}  recv {:<4} relayed {:<4} {}",
                    peer.hash,
                    peer.display_name(),
                    peer.recv_count,
                    peer.relay_count,
                    if peer.is_direct_neighbor { "direct" } else { "" },
                );
            }
            Ok(())
        }
        _ if line == "/log" => {
            for message in service.router().message_log().recent(20).await {
                println!(
                    "  {}  {}: {}",
                    message.received_at.format("%H:%M:%S"),
                    message.sender_display_name(),
                    message.content,
                );
            }
            Ok(())
        }
        _ if line == "/status" => {
            println!("{}", serde_json::to_string_pretty(&service.status().await)?);
            Ok(())
        }
        Some(("/sos", text)) => {
            let id = service.send_sos(text).await?;
            println!("sos {id} sent");
            Ok(())
        }
        Some(("/dm", rest)) => {
            let (code, text) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("usage: /dm <code> <text>"))?;
            let id = service.send_direct(code, text).await?;
            println!("direct {id} sent to {code}");
            Ok(())
        }
        Some(("/add", code)) => {
            service.add_friend(code.trim()).await?;
            println!("friend request sent to {}", code.trim());
            Ok(())
        }
        Some(("/name", nick)) => {
            service.set_nickname(nick).await?;
            println!("nickname set to {}", nick.trim());
            Ok(())
        }
        _ if line.starts_with('/') => {
            anyhow::bail!("unknown command: {line}");
        }
        _ => {
            let id = service.send_message(line).await?;
            println!("message {id} sent");
            Ok(())
        }
    }
}

/// Print every event stream as it arrives.
fn spawn_printers(service: &Arc<MeshService>) {
    let events = service.events();

    let mut messages = events.subscribe_messages();
    tokio::spawn(async move {
        while let Ok(message) = messages.recv().await {
            let tag = if message.is_sos() { "SOS" } else { "msg" };
            let hops = if message.was_relayed {
                format!(" (via {} hops)", message.hop_count)
            } else {
                String::new()
            };
            println!(
                "[{tag}] {}: {}{hops}",
                message.sender_display_name(),
                message.content
            );
        }
    });

    let mut directed = events.subscribe_directed();
    tokio::spawn(async move {
        while let Ok(message) = directed.recv().await {
            println!("[dm] {}: {}", message.sender_display_name(), message.content);
        }
    });

    let mut friend_requests = events.subscribe_friend_requests();
    tokio::spawn(async move {
        while let Ok(request) = friend_requests.recv().await {
            println!(
                "[friend request] {} ({}), reply with /add {}",
                request.nickname, request.friend_code, request.friend_code
            );
        }
    });

    let mut friend_codes = events.subscribe_friend_codes();
    tokio::spawn(async move {
        while let Ok(discovery) = friend_codes.recv().await {
            log::debug!(
                "learned friend code {} for {:04X}",
                discovery.friend_code,
                discovery.sender_hash
            );
        }
    });

    let mut errors = events.subscribe_errors();
    tokio::spawn(async move {
        while let Ok(error) = errors.recv().await {
            eprintln!("[engine] {error}");
        }
    });

    let mut status = events.subscribe_status();
    tokio::spawn(async move {
        while let Ok(status) = status.recv().await {
            println!("[status] {status}");
        }
    });
}

//! End-to-end scenarios driving two `Orchestrator`s over a real (but
//! local) TCP transport, relayed through a fake SOCKS5 proxy that stands
//! in for the Tor daemon: it accepts the same `CONNECT` handshake
//! `transport::socks5` speaks and forwards bytes to whichever local port
//! a test registered for the requested "onion" domain, instead of
//! resolving it through the real Tor network.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use onionpost::contact::Contact;
use onionpost::orchestrator::{Identity, Orchestrator};
use onionpost::outbox::STATUS_DELIVERED;
use onionpost::transport::Transport;
use onionpost::{Config, Storage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Minimal SOCKS5 CONNECT relay. Reads the same wire bytes
/// `transport::socks5::connect_socks5` writes, looks the requested
/// domain up in a static routing table, dials the mapped local port,
/// and then pipes bytes bidirectionally.
async fn spawn_fake_socks5_proxy(routes: HashMap<String, u16>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let _ = handle_socks5_client(socket, &routes).await;
            });
        }
    });

    local_addr
}

async fn handle_socks5_client(
    mut client: TcpStream,
    routes: &HashMap<String, u16>,
) -> std::io::Result<()> {
    let mut greeting = [0u8; 3];
    client.read_exact(&mut greeting).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut head = [0u8; 4];
    client.read_exact(&mut head).await?;
    let mut len_byte = [0u8; 1];
    client.read_exact(&mut len_byte).await?;
    let mut domain = vec![0u8; len_byte[0] as usize];
    client.read_exact(&mut domain).await?;
    let mut port_bytes = [0u8; 2];
    client.read_exact(&mut port_bytes).await?;

    let domain = String::from_utf8_lossy(&domain).to_string();
    let Some(&target_port) = routes.get(&domain) else {
        client.write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    };

    let mut upstream = TcpStream::connect(("127.0.0.1", target_port)).await?;
    client.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0]).await?;

    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

fn make_identity(onion: &str) -> Identity {
    let (signing_key, signing_pubkey) = onionpost::generate_signing_keypair();
    let (x25519_pub, x25519_priv) = onionpost::generate_static_keypair();
    Identity { signing_key, signing_pubkey, x25519_priv, x25519_pub, onion_address: onion.to_string() }
}

/// Bind an `Orchestrator` on a local port and start feeding its listener's
/// inbound frames into `handle_inbound_frame` for the rest of the test.
async fn bind_orchestrator(onion: &str, port: u16, proxy_addr: &str) -> (Arc<Orchestrator>, Identity) {
    let identity = make_identity(onion);
    let returned_identity = Identity {
        signing_key: identity.signing_key.clone(),
        signing_pubkey: identity.signing_pubkey,
        x25519_priv: identity.x25519_priv,
        x25519_pub: identity.x25519_pub,
        onion_address: identity.onion_address.clone(),
    };

    let storage = Storage::open_in_memory().unwrap();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let (transport, mut rx) = Transport::bind(addr, proxy_addr.to_string()).await.unwrap();
    let orchestrator = Arc::new(Orchestrator::new(storage, Config::default(), transport, identity));

    let feed = orchestrator.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let _ = feed.handle_inbound_frame(frame, NOW).await;
        }
    });

    (orchestrator, returned_identity)
}

const NOW: i64 = 1_700_000_000;

#[tokio::test]
async fn direct_message_round_trips_ping_pong_message_ack() {
    let bob_port = 19202;

    let mut routes = HashMap::new();
    routes.insert("bob.onion".to_string(), bob_port);
    let proxy_addr = spawn_fake_socks5_proxy(routes).await.to_string();

    let (bob, bob_identity) = bind_orchestrator("bob.onion", bob_port, "unused:0").await;
    let (alice, alice_identity) = bind_orchestrator("alice.onion", 19201, &proxy_addr).await;

    alice
        .add_contact(&Contact::new(
            1,
            "bob",
            "bob.onion",
            bob_identity.signing_pubkey,
            bob_identity.x25519_pub,
            NOW,
        ))
        .await
        .unwrap();
    bob.add_contact(&Contact::new(
        1,
        "alice",
        "alice.onion",
        alice_identity.signing_pubkey,
        alice_identity.x25519_pub,
        NOW,
    ))
    .await
    .unwrap();

    let message_id = alice.send(1, b"hello bob", NOW).await.unwrap();
    // drive_send blocks on the full PING -> ACK_PING -> PONG -> MESSAGE ->
    // ACK_MESSAGE exchange itself, so the outbox row is already DELIVERED
    // by the time it returns.
    alice.drive_send(&message_id, NOW, bob_port).await.unwrap();

    let status = alice.outbox_status(&message_id).await.unwrap().unwrap();
    assert_eq!(status, STATUS_DELIVERED);
}

//! Echo round trip between two buses over loopback TCP.
//!
//! ```text
//! cargo run --example echo
//! RUST_LOG=debug cargo run --example echo
//! ```
//!
//! The server bus mounts `echo` and answers every message back to its
//! sender. The client bus dials in, sends one message to `echo` and waits
//! for the reply on `inbox`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bustcp::{
    handler, Address, Bus, Envelope, LocalBus, TcpTransport, TransportConfig,
    DEFAULT_CLIENT_ROUTE, DEFAULT_SERVER_PREFIX,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = TransportConfig::load(None)?;

    let server_bus = Arc::new(LocalBus::new());
    let echo_bus = Arc::clone(&server_bus);
    server_bus.mount(
        Address::from(["echo"]),
        handler(move |delivery| {
            log::info!("[Echo] {} says {}", delivery.envelope.from, delivery.envelope.body);
            echo_bus.send(
                Envelope::new(delivery.envelope.from.clone())
                    .with_from(["echo"])
                    .with_body(delivery.envelope.body.clone()),
            );
        }),
    );

    let server = TcpTransport::with_config(server_bus, config.clone())?;
    let listener = server
        .listen([DEFAULT_SERVER_PREFIX], 0, Some("127.0.0.1"))
        .await?;

    let client_bus = Arc::new(LocalBus::new());
    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    client_bus.mount(
        Address::from(["inbox"]),
        handler(move |delivery| {
            let _ = replies_tx.send(delivery.envelope.clone());
        }),
    );

    let client = TcpTransport::with_config(Arc::clone(&client_bus) as Arc<dyn Bus>, config)?;
    let mut dialer = client.connect([DEFAULT_CLIENT_ROUTE], listener.port(), Some("127.0.0.1"));
    dialer.wait_connected().await?;

    client_bus.send(
        Envelope::new([DEFAULT_CLIENT_ROUTE, "echo"])
            .with_from(["inbox"])
            .with_body("hello over tcp"),
    );

    let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await
        .context("no reply within 5s")?
        .context("reply channel closed")?;
    log::info!("[Echo] reply from {}: {}", reply.from, reply.body);

    dialer.end();
    while let Some(event) = dialer.next_event().await {
        log::info!("[Echo] dialer event: {event:?}");
    }
    listener.close().await;
    Ok(())
}

//! Secure file transfer server
//!
//! Accepts TCP connections, reads one fixed 23-byte request header per
//! request, then the declared payload, dispatches it through
//! `transfer_common::dispatcher`, and writes back the response (if any).

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use transfer_common::codec::{REQUEST_HEADER_SIZE, RequestHeader};
use transfer_common::{FileStore, PersistentState, PROTOCOL_VERSION, dispatcher};

const DATABASE_FILE: &str = "clients.db";
const STORAGE_ROOT: &str = "transferred_files";
const PORT_FILE: &str = "port.info";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("==============================================");
    info!("   Secure File Transfer Server v{}", env!("CARGO_PKG_VERSION"));
    info!("==============================================");

    let port = config::ServerConfig::load(PORT_FILE).port;
    let database_url = format!("sqlite://{DATABASE_FILE}?mode=rwc");

    info!("Opening persistent state at {database_url}");
    let state = Arc::new(PersistentState::open(&database_url).await?);
    let store = Arc::new(FileStore::new(STORAGE_ROOT));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {addr}");
    info!("==============================================");

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!(%peer, "new connection");
                let state = Arc::clone(&state);
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(socket, &state, &store).await {
                        warn!(%peer, %err, "connection closed with error");
                    }
                });
            }
            Err(err) => {
                error!(%err, "failed to accept connection");
            }
        }
    }
}

/// Serve requests on a single connection until the client disconnects or
/// an I/O error occurs.
async fn handle_connection(
    mut socket: TcpStream,
    state: &PersistentState,
    store: &FileStore,
) -> Result<()> {
    loop {
        let mut header_buf = [0u8; REQUEST_HEADER_SIZE];
        match socket.read_exact(&mut header_buf).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let header = RequestHeader::decode(&header_buf)?;

        let mut payload = vec![0u8; header.payload_size as usize];
        socket.read_exact(&mut payload).await?;

        let response = dispatcher::dispatch(&header, &payload, state, store).await;
        if let Some(response) = response {
            socket
                .write_all(&response.encode(PROTOCOL_VERSION))
                .await?;
            socket.flush().await?;
        }
    }
}

// src/ws.rs
use crate::types::{IncomingMessage, NfcCommand, OutgoingMessage};
use crossbeam_channel::Sender;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use warp::Filter;

pub async fn start_server(
    nfc_cmd_tx: Sender<NfcCommand>,
    mut nfc_event_rx: broadcast::Receiver<OutgoingMessage>,
    bind_addr: SocketAddr,
) {
    // Shared broadcast channel for WS clients
    let (ws_tx, _) = broadcast::channel::<OutgoingMessage>(32);
    let ws_tx = Arc::new(ws_tx);

    // NFC events -> all WS clients
    let ws_tx_clone = ws_tx.clone();
    tokio::spawn(async move {
        loop {
            match nfc_event_rx.recv().await {
                Ok(msg) => {
                    let _ = ws_tx_clone.send(msg);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} NFC events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let ws_route = warp::path::end()
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let nfc_cmd_tx = nfc_cmd_tx.clone();
            let ws_tx = ws_tx.clone();
            ws.on_upgrade(move |socket| handle_connection(socket, nfc_cmd_tx, ws_tx))
        });

    let routes = ws_route.with(warp::cors().allow_any_origin());

    info!("WebSocket server running on ws://{}", bind_addr);
    warp::serve(routes).run(bind_addr).await;
}

/// Parses one client text frame into a command for the NFC thread.
pub fn parse_command(text: &str) -> Result<NfcCommand, serde_json::Error> {
    serde_json::from_str::<IncomingMessage>(text).map(NfcCommand::from)
}

async fn handle_connection(
    ws: warp::ws::WebSocket,
    nfc_cmd_tx: Sender<NfcCommand>,
    ws_tx: Arc<broadcast::Sender<OutgoingMessage>>,
) {
    let (mut client_ws_tx, mut client_ws_rx) = ws.split();
    let mut rx_broadcast = ws_tx.subscribe();

    // Broadcasts -> client
    tokio::spawn(async move {
        while let Ok(msg) = rx_broadcast.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Couldn't encode {:?}: {}", msg, e);
                    continue;
                }
            };
            if client_ws_tx
                .send(warp::ws::Message::text(json))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Client -> NFC thread
    while let Some(result) = client_ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!("WebSocket closed: {}", e);
                break;
            }
        };
        let Ok(text) = msg.to_str() else {
            continue;
        };
        match parse_command(text) {
            Ok(cmd) => {
                debug!("Client command {:?}", cmd);
                let _ = nfc_cmd_tx.send(cmd);
            }
            Err(e) => {
                warn!("Ignoring malformed message: {}", e);
                let _ = ws_tx.send(OutgoingMessage::Error {
                    error: format!("malformed message: {e}"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_frames() {
        assert_eq!(
            parse_command(r#"{"type":"GET_READER_STATUS"}"#).unwrap(),
            NfcCommand::CheckReaderStatus
        );
        assert_eq!(
            parse_command(r#"{"type":"DISARM"}"#).unwrap(),
            NfcCommand::Arm(false)
        );
        assert!(parse_command(r#"{"type":"SELECT_IMAGE"}"#).is_err());
        assert!(parse_command("not json").is_err());
    }
}

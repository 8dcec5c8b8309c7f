// src/main.rs
use std::sync::Arc;

use amiibo_nfc::config::ServiceConfig;
use amiibo_nfc::keys::KeyBundle;
use amiibo_nfc::library::ImageLibrary;
use amiibo_nfc::nfc_service::{self, ServiceState};
use amiibo_nfc::types::{NfcCommand, OutgoingMessage};
use amiibo_nfc::ws;
use crossbeam_channel::unbounded;
use log::{error, info};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() {
    env_logger::init();
    info!("Starting Amiibo NFC Service...");

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let keys = match KeyBundle::load(&config.keys_path) {
        Ok(keys) => Arc::new(keys),
        Err(e) => {
            error!("Couldn't load keys from {}: {}", config.keys_path.display(), e);
            std::process::exit(1);
        }
    };
    let state = ServiceState::new(keys, ImageLibrary::new(&config.image_dir));

    // WS -> NFC. Crossbeam, because the NFC thread blocks.
    let (cmd_tx, cmd_rx) = unbounded::<NfcCommand>();

    // NFC -> WS clients
    let (event_tx, event_rx) = broadcast::channel::<OutgoingMessage>(100);

    std::thread::spawn(move || {
        let (bridge_tx, bridge_rx) = unbounded::<OutgoingMessage>();

        std::thread::spawn(move || {
            nfc_service::run(state, bridge_tx, cmd_rx);
        });

        while let Ok(msg) = bridge_rx.recv() {
            let _ = event_tx.send(msg);
        }
    });

    ws::start_server(cmd_tx, event_rx, config.bind_addr).await;
}

//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates the application's state
//! and manages the lifecycle of all its concurrent services.

use crate::{
    api::ApiServer,
    config::Config,
    domain::{Identity, SystemClock},
    engine::{Engine, EngineCommand},
    error::Result,
    keystore::Keystore,
    store::Store,
    transport::{ConnectionEvent, InboundMessage, Transport, TransportCommand},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// The main run loop for the application.
    ///
    /// This function performs the following steps:
    ///   1. Initializes the node's cryptographic identity and loads the
    ///      durable keystore from disk.
    ///   2. Creates the communication channels that link the services.
    ///   3. Spawns each service (`Transport`, `Engine`, and optionally
    ///      `ApiServer`) in its own asynchronous Tokio task.
    ///   4. Waits for a shutdown signal (like Ctrl+C) and gracefully
    ///      terminates all tasks.
    pub async fn run(self) -> Result<()> {
        let identity = Identity::from_file(&self.config.identity_path)?;

        tracing::info!(
            peer = %identity.peer_name,
            listen_addr = %self.config.listen_address,
            "starting node"
        );

        let store = Store::open(&self.config.data_file)?;
        let keystore = Keystore::new(store, Arc::new(SystemClock), identity.peer_name.clone());

        // --- Create Communication Channels ---
        let (transport_command_tx, transport_command_rx) = mpsc::channel::<TransportCommand>(100);
        let (inbound_message_tx, inbound_message_rx) = mpsc::channel::<InboundMessage>(100);
        let (conn_event_tx, conn_event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let (engine_command_tx, engine_command_rx) = mpsc::channel::<EngineCommand>(100);

        // --- Instantiate and Spawn Services ---

        let bootstrap_peers = self.config.seed.into_iter().collect();
        let transport = Transport::new(
            self.config.listen_address,
            bootstrap_peers,
            transport_command_rx,
            inbound_message_tx,
            conn_event_tx,
        )?;
        let transport_task = tokio::spawn(transport.run(self.shutdown_token.clone()));
        tracing::debug!("Transport service spawned.");

        let engine = Engine::new(
            identity,
            self.config.clone(),
            keystore,
            inbound_message_rx,
            conn_event_rx,
            engine_command_rx,
            transport_command_tx,
        );
        let engine_task = tokio::spawn(engine.run(self.shutdown_token.clone()));
        tracing::debug!("Engine service spawned.");

        let api_task = if let Some(rest_config) = self.config.rest.clone() {
            tracing::info!("REST front-end enabled.");
            let api_server = ApiServer::new(rest_config.bind_addr, engine_command_tx);
            Some(tokio::spawn(api_server.run(self.shutdown_token.clone())))
        } else {
            None
        };

        // --- Wait for Shutdown Signal ---
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        // --- Await Service Termination ---
        self.shutdown_token.cancelled().await;

        // The tasks will complete once the shutdown token is cancelled.
        // We await them to ensure they finish cleanly.
        if let Err(e) = transport_task.await {
            tracing::error!(error = ?e, "Transport service task failed");
        }
        if let Err(e) = engine_task.await {
            tracing::error!(error = ?e, "Engine service task failed");
        }
        if let Some(task) = api_task {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "API server task failed");
            }
        }
        tracing::info!("node has shut down gracefully");

        Ok(())
    }
}

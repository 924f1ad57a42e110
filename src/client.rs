//! # Client
//!
//! Wires a [`Network`] to the endpoint and registry extensions.
//!
//! ```rust,no_run
//! use brokerlink::{App, Client, Identifier};
//!
//! # async fn run() -> brokerlink::Result<()> {
//! let app = App::new(Identifier::from_static("com.example", &["app"]));
//! let client = Client::builder(app).build()?;
//! client.run().await
//! # }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::app::App;
use crate::config::NetworkConfig;
use crate::error::Result;
use crate::extension::endpoint::EndpointExtension;
use crate::extension::registry::RegistryExtension;
use crate::network::address::Address;
use crate::network::engine::Network;
use crate::network::token::{MemoryTokenProvider, TokenProvider};
use crate::transport::local::TcpTransport;
use crate::transport::Transport;

pub struct ClientBuilder {
    app: App,
    config: NetworkConfig,
    address: Option<Address>,
    transport: Option<Arc<dyn Transport>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ClientBuilder {
    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the address from the configuration.
    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Defaults to TCP to the configured address.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to an in-memory provider holding no tokens.
    pub fn token_provider(mut self, token_provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(token_provider);
        self
    }

    pub fn build(self) -> Result<Client> {
        self.config.validate_strict()?;
        let address = match self.address {
            Some(address) => address,
            None => self.config.client.to_address()?,
        };
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(TcpTransport::new(
                address.authority(),
                self.config.transport.max_payload_size,
            ))
        });
        let token_provider = self
            .token_provider
            .unwrap_or_else(|| Arc::new(MemoryTokenProvider::new()));

        let network = Network::new(self.app, address, transport, token_provider, self.config)?;
        let endpoints = EndpointExtension::new(&network)?;
        let registries = RegistryExtension::new(&network, &endpoints)?;
        Ok(Client {
            network,
            endpoints,
            registries,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    pub network: Network,
    pub endpoints: EndpointExtension,
    pub registries: RegistryExtension,
}

impl Client {
    pub fn builder(app: App) -> ClientBuilder {
        ClientBuilder {
            app,
            config: NetworkConfig::default(),
            address: None,
            transport: None,
            token_provider: None,
        }
    }

    pub fn app(&self) -> &App {
        self.network.app()
    }

    /// Connect and keep the session alive until it ends for good.
    ///
    /// Reconnects when `client.auto_reconnect` is set in the configuration.
    pub async fn run(&self) -> Result<()> {
        let reconnect = self.network.config().client.auto_reconnect;
        info!(app = %self.app().id, reconnect, "Starting client");
        self.network.connect(reconnect).await
    }

    pub async fn close(&self) {
        self.network.close().await;
    }
}

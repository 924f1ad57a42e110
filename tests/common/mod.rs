//! Scripted in-memory broker shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use brokerlink::core::identifier::Identifier;
use brokerlink::core::packet::Envelope;
use brokerlink::extension::endpoint::packets as endpoint;
use brokerlink::extension::registry::packets as registry;
use brokerlink::network::{Address, MemoryTokenProvider, Network, TokenProvider};
use brokerlink::protocol::handshake::{ServerEncryptionKeys, SessionCipher};
use brokerlink::protocol::packet::{Packet, PacketMapper, PacketType};
use brokerlink::protocol::packets::*;
use brokerlink::transport::memory::{MemoryConnection, MemoryListener, MemoryTransport};
use brokerlink::transport::Connection;
use brokerlink::{App, Client, NetworkConfig};

pub const TOKEN_VALUE: &str = "test-token";
pub const STEP: Duration = Duration::from_secs(5);

pub fn app_id() -> Identifier {
    Identifier::from_static("com.example", &["app"])
}

pub fn app() -> App {
    App::new(app_id())
}

pub fn address() -> Address {
    Address::new("localhost", 26423)
}

pub fn server_mapper() -> PacketMapper {
    let mapper = PacketMapper::new();
    mapper.register(&SERVER_META).unwrap();
    mapper.register(&CONNECT).unwrap();
    mapper.register(&DISCONNECT).unwrap();
    mapper.register(&TOKEN).unwrap();
    mapper.register(&READY).unwrap();
    mapper.register(&endpoint::REGISTER).unwrap();
    mapper.register(&endpoint::INVOKE).unwrap();
    mapper.register(&endpoint::INVOKED).unwrap();
    mapper.register(&endpoint::RESPONSE).unwrap();
    mapper.register(&registry::REGISTER).unwrap();
    mapper.register(&registry::UPDATE).unwrap();
    mapper.register(&registry::LISTEN).unwrap();
    mapper
}

/// Token provider preloaded with [`TOKEN_VALUE`] for the test app, keyed
/// without a server hash.
pub fn tokens() -> Arc<MemoryTokenProvider> {
    let provider = MemoryTokenProvider::new();
    provider.insert(&address(), &app(), TOKEN_VALUE);
    Arc::new(provider)
}

pub fn test_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|config| {
        config.client.address = address().authority();
        config.client.auto_reconnect = true;
    })
}

pub struct Harness {
    pub client: Client,
    pub listener: MemoryListener,
    pub tokens: Arc<MemoryTokenProvider>,
}

pub fn harness_with(app: App, config: NetworkConfig) -> Harness {
    let (transport, listener) = MemoryTransport::new();
    let tokens = tokens();
    tokens.insert(&address(), &app, TOKEN_VALUE);
    let client = Client::builder(app)
        .config(config)
        .address(address())
        .transport(Arc::new(transport))
        .token_provider(Arc::clone(&tokens) as Arc<dyn TokenProvider>)
        .build()
        .expect("client builds");
    Harness {
        client,
        listener,
        tokens,
    }
}

pub fn harness() -> Harness {
    harness_with(app(), test_config())
}

impl Harness {
    pub fn network(&self) -> &Network {
        &self.client.network
    }

    pub async fn accept(&mut self) -> ServerSession {
        let connection = tokio::time::timeout(STEP, self.listener.accept())
            .await
            .expect("client dialed in time")
            .expect("listener open");
        ServerSession::new(connection)
    }
}

/// Server end of one session.
pub struct ServerSession {
    pub connection: MemoryConnection,
    pub mapper: PacketMapper,
    pub cipher: Option<SessionCipher>,
}

impl ServerSession {
    pub fn new(connection: MemoryConnection) -> Self {
        Self {
            connection,
            mapper: server_mapper(),
            cipher: None,
        }
    }

    pub fn meta() -> ServerMeta {
        ServerMeta {
            protocol: ProtocolInfo::default(),
            hash: None,
            encryption: None,
        }
    }

    pub async fn send<T: Send + Sync + 'static>(&self, packet_type: &PacketType<T>, value: &T) {
        let envelope = self.mapper.serialize(packet_type, value).unwrap();
        self.send_envelope(envelope).await;
    }

    pub async fn send_envelope(&self, envelope: Envelope) {
        let envelope = match &self.cipher {
            Some(cipher) => cipher.encrypt(&envelope).unwrap(),
            None => envelope,
        };
        self.connection.send(envelope).await.unwrap();
    }

    /// Next packet from the client; `None` once it closed the stream.
    pub async fn recv(&self) -> Option<Packet> {
        let envelope = tokio::time::timeout(STEP, self.connection.receive())
            .await
            .expect("client sent in time")
            .unwrap()?;
        let envelope = match &self.cipher {
            Some(cipher) => cipher.decrypt(&envelope).unwrap(),
            None => envelope,
        };
        Some(self.mapper.deserialize(&envelope).unwrap())
    }

    pub async fn expect<T: Send + Sync + 'static>(&self, packet_type: &PacketType<T>) -> Arc<T> {
        let packet = self.recv().await.expect("connection open");
        packet
            .downcast(packet_type)
            .unwrap_or_else(|| panic!("expected {packet_type:?}, got {packet:?}"))
    }

    /// Send meta and read the connect packet.
    pub async fn open(&self, meta: &ServerMeta) -> Arc<ConnectPacket> {
        self.send(&SERVER_META, meta).await;
        self.expect(&CONNECT).await
    }

    /// Encrypted variant of [`open`](Self::open); installs the session cipher.
    pub async fn open_encrypted(&mut self, keys: &ServerEncryptionKeys) -> (Arc<ConnectPacket>, Option<String>) {
        let meta = ServerMeta {
            encryption: Some(keys.descriptor()),
            ..Self::meta()
        };
        let connect = self.open(&meta).await;
        let material = connect.encryption.as_ref().expect("client sent material");
        let (cipher, token) = keys.accept(material).unwrap();
        self.cipher = Some(cipher);
        (connect, token)
    }

    /// Read packets until the client's ready, returning what came before it.
    pub async fn until_ready(&self) -> Vec<Packet> {
        let mut before = Vec::new();
        loop {
            let packet = self.recv().await.expect("client sent ready");
            if packet.is(&READY) {
                return before;
            }
            before.push(packet);
        }
    }

    /// Full plaintext handshake up to and including the server's ready.
    pub async fn handshake(&self) -> Vec<Packet> {
        self.open(&Self::meta()).await;
        let before = self.until_ready().await;
        self.send(&READY, &()).await;
        before
    }

    pub async fn disconnect(&self, kind: DisconnectType) {
        self.send(&DISCONNECT, &DisconnectPacket::new(kind, None)).await;
        self.connection.close().await;
    }
}

pub async fn wait_ready(network: &Network) {
    tokio::time::timeout(STEP, network.wait_ready())
        .await
        .expect("ready in time")
        .unwrap();
}

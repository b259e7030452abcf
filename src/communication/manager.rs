use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::channel::Channel;
use super::endpoint::{
    CommunicationEndpoint, EndpointEvent, EndpointEvents, SocketClient, SocketServer, TransportKind,
};
use super::message::{Message, MessageMetadata, HIGHEST_SUPPORTED_VERSION};
use super::serializer::DataSerializer;
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Connected,
    Active,
    Completing,
    Disconnected,
}

enum Endpoint {
    Server(SocketServer),
    Client(SocketClient),
}

/// Session protocol over one endpoint: establish the connection, then send
/// and receive [`Message`]s.
///
/// All operations take `&self`; sends may come from any thread.
pub struct CommunicationManager {
    transport: TransportKind,
    serializer: DataSerializer,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    events: tokio::sync::Mutex<Option<EndpointEvents>>,
    channel: Mutex<Option<Arc<Channel>>>,
    state: Mutex<SessionState>,
    default_version: AtomicI32,
}

impl CommunicationManager {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            serializer: DataSerializer::new(),
            endpoint: Mutex::new(None),
            events: tokio::sync::Mutex::new(None),
            channel: Mutex::new(None),
            state: Mutex::new(SessionState::Unconnected),
            default_version: AtomicI32::new(HIGHEST_SUPPORTED_VERSION),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn mark_completing(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, SessionState::Connected | SessionState::Active) {
            *state = SessionState::Completing;
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.channel).as_ref().is_some_and(|c| c.is_connected())
    }

    /// Bind a host endpoint; returns the bound address for the peer.
    pub async fn host_server(&self, endpoint: &str) -> Result<String> {
        let server = SocketServer::new(self.transport);
        let events = server.subscribe();
        let bound = server.start(endpoint).await?;
        *self.events.lock().await = Some(events);
        *lock(&self.endpoint) = Some(Arc::new(Endpoint::Server(server)));
        *lock(&self.state) = SessionState::Connecting;
        Ok(bound)
    }

    /// Wait until the peer connects to the hosted endpoint.
    pub async fn accept_client_async(&self) -> Result<()> {
        self.await_connection().await
    }

    pub async fn wait_for_client_connection(&self, timeout: Duration) -> bool {
        self.wait_for_connection(timeout).await
    }

    pub async fn setup_client_async(&self, endpoint: &str) -> Result<()> {
        let client = SocketClient::new(self.transport);
        let events = client.subscribe();
        client.start(endpoint).await?;
        *self.events.lock().await = Some(events);
        *lock(&self.endpoint) = Some(Arc::new(Endpoint::Client(client)));
        *lock(&self.state) = SessionState::Connecting;
        Ok(())
    }

    pub async fn wait_for_server_connection(&self, timeout: Duration) -> bool {
        self.wait_for_connection(timeout).await
    }

    pub fn stop_server(&self) {
        self.stop(|e| matches!(e, Endpoint::Server(_)));
    }

    pub fn stop_client(&self) {
        self.stop(|e| matches!(e, Endpoint::Client(_)));
    }

    pub fn send_message(&self, message_type: &str) -> Result<()> {
        let raw = self.serializer.serialize_message(message_type)?;
        self.send_raw_message(raw)
    }

    pub fn send_message_with_payload<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        payload: &T,
        version: i32,
    ) -> Result<()> {
        self.send_message_with_metadata(message_type, payload, &MessageMetadata::with_version(version))
    }

    /// Send with per-call overrides. Without a version the message goes out
    /// at [`default_version`](Self::default_version); with a recipient it is
    /// refused unless that is the connected peer.
    pub fn send_message_with_metadata<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        payload: &T,
        metadata: &MessageMetadata,
    ) -> Result<()> {
        let version = metadata.version.unwrap_or_else(|| self.default_version());
        let raw = self.serializer.serialize_payload(message_type, payload, version)?;
        let channel = self.current_channel()?;
        if let Some(recipient) = metadata.recipient.as_deref() {
            if recipient != channel.peer() {
                return Err(Error::Protocol(format!(
                    "'{}' is addressed to {} but the connected peer is {}.",
                    message_type,
                    recipient,
                    channel.peer()
                )));
            }
        }
        self.send_on(&channel, raw)
    }

    /// Send pre-serialized wire text as-is.
    pub fn send_raw_message(&self, raw: String) -> Result<()> {
        let channel = self.current_channel()?;
        self.send_on(&channel, raw)
    }

    /// Address of the connected peer.
    pub fn peer(&self) -> Option<String> {
        lock(&self.channel).as_ref().map(|c| c.peer().to_string())
    }

    /// Next message, or `None` once the connection has closed.
    pub async fn receive_message_async(&self, cancel: &CancellationToken) -> Result<Option<Message>> {
        match self.receive_raw_message_async(cancel).await? {
            Some(raw) => Ok(Some(self.serializer.deserialize_message(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn receive_raw_message_async(&self, cancel: &CancellationToken) -> Result<Option<String>> {
        let channel = self.current_channel()?;
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("Receive cancelled.".to_string()));
            }
            received = channel.receive() => received,
        };
        match received {
            Ok(Some(raw)) => {
                self.mark_active();
                Ok(Some(raw))
            }
            Ok(None) => {
                *lock(&self.state) = SessionState::Disconnected;
                Ok(None)
            }
            Err(e) => {
                *lock(&self.state) = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    pub fn deserialize_payload<T: DeserializeOwned>(&self, message: &Message) -> Result<T> {
        self.serializer.deserialize_payload(message)
    }

    pub fn serializer(&self) -> &DataSerializer {
        &self.serializer
    }

    /// Version for sends whose metadata carries none. Starts at the highest
    /// supported version; set it to the negotiated one.
    pub fn default_version(&self) -> i32 {
        self.default_version.load(Ordering::SeqCst)
    }

    pub fn set_default_version(&self, version: i32) {
        self.default_version.store(version, Ordering::SeqCst);
    }

    fn current_channel(&self) -> Result<Arc<Channel>> {
        lock(&self.channel).clone().ok_or(Error::NotConnected)
    }

    fn send_on(&self, channel: &Channel, raw: String) -> Result<()> {
        tracing::trace!("Sending to {}: {}", channel.peer(), raw);
        channel.send(raw)?;
        self.mark_active();
        Ok(())
    }

    fn mark_active(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Connected {
            *state = SessionState::Active;
        }
    }

    async fn wait_for_connection(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.await_connection()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Connection failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("No connection within {} ms", timeout.as_millis());
                false
            }
        }
    }

    async fn await_connection(&self) -> Result<()> {
        if lock(&self.channel).is_some() {
            return Ok(());
        }
        let mut events = self.events.lock().await;
        let events = events.as_mut().ok_or(Error::NotConnected)?;
        loop {
            match events.recv().await {
                Some(EndpointEvent::Connected(channel)) => {
                    *lock(&self.channel) = Some(channel);
                    *lock(&self.state) = SessionState::Connected;
                    return Ok(());
                }
                Some(EndpointEvent::Disconnected { error }) => {
                    *lock(&self.state) = SessionState::Disconnected;
                    return Err(Error::ConnectionClosed(
                        error.unwrap_or_else(|| "Peer closed before connecting.".to_string()),
                    ));
                }
                None => return Err(Error::NotConnected),
            }
        }
    }

    fn stop(&self, matches: impl Fn(&Endpoint) -> bool) {
        let endpoint = {
            let mut slot = lock(&self.endpoint);
            if slot.as_deref().is_some_and(&matches) {
                slot.take()
            } else {
                None
            }
        };
        let Some(endpoint) = endpoint else { return };
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
        match endpoint.as_ref() {
            Endpoint::Server(server) => server.stop(),
            Endpoint::Client(client) => client.stop(),
        }
        *lock(&self.state) = SessionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::message_type;

    async fn connected_pair() -> (CommunicationManager, CommunicationManager) {
        let host = CommunicationManager::new(TransportKind::Tcp);
        let bound = host.host_server("127.0.0.1:0").await.unwrap();
        let client = CommunicationManager::new(TransportKind::Tcp);
        client.setup_client_async(&bound).await.unwrap();
        assert!(host.wait_for_client_connection(Duration::from_secs(5)).await);
        assert!(client.wait_for_server_connection(Duration::from_secs(5)).await);
        (host, client)
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let manager = CommunicationManager::new(TransportKind::Tcp);
        assert!(matches!(
            manager.send_message(message_type::SESSION_END),
            Err(Error::NotConnected)
        ));
        assert_eq!(manager.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn test_message_exchange_and_state() {
        let (host, client) = connected_pair().await;
        assert_eq!(host.state(), SessionState::Connected);

        host.send_message_with_payload(message_type::VERSION_CHECK, &7, 1).unwrap();
        assert_eq!(host.state(), SessionState::Active);

        let cancel = CancellationToken::new();
        let message = client.receive_message_async(&cancel).await.unwrap().unwrap();
        assert!(message.is(message_type::VERSION_CHECK));
        let version: i32 = client.deserialize_payload(&message).unwrap();
        assert_eq!(version, 7);
    }

    #[tokio::test]
    async fn test_raw_round_trip() {
        let (host, client) = connected_pair().await;
        client.send_raw_message(r#"{"MessageType":"X"}"#.to_string()).unwrap();
        let raw = host
            .receive_raw_message_async(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(raw.as_deref(), Some(r#"{"MessageType":"X"}"#));
    }

    #[tokio::test]
    async fn test_receive_cancellation_unblocks() {
        let (host, _client) = connected_pair().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let err = host.receive_message_async(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_wait_times_out_without_peer() {
        let host = CommunicationManager::new(TransportKind::Tcp);
        host.host_server("127.0.0.1:0").await.unwrap();
        assert!(!host.wait_for_client_connection(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_peer_stop_ends_receive() {
        let (host, client) = connected_pair().await;
        client.stop_client();
        let received = host
            .receive_message_async(&CancellationToken::new())
            .await
            .unwrap();
        assert!(received.is_none());
        assert_eq!(host.state(), SessionState::Disconnected);
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_metadata_without_version_uses_default() {
        let (host, client) = connected_pair().await;
        host.set_default_version(4);
        host.send_message_with_metadata(message_type::SESSION_MESSAGE, &"hi", &MessageMetadata::default())
            .unwrap();
        host.send_message_with_metadata(message_type::SESSION_MESSAGE, &"hi", &MessageMetadata::with_version(2))
            .unwrap();

        let cancel = CancellationToken::new();
        let first = client.receive_message_async(&cancel).await.unwrap().unwrap();
        assert_eq!(first.version, 4);
        let second = client.receive_message_async(&cancel).await.unwrap().unwrap();
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn test_metadata_recipient_must_be_peer() {
        let (host, client) = connected_pair().await;
        let stranger = MessageMetadata {
            recipient: Some("10.9.8.7:1".to_string()),
            ..MessageMetadata::default()
        };
        let err = host
            .send_message_with_metadata(message_type::SESSION_MESSAGE, &"hi", &stranger)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let addressed = MessageMetadata {
            recipient: host.peer(),
            ..MessageMetadata::default()
        };
        host.send_message_with_metadata(message_type::SESSION_MESSAGE, &"hi", &addressed)
            .unwrap();
        let received = client
            .receive_message_async(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(received.is(message_type::SESSION_MESSAGE));
    }
}

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::channel::Channel;
use crate::{Error, Result};

const CONNECT_RETRY: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionRole {
    /// Listens and waits for the peer.
    Host,
    /// Connects to a listening peer.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    Tcp,
    UnixSocket,
}

impl TransportKind {
    /// Address to bind when the caller has no preference.
    pub fn default_endpoint(&self) -> String {
        match self {
            TransportKind::Tcp => "127.0.0.1:0".to_string(),
            TransportKind::UnixSocket => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                std::env::temp_dir()
                    .join(format!("vstest-{}.sock", &id[..12]))
                    .to_string_lossy()
                    .into_owned()
            }
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "unix" => Ok(TransportKind::UnixSocket),
            other => Err(Error::InvalidArgument(format!(
                "Unknown transport '{}'. Expected 'tcp' or 'unix'.",
                other
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::UnixSocket => write!(f, "unix"),
        }
    }
}

/// How a testhost reaches (or is reached by) its orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestHostConnectionInfo {
    pub endpoint: String,
    pub role: ConnectionRole,
    pub transport: TransportKind,
}

#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Connected(Arc<Channel>),
    /// Connection lost without a local `stop()`. `error` is `None` when the
    /// peer closed the stream.
    Disconnected { error: Option<String> },
}

pub type EndpointEvents = mpsc::UnboundedReceiver<EndpointEvent>;

/// Fan-out of endpoint events. A dropped receiver is unsubscribed on the
/// next emit.
#[derive(Clone, Default)]
pub(crate) struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<EndpointEvent>>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> EndpointEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: EndpointEvent) {
        lock(&self.subscribers).retain(|s| s.send(event.clone()).is_ok());
    }
}

pub trait CommunicationEndpoint: Send + Sync {
    /// Start listening or connecting; returns the address actually in use.
    fn start(&self, address: &str) -> impl Future<Output = Result<String>> + Send;

    /// Tear down without raising `Disconnected`.
    fn stop(&self);

    fn subscribe(&self) -> EndpointEvents;
}

/// Host role: binds, accepts a single peer.
pub struct SocketServer {
    transport: TransportKind,
    bus: EventBus,
    shutdown: CancellationToken,
    socket_path: Mutex<Option<PathBuf>>,
}

impl SocketServer {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            bus: EventBus::default(),
            shutdown: CancellationToken::new(),
            socket_path: Mutex::new(None),
        }
    }
}

impl CommunicationEndpoint for SocketServer {
    async fn start(&self, address: &str) -> Result<String> {
        let bus = self.bus.clone();
        let shutdown = self.shutdown.clone();

        match self.transport {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(address).await?;
                let bound = listener.local_addr()?.to_string();
                tracing::info!("Listening for testhost on tcp://{}", bound);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                let _ = stream.set_nodelay(true);
                                tracing::info!("Accepted connection from {}", peer);
                                let channel = Channel::spawn(stream, peer.to_string(), bus.clone(), &shutdown);
                                bus.emit(EndpointEvent::Connected(channel));
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                bus.emit(EndpointEvent::Disconnected { error: Some(e.to_string()) });
                            }
                        },
                    }
                });
                Ok(bound)
            }
            TransportKind::UnixSocket => {
                // Remove stale socket
                let _ = std::fs::remove_file(address);
                let listener = UnixListener::bind(address)?;
                *lock(&self.socket_path) = Some(PathBuf::from(address));
                tracing::info!("Listening for testhost on {}", address);
                let peer = address.to_string();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                tracing::info!("Accepted connection on {}", peer);
                                let channel = Channel::spawn(stream, peer, bus.clone(), &shutdown);
                                bus.emit(EndpointEvent::Connected(channel));
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                bus.emit(EndpointEvent::Disconnected { error: Some(e.to_string()) });
                            }
                        },
                    }
                });
                Ok(address.to_string())
            }
        }
    }

    fn stop(&self) {
        self.shutdown.cancel();
        if let Some(path) = lock(&self.socket_path).take() {
            let _ = std::fs::remove_file(path);
        }
    }

    fn subscribe(&self) -> EndpointEvents {
        self.bus.subscribe()
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Client role: connects to a listening host, retrying until it is up or
/// the client is stopped.
pub struct SocketClient {
    transport: TransportKind,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl SocketClient {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            bus: EventBus::default(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl CommunicationEndpoint for SocketClient {
    async fn start(&self, address: &str) -> Result<String> {
        let bus = self.bus.clone();
        let shutdown = self.shutdown.clone();
        let transport = self.transport;
        let target = address.to_string();

        tokio::spawn(async move {
            loop {
                let attempt = match transport {
                    TransportKind::Tcp => TcpStream::connect(&target).await.map(|stream| {
                        let _ = stream.set_nodelay(true);
                        Channel::spawn(stream, target.clone(), bus.clone(), &shutdown)
                    }),
                    TransportKind::UnixSocket => UnixStream::connect(&target)
                        .await
                        .map(|stream| Channel::spawn(stream, target.clone(), bus.clone(), &shutdown)),
                };
                match attempt {
                    Ok(channel) => {
                        if shutdown.is_cancelled() {
                            channel.close();
                            return;
                        }
                        tracing::info!("Connected to {}://{}", transport, target);
                        bus.emit(EndpointEvent::Connected(channel));
                        return;
                    }
                    Err(e) => tracing::debug!("Connect to {} failed, retrying: {}", target, e),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(CONNECT_RETRY) => {}
                }
            }
        });

        Ok(address.to_string())
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }

    fn subscribe(&self) -> EndpointEvents {
        self.bus.subscribe()
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_channel(events: &mut EndpointEvents) -> Arc<Channel> {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(EndpointEvent::Connected(channel))) => channel,
            other => panic!("expected Connected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_server_and_client_connect() {
        let server = SocketServer::new(TransportKind::Tcp);
        let mut server_events = server.subscribe();
        let bound = server.start("127.0.0.1:0").await.unwrap();
        assert!(!bound.ends_with(":0"));

        let client = SocketClient::new(TransportKind::Tcp);
        let mut client_events = client.subscribe();
        client.start(&bound).await.unwrap();

        let host_side = next_channel(&mut server_events).await;
        let client_side = next_channel(&mut client_events).await;
        client_side.send("hello".into()).unwrap();
        assert_eq!(host_side.receive().await.unwrap().as_deref(), Some("hello"));
        host_side.send("world".into()).unwrap();
        assert_eq!(client_side.receive().await.unwrap().as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_unix_socket_server_and_client_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let address = path.to_string_lossy().into_owned();

        let server = SocketServer::new(TransportKind::UnixSocket);
        let mut server_events = server.subscribe();
        assert_eq!(server.start(&address).await.unwrap(), address);

        let client = SocketClient::new(TransportKind::UnixSocket);
        let mut client_events = client.subscribe();
        client.start(&address).await.unwrap();

        let host_side = next_channel(&mut server_events).await;
        let client_side = next_channel(&mut client_events).await;
        client_side.send("over unix".into()).unwrap();
        assert_eq!(host_side.receive().await.unwrap().as_deref(), Some("over unix"));

        server.stop();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_client_disconnect_raises_event_on_server() {
        let server = SocketServer::new(TransportKind::Tcp);
        let mut events = server.subscribe();
        let bound = server.start("127.0.0.1:0").await.unwrap();

        let client = SocketClient::new(TransportKind::Tcp);
        let mut client_events = client.subscribe();
        client.start(&bound).await.unwrap();
        let _host_side = next_channel(&mut events).await;
        let client_side = next_channel(&mut client_events).await;

        client_side.close();
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(EndpointEvent::Disconnected { .. })) => {}
            other => panic!("expected Disconnected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_retries_until_server_is_up() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = reserved.local_addr().unwrap().to_string();
        drop(reserved);

        let client = SocketClient::new(TransportKind::Tcp);
        let mut client_events = client.subscribe();
        client.start(&address).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let server = SocketServer::new(TransportKind::Tcp);
        let mut server_events = server.subscribe();
        server.start(&address).await.unwrap();

        next_channel(&mut server_events).await;
        next_channel(&mut client_events).await;
    }

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("tcp".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("unix".parse::<TransportKind>().unwrap(), TransportKind::UnixSocket);
        assert!("pipe".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::UnixSocket.to_string(), "unix");
    }

    #[test]
    fn test_dropped_subscriber_is_removed() {
        let bus = EventBus::default();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.emit(EndpointEvent::Disconnected { error: None });
        assert_eq!(lock(&bus.subscribers).len(), 1);
        drop(kept);
    }
}

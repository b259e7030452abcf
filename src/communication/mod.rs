//! Length-prefixed JSON messaging between the orchestrator and its child
//! processes.

mod channel;
mod endpoint;
mod framing;
mod manager;
mod message;
mod serializer;

pub use channel::Channel;
pub use endpoint::{
    CommunicationEndpoint, ConnectionRole, EndpointEvent, EndpointEvents, SocketClient,
    SocketServer, TestHostConnectionInfo, TransportKind,
};
pub use framing::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use manager::{CommunicationManager, SessionState};
pub use message::{
    message_type, Message, MessageMetadata, HIGHEST_SUPPORTED_VERSION, UNVERSIONED_MAX,
};
pub use serializer::DataSerializer;

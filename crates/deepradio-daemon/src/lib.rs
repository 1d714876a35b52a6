pub mod controller;
pub mod core;
pub mod error;
pub mod focus;
pub mod http;
pub mod metadata;
pub mod mpv;
pub mod poller;
pub mod prebuffer;
pub mod primitive;
pub mod socket;
pub mod surface;

use deepradio_proto::protocol::SongMetadata;

/// Fan-out from the core to every connected client.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    MetadataUpdated(SongMetadata),
    Log(String),
}

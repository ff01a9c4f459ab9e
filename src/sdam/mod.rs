pub(crate) mod description;
mod monitor;
pub mod public;
mod server;
mod topology;

pub(crate) use self::{
    description::{
        server::{ServerDescription, ServerType, TopologyVersion},
        topology::{
            server_selection::SelectedServer,
            TopologyDescription,
            TopologyType,
        },
    },
    monitor::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    server::Server,
    topology::{
        HandshakePhase,
        Topology,
        TopologyUpdater,
        TopologyWatcher,
        UpdateMessage,
        UpdateReceiver,
    },
};

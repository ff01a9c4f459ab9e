use std::{borrow::Cow, fmt, time::Duration};

use bson::DateTime;

pub use crate::sdam::description::{server::ServerType, topology::TopologyType};
use crate::{
    hello::HelloCommandResponse,
    options::ServerAddress,
    selection_criteria::TagSet,
};

/// A view into the properties of a given server, as observed by the most recent heartbeat.
#[derive(Clone)]
pub struct ServerInfo<'a> {
    pub(crate) description: Cow<'a, crate::sdam::description::server::ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(
        description: &'a crate::sdam::description::server::ServerDescription,
    ) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    fn command_response_getter<T>(
        &'a self,
        f: impl Fn(&'a HelloCommandResponse) -> Option<T>,
    ) -> Option<T> {
        self.description
            .reply
            .as_ref()
            .ok()
            .and_then(|reply| reply.as_ref().and_then(|r| f(&r.command_response)))
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// from the driver to the server.
    ///
    /// This is the value that the driver uses internally to determine the latency window as
    /// part of server selection.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the driver's monitoring thread for the server updated the
    /// internal information about the server.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the maximum wire version that the server supports.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.command_response_getter(|r| r.max_wire_version)
    }

    /// Gets the minimum wire version that the server supports.
    pub fn min_wire_version(&self) -> Option<i32> {
        self.command_response_getter(|r| r.min_wire_version)
    }

    /// Gets the name of the replica set that the server is part of.
    pub fn replica_set_name(&self) -> Option<&str> {
        self.command_response_getter(|r| r.set_name.as_deref())
    }

    /// Gets the version of the replica set config.
    pub fn replica_set_version(&self) -> Option<i32> {
        self.command_response_getter(|r| r.set_version)
    }

    /// Get the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags associated with the server.
    pub fn tags(&self) -> Option<&TagSet> {
        self.command_response_getter(|r| r.tags.as_ref())
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type()
        )?;

        match self.description.reply {
            Ok(_) => {
                if let Some(avg_rtt) = self.average_round_trip_time() {
                    write!(f, ", Average RTT: {:?}", avg_rtt)?;
                }

                if let Some(last_update_time) = self.last_update_time() {
                    write!(f, ", Last Updated: {}", last_update_time)?;
                }

                if let Some(max_wire_version) = self.max_wire_version() {
                    write!(f, ", Max Wire Version: {}", max_wire_version)?;
                }

                if let Some(min_wire_version) = self.min_wire_version() {
                    write!(f, ", Min Wire Version: {}", min_wire_version)?;
                }

                if let Some(set_name) = self.replica_set_name() {
                    write!(f, ", Replica Set Name: {}", set_name)?;
                }

                if let Some(set_version) = self.replica_set_version() {
                    write!(f, ", Replica Set Version: {}", set_version)?;
                }

                if let Some(tags) = self.tags() {
                    write!(f, ", Tags: {:?}", tags)?;
                }
            }
            Err(ref e) => {
                write!(f, ", Error: {}", e)?;
            }
        }

        write!(f, " }}")
    }
}

impl fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A description of the most up-to-date information known about a server, published in server
/// discovery and monitoring events.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    pub(crate) description: crate::sdam::description::server::ServerDescription,
}

impl ServerDescription {
    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// A view of the rest of this server's properties.
    pub fn info(&self) -> ServerInfo<'_> {
        ServerInfo::new_borrowed(&self.description)
    }
}

/// A description of the most up-to-date information known about a topology, published in server
/// discovery and monitoring events.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub(crate) description: crate::sdam::description::topology::TopologyDescription,
}

impl TopologyDescription {
    /// Gets the type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.description.topology_type
    }

    /// Gets the replica set name of the topology, if any.
    pub fn set_name(&self) -> Option<&str> {
        self.description.set_name.as_deref()
    }

    /// The wire-version compatibility error between the driver and the deployment, if any.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.description.compatibility_error.as_deref()
    }

    /// Gets the descriptions of the servers in the topology.
    pub fn servers(&self) -> Vec<ServerDescription> {
        self.description
            .servers
            .values()
            .map(|description| ServerDescription {
                description: description.clone(),
            })
            .collect()
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.description, f)
    }
}

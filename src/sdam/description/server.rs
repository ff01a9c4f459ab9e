use std::time::Duration;

use bson::{bson, Bson};
use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, DateTime},
    client::session::ClusterTime,
    error::{Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::TagSet,
};

pub(crate) const DRIVER_MIN_DB_VERSION: &str = "4.0";
pub(crate) const DRIVER_MIN_WIRE_VERSION: i32 = 7;
pub(crate) const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A lone server not participating in replication.
    Standalone,

    /// The query router of a sharded deployment.
    Mongos,

    /// The writable member of a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A replicating, readable member of a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A replica set member that votes in elections but holds no data.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// A replica set member in some non-serving state: hidden, starting up, or recovering.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set, or one that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load balancer fronting the deployment.
    LoadBalancer,

    /// A server the driver has not managed to describe yet.
    #[serde(alias = "PossiblePrimary")]
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether servers of this type hold data and can therefore serve reads and writes.
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    /// Whether the driver has a usable description of this server at all.
    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// The (processId, counter) pair servers attach to hello replies and state-change errors so
/// that clients can tell fresh information from stale.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopologyVersion {
    pub(crate) process_id: ObjectId,
    pub(crate) counter: i64,
}

impl From<TopologyVersion> for Bson {
    fn from(tv: TopologyVersion) -> Self {
        bson!({
            "processId": tv.process_id,
            "counter": tv.counter
        })
    }
}

/// An immutable snapshot of everything the driver knows about one server, produced by
/// monitor heartbeats (and by error handling, for the transition to Unknown).
///
/// The `reply` field holds one of three states: `Ok(Some(_))` once the server has been
/// heard from, `Ok(None)` for a member the driver knows about but has not checked yet, and
/// `Err(_)` when the most recent contact failed. Storing a `Result` directly makes the
/// invalid "reply and error at the same time" state unrepresentable, and lets the
/// reply-derived accessors below surface a check failure with plain `?`.
#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    pub(crate) address: ServerAddress,

    pub(crate) server_type: ServerType,

    /// When the most recent heartbeat (successful or not) finished.
    pub(crate) last_update_time: Option<DateTime>,

    /// Exponentially smoothed heartbeat round trip time.
    pub(crate) average_round_trip_time: Option<Duration>,

    pub(crate) reply: Result<Option<HelloReply>>,
}

impl ServerDescription {
    /// An empty description: the server is known to exist but nothing has been learned
    /// about it yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: ServerAddress::Tcp {
                host: address.host().to_lowercase(),
                port: address.port(),
            },
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let mut description = Self::new(&address);
        description.average_round_trip_time = Some(average_rtt);
        description.last_update_time = Some(DateTime::now());
        description.server_type = reply.command_response.server_type();

        // Hostnames compare case-insensitively, so everything taken from the reply is
        // folded to lowercase up front.
        let response = &mut reply.command_response;
        for list in [&mut response.hosts, &mut response.passives, &mut response.arbiters] {
            if let Some(hostnames) = list.as_mut() {
                for hostname in hostnames.iter_mut() {
                    *hostname = hostname.to_lowercase();
                }
            }
        }
        if let Some(me) = response.me.as_mut() {
            *me = me.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error);
        description
    }

    /// Projects a field out of the hello reply. An unchecked server projects to `None`; a
    /// failed check propagates its error.
    fn reply_field<T>(
        &self,
        project: impl FnOnce(&HelloCommandResponse) -> Option<T>,
    ) -> Result<Option<T>> {
        match self.reply {
            Ok(Some(ref reply)) => Ok(project(&reply.command_response)),
            Ok(None) => Ok(None),
            Err(ref error) => Err(error.clone()),
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        self.reply_field(|response| response.set_name.clone())
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        self.reply_field(|response| response.set_version)
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        self.reply_field(|response| response.election_id)
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        self.reply_field(|response| {
            response
                .last_write
                .as_ref()
                .map(|last_write| last_write.last_write_date)
        })
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>> {
        self.reply_field(|response| {
            response
                .logical_session_timeout_minutes
                .map(|minutes| Duration::from_secs(minutes as u64 * 60))
        })
    }

    pub(crate) fn cluster_time(&self) -> Result<Option<ClusterTime>> {
        match self.reply {
            Ok(Some(ref reply)) => Ok(reply.cluster_time.clone()),
            Ok(None) => Ok(None),
            Err(ref error) => Err(error.clone()),
        }
    }

    /// Every address the server claims belongs to its replica set: hosts, passives, and
    /// arbiters combined.
    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let listed = self.reply_field(|response| {
            let mut all = Vec::new();
            for list in [&response.hosts, &response.passives, &response.arbiters] {
                if let Some(hostnames) = list {
                    all.extend(hostnames.iter().cloned());
                }
            }
            Some(all)
        })?;

        listed
            .unwrap_or_default()
            .iter()
            .map(ServerAddress::parse)
            .collect()
    }

    /// Whether the server thinks it is reachable under a different address than the one the
    /// driver contacted it at.
    pub(crate) fn invalid_me(&self) -> Result<bool> {
        let me = self.reply_field(|response| response.me.clone())?;
        Ok(match me {
            Some(me) => me != self.address.to_string(),
            None => false,
        })
    }

    /// The topology version carried by the latest reply, or by the latest error for servers
    /// that transitioned to Unknown because of one.
    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            Ok(None) => None,
            Err(ref error) => error.topology_version(),
        }
    }

    /// A human-readable explanation if this server's wire version range has no overlap with
    /// the driver's, or `None` when the two can talk to each other.
    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        let response = match self.reply {
            Ok(Some(ref reply)) => &reply.command_response,
            _ => return None,
        };

        let server_min = response.min_wire_version.unwrap_or(0);
        let server_max = response.max_wire_version.unwrap_or(0);

        if server_min > DRIVER_MAX_WIRE_VERSION {
            Some(format!(
                "Server at {} requires wire version {}, but this version of the FerroDB Rust \
                 driver only supports up to {}",
                self.address, server_min, DRIVER_MAX_WIRE_VERSION,
            ))
        } else if server_max < DRIVER_MIN_WIRE_VERSION {
            Some(format!(
                "Server at {} reports wire version {}, but this version of the FerroDB Rust \
                 driver requires at least {} (FerroDB {}).",
                self.address, server_max, DRIVER_MIN_WIRE_VERSION, DRIVER_MIN_DB_VERSION,
            ))
        } else {
            None
        }
    }

    /// Whether this server advertises every tag in `tag_set` with matching values.
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let advertised = match self.reply {
            Ok(Some(ref reply)) => match reply.command_response.tags {
                Some(ref tags) => tags,
                None => return false,
            },
            _ => return false,
        };

        tag_set
            .iter()
            .all(|(key, value)| advertised.get(key) == Some(value))
    }
}

// Two descriptions are considered equal when they would route operations identically; the
// comparison deliberately skips volatile observations like RTT and update times so that
// republishing an unchanged server doesn't wake up selection.
impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (&self.reply, &other.reply) {
            (Ok(lhs), Ok(rhs)) => {
                match (lhs.as_ref(), rhs.as_ref()) {
                    (Some(lhs), Some(rhs)) => {
                        routing_fields(&lhs.command_response)
                            == routing_fields(&rhs.command_response)
                    }
                    (None, None) => true,
                    _ => false,
                }
            }
            (Err(lhs), Err(rhs)) => match (lhs.kind.as_ref(), rhs.kind.as_ref()) {
                (ErrorKind::Command(lhs), ErrorKind::Command(rhs)) => lhs.code == rhs.code,
                _ => lhs.to_string() == rhs.to_string(),
            },
            _ => false,
        }
    }
}

/// The subset of a hello reply that affects how operations are routed, bundled up for
/// equality checks.
#[allow(clippy::type_complexity)]
fn routing_fields(
    response: &HelloCommandResponse,
) -> (
    ServerType,
    (Option<i32>, Option<i32>),
    (&Option<String>, &Option<String>, &Option<String>),
    (&Option<Vec<String>>, &Option<Vec<String>>, &Option<Vec<String>>),
    &Option<TagSet>,
    (Option<i32>, Option<ObjectId>),
    Option<i64>,
    Option<TopologyVersion>,
) {
    (
        response.server_type(),
        (response.min_wire_version, response.max_wire_version),
        (&response.me, &response.primary, &response.set_name),
        (&response.hosts, &response.passives, &response.arbiters),
        &response.tags,
        (response.set_version, response.election_id),
        response.logical_session_timeout_minutes,
        response.topology_version,
    )
}

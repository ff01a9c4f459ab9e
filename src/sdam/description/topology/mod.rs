pub(crate) mod server_selection;
#[cfg(test)]
pub(crate) mod test;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    bson::oid::ObjectId,
    client::session::ClusterTime,
    cmap::Command,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType},
        public::ServerInfo,
        DEFAULT_HEARTBEAT_FREQUENCY,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

use self::server_selection::IDLE_WRITE_PERIOD;

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Single => "Single",
            Self::ReplicaSetNoPrimary => "ReplicaSetNoPrimary",
            Self::ReplicaSetWithPrimary => "ReplicaSetWithPrimary",
            Self::Sharded => "Sharded",
            Self::LoadBalanced => "LoadBalanced",
            Self::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// An immutable snapshot of everything the driver knows about the deployment as a whole.
/// New observations are merged in through [`TopologyDescription::update`], which owns all of
/// the type-transition and membership rules.
#[derive(Debug, Clone, Default)]
pub(crate) struct TopologyDescription {
    /// Whether the topology was seeded with exactly one address. A lone seed that turns out
    /// to be a standalone server freezes the topology as `Single`.
    pub(crate) single_seed: bool,

    pub(crate) topology_type: TopologyType,

    /// The replica set this topology tracks, from the options or adopted from the first
    /// member heard from.
    pub(crate) set_name: Option<String>,

    /// High-water marks over every (setVersion, electionId) pair observed from a primary,
    /// used to recognize primaries whose election has since been superseded.
    pub(crate) max_set_version: Option<i32>,
    pub(crate) max_election_id: Option<ObjectId>,

    /// Set when some member's wire version range has no overlap with the driver's; server
    /// selection fails fast while this is present.
    pub(crate) compatibility_error: Option<String>,

    /// How long the deployment keeps an unused session alive: the minimum across
    /// data-bearing members, or `None` if any of them doesn't support sessions.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The highest cluster time any server (or reply) has reported.
    pub(crate) cluster_time: Option<ClusterTime>,

    /// Extra latency over the fastest member tolerated by server selection.
    pub(crate) local_threshold: Option<Duration>,

    pub(crate) heartbeat_freq: Option<Duration>,

    /// Everything currently considered part of the deployment.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

// Equality only decides whether waiting server-selection operations should re-run, so only
// the fields selection reads take part in it.
impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
            && self.topology_type == other.topology_type
    }
}

/// Replies and errors carry a topology version; within one server process, a lower counter
/// means older information that must not overwrite newer state.
fn update_is_stale(existing: &ServerDescription, incoming: &ServerDescription) -> bool {
    match (existing.topology_version(), incoming.topology_version()) {
        (Some(existing_tv), Some(incoming_tv)) => {
            existing_tv.process_id == incoming_tv.process_id
                && incoming_tv.counter < existing_tv.counter
        }
        _ => false,
    }
}

impl TopologyDescription {
    pub(crate) fn initialize(&mut self, options: &ClientOptions) {
        debug_assert!(
            self.servers.is_empty() && self.topology_type == TopologyType::Unknown,
            "new TopologyDescriptions should start empty"
        );

        self.topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if options.load_balanced == Some(true) {
            TopologyType::LoadBalanced
        } else {
            TopologyType::Unknown
        };

        self.servers = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        self.single_seed = self.servers.len() == 1;
        self.set_name.clone_from(&options.repl_set_name);
        self.local_threshold = options.local_threshold;
        self.heartbeat_freq = options.heartbeat_freq;
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// Merge a fresh observation of one server into the topology.
    pub(crate) fn update(&mut self, mut incoming: ServerDescription) -> Result<()> {
        // Servers no longer in the topology don't get to influence it.
        let existing = match self.servers.get(&incoming.address) {
            Some(existing) => existing,
            None => return Ok(()),
        };

        if update_is_stale(existing, &incoming) {
            return Ok(());
        }

        // With a direct connection, the one server must actually belong to the replica set
        // named in the options; a stranger is recorded as an error rather than silently
        // used.
        if self.topology_type == TopologyType::Single && incoming.is_available() {
            if let Some(ref expected) = self.set_name {
                let observed = incoming.set_name();
                let matches = matches!(
                    observed.as_ref().map(|name| name.as_deref()),
                    Ok(Some(observed)) if observed == expected
                );
                if !matches {
                    let observed_display = match observed {
                        Ok(Some(name)) => format!("{:?}", name),
                        Ok(None) => "<none>".to_string(),
                        Err(error) => format!("<error: {}>", error),
                    };
                    incoming = ServerDescription::new_from_error(
                        incoming.address,
                        Error::invalid_argument(format!(
                            "Connection string replicaSet name {:?} does not match actual \
                             name {}",
                            expected, observed_display,
                        )),
                    );
                }
            }
        }

        self.servers
            .insert(incoming.address.clone(), incoming.clone());

        if self.topology_type == TopologyType::LoadBalanced {
            // The load balancer's description is synthesized rather than observed; there is
            // nothing to derive from it.
            return Ok(());
        }

        self.fold_session_timeout(&incoming);

        if let Some(cluster_time) = incoming.cluster_time().ok().flatten() {
            self.advance_cluster_time(&cluster_time);
        }

        self.apply_member_update(incoming)?;
        self.refresh_compatibility();

        Ok(())
    }

    /// The type-transition and membership table, keyed by what the topology currently is
    /// and what the member turned out to be.
    fn apply_member_update(&mut self, member: ServerDescription) -> Result<()> {
        use ServerType as S;
        use TopologyType as T;

        match (self.topology_type, member.server_type) {
            // Membership of these topologies is fixed at construction.
            (T::Single, _) | (T::LoadBalanced, _) => {}

            (T::Unknown | T::ReplicaSetNoPrimary | T::ReplicaSetWithPrimary, S::LoadBalancer) => {
                return Err(Error::internal("cannot transition to a load balancer"))
            }

            // Undescribed and ghost members carry no topology information, but losing the
            // description of a primary may demote the topology.
            (T::Unknown | T::ReplicaSetNoPrimary, S::Unknown | S::RsGhost) => {}
            (T::ReplicaSetWithPrimary, S::Unknown | S::RsGhost) => self.refresh_primary_flag(),

            (T::Unknown, S::Standalone) => {
                if self.single_seed {
                    self.topology_type = T::Single;
                } else {
                    // A standalone can't be part of a multi-seed deployment.
                    self.servers.remove(&member.address);
                }
            }
            (T::Unknown, S::Mongos) => self.topology_type = T::Sharded,
            (T::Unknown | T::ReplicaSetNoPrimary, S::RsPrimary) => {
                self.topology_type = T::ReplicaSetWithPrimary;
                self.absorb_primary(member)?;
            }
            (T::Unknown, S::RsSecondary | S::RsArbiter | S::RsOther) => {
                self.topology_type = T::ReplicaSetNoPrimary;
                self.absorb_rs_member(member)?;
            }

            // Only routers belong in a sharded topology.
            (T::Sharded, S::Unknown | S::Mongos) => {}
            (T::Sharded, _) => {
                self.servers.remove(&member.address);
            }

            (T::ReplicaSetNoPrimary, S::Standalone | S::Mongos) => {
                self.servers.remove(&member.address);
            }
            (T::ReplicaSetNoPrimary, S::RsSecondary | S::RsArbiter | S::RsOther) => {
                self.absorb_rs_member(member)?;
            }

            (T::ReplicaSetWithPrimary, S::Standalone | S::Mongos) => {
                self.servers.remove(&member.address);
                self.refresh_primary_flag();
            }
            (T::ReplicaSetWithPrimary, S::RsPrimary) => self.absorb_primary(member)?,
            (T::ReplicaSetWithPrimary, S::RsSecondary | S::RsArbiter | S::RsOther) => {
                self.audit_rs_member(member)?;
            }
        }

        Ok(())
    }

    /// Adopts the member's set name if none is known yet. Returns whether the member
    /// belongs to this topology's replica set.
    fn adopt_or_match_set_name(&mut self, member: &ServerDescription) -> Result<bool> {
        let observed = member.set_name()?;
        match (&self.set_name, observed) {
            (None, observed) => {
                self.set_name = observed;
                Ok(true)
            }
            (Some(expected), Some(observed)) => Ok(*expected == observed),
            (Some(_), None) => Ok(false),
        }
    }

    /// Folds a non-primary member's observation into a topology that has no primary:
    /// its peers become candidates, but only a primary may remove anyone.
    fn absorb_rs_member(&mut self, member: ServerDescription) -> Result<()> {
        if !self.adopt_or_match_set_name(&member)? {
            self.servers.remove(&member.address);
            return Ok(());
        }

        self.track_members(member.known_hosts()?);

        if member.invalid_me()? {
            // The server answers to a different address than the one dialed; trust the
            // address it advertises (already tracked above) over the alias.
            self.servers.remove(&member.address);
        }

        Ok(())
    }

    /// Double-checks a non-primary member against a topology that has a primary. The
    /// primary's host list stays authoritative, so nothing is added here.
    fn audit_rs_member(&mut self, member: ServerDescription) -> Result<()> {
        if self.set_name != member.set_name()? || member.invalid_me()? {
            self.servers.remove(&member.address);
            self.refresh_primary_flag();
        }

        Ok(())
    }

    /// Folds an accepted-or-rejected primary claim into the topology.
    fn absorb_primary(&mut self, member: ServerDescription) -> Result<()> {
        if !self.adopt_or_match_set_name(&member)? {
            self.servers.remove(&member.address);
            self.refresh_primary_flag();
            return Ok(());
        }

        // A (setVersion, electionId) pair below the high-water mark means this member won
        // an election that has since been superseded; its claim is discarded and the member
        // reset to Unknown until a fresh check sorts it out.
        if let (Some(set_version), Some(election_id)) =
            (member.set_version()?, member.election_id()?)
        {
            if let (Some(max_set_version), Some(max_election_id)) =
                (self.max_set_version, self.max_election_id)
            {
                if (max_set_version, max_election_id) > (set_version, election_id) {
                    self.servers.insert(
                        member.address.clone(),
                        ServerDescription::new(&member.address),
                    );
                    self.refresh_primary_flag();
                    return Ok(());
                }
            }

            self.max_election_id = Some(election_id);
        }

        if let Some(set_version) = member.set_version()? {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        let peers: Vec<ServerAddress> = self.servers.keys().cloned().collect();

        // At most one primary: any other member still claiming the role is reset to
        // Unknown, prompting a fresh check.
        for address in &peers {
            if *address != member.address
                && self.servers.get(address).map(|peer| peer.server_type)
                    == Some(ServerType::RsPrimary)
            {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address));
            }
        }

        // The accepted primary's member lists are authoritative: the topology becomes
        // exactly the union of its hosts, passives, and arbiters.
        let roster = member.known_hosts()?;
        self.track_members(roster.iter().cloned());
        for address in peers {
            if !roster.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.refresh_primary_flag();

        Ok(())
    }

    /// Recomputes whether this replica set topology currently has a primary.
    fn refresh_primary_flag(&mut self) {
        let has_primary = self
            .servers
            .values()
            .any(|member| member.server_type == ServerType::RsPrimary);

        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Starts tracking any of the given addresses that aren't tracked yet.
    fn track_members(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(&address));
        }
    }

    /// Folds one member's session timeout into the topology-wide minimum.
    fn fold_session_timeout(&mut self, member: &ServerDescription) {
        if !member.server_type.is_data_bearing() {
            return;
        }

        self.logical_session_timeout = match member.logical_session_timeout().ok().flatten() {
            // A data-bearing member without a session timeout disables sessions for the
            // whole deployment.
            None => None,
            Some(observed) => match self.logical_session_timeout {
                Some(current) => Some(current.min(observed)),
                // First data-bearing observation: fold over everything known so far. Any
                // peer that reported no timeout keeps the result `None`.
                None => self
                    .servers
                    .values()
                    .filter(|peer| peer.server_type.is_data_bearing())
                    .map(|peer| peer.logical_session_timeout().ok().flatten())
                    .min()
                    .flatten(),
            },
        };
    }

    fn refresh_compatibility(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(|member| member.compatibility_error_message());
    }

    /// Raises the topology's cluster time; older observations are ignored.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() < Some(cluster_time) {
            self.cluster_time = Some(cluster_time.clone());
        }
    }

    /// What changed between this snapshot and `other`, from `other`'s point of view (a
    /// server present only in `other` is "added"). `None` when the two route identically.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let removed_addresses: HashSet<&ServerAddress> = self
            .servers
            .keys()
            .filter(|address| !other.servers.contains_key(*address))
            .collect();
        let added_addresses: HashSet<&ServerAddress> = other
            .servers
            .keys()
            .filter(|address| !self.servers.contains_key(*address))
            .collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, before)| {
                let after = other.servers.get(address)?;
                (before != after).then_some((address, (before, after)))
            })
            .collect();

        Some(TopologyDescriptionDiff {
            removed_addresses,
            added_addresses,
            changed_servers,
        })
    }

    /// Attaches `$readPreference` to the command in the form the receiving server expects,
    /// which depends on what kind of server it is and how it was reached.
    pub(crate) fn update_command_with_read_pref(
        &self,
        address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        let server_type = self
            .get_server_description(address)
            .map(|member| member.server_type)
            .unwrap_or(ServerType::Unknown);

        let attach = match (self.topology_type, server_type) {
            // Routers (and anything behind a load balancer) apply read preferences
            // themselves; forward any non-default one.
            (TopologyType::LoadBalanced, _)
            | (TopologyType::Sharded | TopologyType::Single, ServerType::Mongos) => {
                match criteria {
                    Some(SelectionCriteria::ReadPreference(read_pref))
                        if *read_pref != ReadPreference::Primary =>
                    {
                        Some(read_pref.clone())
                    }
                    _ => None,
                }
            }

            (TopologyType::Single, ServerType::Standalone) => None,

            // A direct connection to a replica set member must be able to serve reads even
            // if the member isn't the primary.
            (TopologyType::Single, _) => {
                let requested = criteria.and_then(SelectionCriteria::as_read_pref).cloned();
                match requested {
                    None | Some(ReadPreference::Primary) => {
                        Some(ReadPreference::PrimaryPreferred { options: None })
                    }
                    Some(other) => Some(other),
                }
            }

            _ => match criteria {
                Some(SelectionCriteria::ReadPreference(read_pref))
                    if *read_pref != ReadPreference::Primary =>
                {
                    Some(read_pref.clone())
                }
                Some(SelectionCriteria::Predicate(_)) => {
                    Some(ReadPreference::PrimaryPreferred { options: None })
                }
                _ => None,
            },
        };

        if let Some(read_pref) = attach {
            command.set_read_preference(read_pref);
        }
    }
}

/// Choose `n` elements from `values` at random.
pub(crate) fn choose_n<T>(values: &[T], n: usize) -> impl Iterator<Item = &T> {
    use rand::{prelude::SliceRandom, SeedableRng};
    values.choose_multiple(&mut rand::rngs::SmallRng::from_entropy(), n)
}

/// What changed between two topology snapshots; produced by
/// [`TopologyDescription::diff`].
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    #[allow(dead_code)]
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

/// The smallest staleness bound that can be meaningfully enforced: below one heartbeat (plus
/// the server's idle write period) the driver simply cannot tell fresh from stale, and the
/// floor is 90 seconds regardless.
pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let floor = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < floor {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            floor.as_secs()
        )));
    }

    Ok(())
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }
        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {}", max_set_version)?;
        }
        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {}", max_election_id)?;
        }
        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", compatibility_error)?;
        }

        if !self.servers.is_empty() {
            let members: Vec<String> = self
                .servers
                .values()
                .map(|member| ServerInfo::new_borrowed(member).to_string())
                .collect();
            write!(f, ", Servers: [ {} ]", members.join(", "))?;
        }

        write!(f, " }}")
    }
}

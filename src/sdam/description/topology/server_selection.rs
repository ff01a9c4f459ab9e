use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};

use super::TopologyDescription;
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::TopologyType,
        },
        public::ServerInfo,
        Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// A server handed out by selection. Holding one counts as an in-progress operation against
/// that server for load-distribution purposes; the count drops when this is dropped.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn checked_out(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

/// Runs one round of selection against a topology snapshot: narrow the membership down to
/// the candidates the criteria allow, then break ties by load. Returns `None` when the
/// current topology simply has no suitable server, and an error when it can never produce
/// one (wire-version incompatibility, invalid criteria).
pub(crate) fn pick_server<'a>(
    criteria: &'a SelectionCriteria,
    description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
    avoid: Option<&ServerAddress>,
) -> Result<Option<SelectedServer>> {
    let mut candidates = description.selection_candidates(criteria)?;

    // A server a previous attempt of this operation failed on is only used again if it's
    // the sole option.
    if let Some(avoid) = avoid {
        if candidates.len() > 1 {
            candidates.retain(|member| &member.address != avoid);
        }
    }

    let live_candidates: Vec<&Arc<Server>> = candidates
        .iter()
        .filter_map(|member| servers.get(&member.address))
        .collect();

    Ok(prefer_less_loaded(live_candidates).map(SelectedServer::checked_out))
}

/// The tiebreak within the latency window: sample two candidates at random and take the one
/// with fewer in-progress operations. Biasing toward the less loaded of two random choices
/// spreads load across the window far better than a uniform pick.
fn prefer_less_loaded(candidates: Vec<&Arc<Server>>) -> Option<Arc<Server>> {
    match candidates.len() {
        0 => None,
        1 => Some(candidates[0].clone()),
        _ => super::choose_n(&candidates, 2)
            .min_by_key(|server| server.operation_count())
            .map(|server| Arc::clone(server)),
    }
}

/// When computing staleness, lag is measured against the primary if one is known, and
/// against the most recently written-to secondary otherwise.
enum StalenessBaseline<'a> {
    PrimaryObservation(&'a ServerDescription),
    NewestSecondaryWrite(i64),
}

impl TopologyDescription {
    /// The subset of the membership that satisfies `criteria` and falls inside the latency
    /// window.
    pub(crate) fn selection_candidates<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::ServerSelection {
                message: message.to_string(),
            }
            .into());
        }

        let mut candidates = match criteria {
            SelectionCriteria::ReadPreference(read_pref) => {
                self.read_preference_candidates(read_pref)?
            }
            SelectionCriteria::Predicate(filter) => self
                .servers
                .values()
                .filter(|member| {
                    // A direct connection takes whatever single server it was pointed at,
                    // data-bearing or not.
                    (self.topology_type == TopologyType::Single
                        || member.server_type.is_data_bearing())
                        && filter(&ServerInfo::new_borrowed(member))
                })
                .collect(),
        };

        self.shrink_to_latency_window(&mut candidates);

        Ok(candidates)
    }

    fn read_preference_candidates<'a>(
        &'a self,
        read_preference: &'a ReadPreference,
    ) -> Result<Vec<&'a ServerDescription>> {
        match self.topology_type {
            // Nothing is known yet, so nothing is eligible.
            TopologyType::Unknown => Ok(Vec::new()),

            // The sole member takes every operation regardless of mode.
            TopologyType::Single | TopologyType::LoadBalanced => {
                Ok(self.servers.values().collect())
            }

            // Routers handle read preferences themselves.
            TopologyType::Sharded => Ok(self.members_of_kind(&[ServerType::Mongos]).collect()),

            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.replica_set_candidates(read_preference)
            }
        }
    }

    fn replica_set_candidates<'a>(
        &'a self,
        read_preference: &'a ReadPreference,
    ) -> Result<Vec<&'a ServerDescription>> {
        let primaries = || self.members_of_kind(&[ServerType::RsPrimary]);
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();

        let candidates = match read_preference {
            ReadPreference::Primary => primaries().collect(),

            ReadPreference::Secondary { .. } => self.filtered_members(
                &[ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,

            // Fall back to secondaries only when no primary is known; the secondary filters
            // never apply to the primary itself.
            ReadPreference::PrimaryPreferred { .. } => match primaries().next() {
                Some(primary) => vec![primary],
                None => self.filtered_members(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?,
            },

            ReadPreference::SecondaryPreferred { .. } => {
                let secondaries = self.filtered_members(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?;
                if secondaries.is_empty() {
                    primaries().collect()
                } else {
                    secondaries
                }
            }

            // Both member kinds are eligible, and both go through the filters.
            ReadPreference::Nearest { .. } => self.filtered_members(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
        };

        Ok(candidates)
    }

    /// Replica set members of the given kinds, narrowed by the staleness bound and tag sets,
    /// in that order.
    fn filtered_members<'a>(
        &'a self,
        kinds: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&'a ServerDescription>> {
        let mut members: Vec<_> = self.members_of_kind(kinds).collect();

        if let Some(max_staleness) = max_staleness {
            super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;

            // A zero (or negative, at the URI level) bound means staleness is not
            // considered at all.
            if !max_staleness.is_zero() {
                self.drop_stale_members(&mut members, max_staleness);
            }
        }

        if let Some(tag_sets) = tag_sets {
            apply_tag_filter(&mut members, tag_sets);
        }

        Ok(members)
    }

    pub(crate) fn members_of_kind<'a>(
        &'a self,
        kinds: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |member| kinds.contains(&member.server_type))
    }

    #[cfg(test)]
    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.members_of_kind(&[ServerType::RsPrimary]).next()
    }

    fn drop_stale_members(&self, members: &mut Vec<&ServerDescription>, bound: Duration) {
        let baseline = match self.staleness_baseline() {
            Some(baseline) => baseline,
            // No write has been observed anywhere, so there is nothing to measure lag
            // against.
            None => return,
        };

        let bound_ms: i64 = bound.as_millis().try_into().unwrap_or(i64::MAX);

        members.retain(|member| {
            self.estimated_staleness_ms(member, &baseline)
                .map_or(false, |staleness| staleness <= bound_ms)
        });
    }

    fn staleness_baseline(&self) -> Option<StalenessBaseline<'_>> {
        if let Some(primary) = self
            .servers
            .values()
            .find(|member| member.server_type == ServerType::RsPrimary)
        {
            return Some(StalenessBaseline::PrimaryObservation(primary));
        }

        self.servers
            .values()
            .filter(|member| member.server_type == ServerType::RsSecondary)
            .filter_map(|member| member.last_write_date().ok().flatten())
            .map(|last_write| last_write.timestamp_millis())
            .max()
            .map(StalenessBaseline::NewestSecondaryWrite)
    }

    /// How far behind the baseline this member's last observed write is, padded by one
    /// heartbeat interval (the observations themselves can be up to that old). `None` means
    /// the estimate cannot be computed, which callers treat as too stale.
    fn estimated_staleness_ms(
        &self,
        member: &ServerDescription,
        baseline: &StalenessBaseline<'_>,
    ) -> Option<i64> {
        let heartbeat_ms: i64 = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);
        let member_write = member.last_write_date().ok()??.timestamp_millis();

        let lag = match baseline {
            StalenessBaseline::PrimaryObservation(primary) => {
                let primary_write = primary.last_write_date().ok()??.timestamp_millis();
                let primary_update = primary.last_update_time?.timestamp_millis();
                let member_update = member.last_update_time?.timestamp_millis();

                (member_update - member_write) - (primary_update - primary_write)
            }
            StalenessBaseline::NewestSecondaryWrite(newest_write) => newest_write - member_write,
        };

        Some(lag + heartbeat_ms)
    }

    /// Drops every candidate whose smoothed round trip time is more than the local
    /// threshold above the fastest candidate's.
    fn shrink_to_latency_window(&self, candidates: &mut Vec<&ServerDescription>) {
        let threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let fastest = candidates
            .iter()
            .filter_map(|member| member.average_round_trip_time)
            .min();

        match fastest {
            Some(fastest) => {
                let cutoff = fastest.checked_add(threshold).unwrap_or(Duration::MAX);
                candidates.retain(|member| match member.average_round_trip_time {
                    Some(rtt) => rtt <= cutoff,
                    // Load balancers are never heartbeated, so they have no RTT to judge;
                    // they always pass.
                    None => member.server_type == ServerType::LoadBalancer,
                });
            }
            None => {
                candidates.retain(|member| member.server_type == ServerType::LoadBalancer);
            }
        }
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|member| member.is_available())
    }

    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {:?}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }
}

/// Tag sets are tried in order; the first one any candidate matches becomes the filter. If
/// none matches anything, no candidate survives. An empty list of tag sets is a no-op, and
/// an empty tag set inside the list matches everyone.
fn apply_tag_filter(members: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    let first_matching = tag_sets
        .iter()
        .find(|tag_set| members.iter().any(|member| member.matches_tag_set(tag_set)));

    match first_matching {
        Some(tag_set) => members.retain(|member| member.matches_tag_set(tag_set)),
        None => members.clear(),
    }
}

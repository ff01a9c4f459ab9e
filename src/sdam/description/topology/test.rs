use std::time::Duration;

use bson::{doc, oid::ObjectId, Document};
use pretty_assertions::assert_eq;

use super::{TopologyDescription, TopologyType};
use crate::{
    error::{CommandError, Error, ErrorKind},
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

fn hello_reply(body: Document) -> HelloReply {
    let command_response: HelloCommandResponse = bson::from_document(body.clone()).unwrap();
    HelloReply {
        command_response,
        raw_command_response: body,
        cluster_time: None,
    }
}

fn describe(address: &str, rtt_ms: u64, body: Document) -> ServerDescription {
    ServerDescription::new_from_hello_reply(
        ServerAddress::parse(address).unwrap(),
        hello_reply(body),
        Duration::from_millis(rtt_ms),
    )
}

fn standalone_hello() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "minWireVersion": 7,
        "maxWireVersion": 17,
        "logicalSessionTimeoutMinutes": 30,
    }
}

fn mongos_hello() -> Document {
    let mut body = standalone_hello();
    body.insert("msg", "isdbgrid");
    body
}

fn rs_member_hello(set_name: &str, hosts: Vec<&str>) -> Document {
    doc! {
        "ok": 1,
        "setName": set_name,
        "hosts": hosts.into_iter().map(String::from).collect::<Vec<_>>(),
        "minWireVersion": 7,
        "maxWireVersion": 17,
        "logicalSessionTimeoutMinutes": 30,
    }
}

fn rs_primary_hello(set_name: &str, hosts: Vec<&str>) -> Document {
    let mut body = rs_member_hello(set_name, hosts);
    body.insert("isWritablePrimary", true);
    body
}

fn rs_secondary_hello(set_name: &str, hosts: Vec<&str>) -> Document {
    let mut body = rs_member_hello(set_name, hosts);
    body.insert("secondary", true);
    body
}

fn topology_with_seeds(seeds: &[&str]) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(
            seeds
                .iter()
                .map(|s| ServerAddress::parse(s).unwrap())
                .collect::<Vec<_>>(),
        )
        .build();
    let mut description = TopologyDescription::default();
    description.initialize(&options);
    description
}

fn addr(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

mod sdam {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_seed_standalone_becomes_single() {
        let mut topology = topology_with_seeds(&["a:27017"]);
        topology
            .update(describe("a:27017", 10, standalone_hello()))
            .unwrap();

        assert_eq!(topology.topology_type(), TopologyType::Single);
        assert_eq!(topology.servers.len(), 1);
    }

    #[test]
    fn standalone_in_multi_seed_topology_is_removed() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology
            .update(describe("a:27017", 10, standalone_hello()))
            .unwrap();

        assert_eq!(topology.topology_type(), TopologyType::Unknown);
        assert!(!topology.servers.contains_key(&addr("a:27017")));
        assert!(topology.servers.contains_key(&addr("b:27017")));
    }

    #[test]
    fn mongos_observation_transitions_to_sharded() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology.update(describe("a:27017", 10, mongos_hello())).unwrap();
        assert_eq!(topology.topology_type(), TopologyType::Sharded);

        // A non-mongos response in a sharded topology removes the server.
        topology
            .update(describe(
                "b:27017",
                10,
                rs_primary_hello("repl", vec!["b:27017"]),
            ))
            .unwrap();
        assert!(!topology.servers.contains_key(&addr("b:27017")));
        assert_eq!(topology.topology_type(), TopologyType::Sharded);
    }

    #[test]
    fn primary_observation_populates_membership() {
        let mut topology = topology_with_seeds(&["a:27017"]);
        topology
            .update(describe(
                "a:27017",
                10,
                rs_primary_hello("repl", vec!["a:27017", "b:27017", "c:27017"]),
            ))
            .unwrap();

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.set_name.as_deref(), Some("repl"));
        assert_eq!(topology.servers.len(), 3);
        assert_eq!(
            topology.servers.get(&addr("b:27017")).unwrap().server_type,
            ServerType::Unknown
        );
    }

    #[test]
    fn primary_update_prunes_members_not_in_host_list() {
        let mut topology = topology_with_seeds(&["a:27017"]);
        topology
            .update(describe(
                "a:27017",
                10,
                rs_primary_hello("repl", vec!["a:27017", "b:27017", "c:27017"]),
            ))
            .unwrap();
        assert_eq!(topology.servers.len(), 3);

        // The primary no longer lists c; it must be removed from the topology.
        topology
            .update(describe(
                "a:27017",
                10,
                rs_primary_hello("repl", vec!["a:27017", "b:27017"]),
            ))
            .unwrap();
        assert_eq!(topology.servers.len(), 2);
        assert!(!topology.servers.contains_key(&addr("c:27017")));
    }

    #[test]
    fn secondaries_never_remove_members() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017", "c:27017"]);
        topology
            .update(describe(
                "a:27017",
                10,
                rs_secondary_hello("repl", vec!["a:27017", "b:27017"]),
            ))
            .unwrap();

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
        // c was not listed by the secondary, but only a primary's host list is authoritative.
        assert!(topology.servers.contains_key(&addr("c:27017")));
    }

    #[test]
    fn at_most_one_primary() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);

        let mut first = rs_primary_hello("repl", vec!["a:27017", "b:27017"]);
        first.insert("setVersion", 1);
        first.insert("electionId", ObjectId::from_bytes([1; 12]));
        topology.update(describe("a:27017", 10, first)).unwrap();

        let mut second = rs_primary_hello("repl", vec!["a:27017", "b:27017"]);
        second.insert("setVersion", 1);
        second.insert("electionId", ObjectId::from_bytes([2; 12]));
        topology.update(describe("b:27017", 10, second)).unwrap();

        let primaries: Vec<_> = topology
            .servers
            .values()
            .filter(|s| s.server_type == ServerType::RsPrimary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].address, addr("b:27017"));

        // The prior primary is demoted to Unknown so a new check will re-describe it.
        assert_eq!(
            topology.servers.get(&addr("a:27017")).unwrap().server_type,
            ServerType::Unknown
        );
    }

    #[test]
    fn stale_primary_is_demoted() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);

        let mut newer = rs_primary_hello("repl", vec!["a:27017", "b:27017"]);
        newer.insert("setVersion", 1);
        newer.insert("electionId", ObjectId::from_bytes([5; 12]));
        topology.update(describe("a:27017", 10, newer)).unwrap();

        // An old primary with an older election id must not be accepted.
        let mut stale = rs_primary_hello("repl", vec!["a:27017", "b:27017"]);
        stale.insert("setVersion", 1);
        stale.insert("electionId", ObjectId::from_bytes([4; 12]));
        topology.update(describe("b:27017", 10, stale)).unwrap();

        assert_eq!(
            topology.servers.get(&addr("b:27017")).unwrap().server_type,
            ServerType::Unknown
        );
        assert_eq!(
            topology.servers.get(&addr("a:27017")).unwrap().server_type,
            ServerType::RsPrimary
        );
    }

    #[test]
    fn mismatched_set_name_is_removed() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology
            .update(describe(
                "a:27017",
                10,
                rs_primary_hello("repl", vec!["a:27017", "b:27017"]),
            ))
            .unwrap();

        topology
            .update(describe(
                "b:27017",
                10,
                rs_secondary_hello("other", vec!["b:27017"]),
            ))
            .unwrap();

        assert!(!topology.servers.contains_key(&addr("b:27017")));
    }

    #[test]
    fn stale_topology_version_is_ignored() {
        let process_id = ObjectId::new();
        let mut topology = topology_with_seeds(&["a:27017"]);

        let mut newer = standalone_hello();
        newer.insert(
            "topologyVersion",
            doc! { "processId": process_id, "counter": 2_i64 },
        );
        topology.update(describe("a:27017", 10, newer)).unwrap();
        assert_eq!(
            topology.servers.get(&addr("a:27017")).unwrap().server_type,
            ServerType::Standalone
        );

        // An error (or reply) with an older topology version must not overwrite the state.
        let error = Error::new(
            ErrorKind::Command(CommandError {
                code: 11600,
                code_name: "InterruptedAtShutdown".to_string(),
                message: "interrupted at shutdown".to_string(),
                topology_version: Some(crate::sdam::TopologyVersion {
                    process_id,
                    counter: 1,
                }),
            }),
            None::<Vec<String>>,
        );
        topology
            .update(ServerDescription::new_from_error(addr("a:27017"), error))
            .unwrap();

        assert_eq!(
            topology.servers.get(&addr("a:27017")).unwrap().server_type,
            ServerType::Standalone
        );
    }

    #[test]
    fn incompatible_wire_version_is_reported() {
        let mut topology = topology_with_seeds(&["a:27017"]);
        let mut body = standalone_hello();
        body.insert("minWireVersion", 2);
        body.insert("maxWireVersion", 5);
        topology.update(describe("a:27017", 10, body)).unwrap();

        assert!(topology.compatibility_error().is_some());

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        assert!(topology.selection_candidates(&criteria).is_err());
    }

    #[test]
    fn session_timeout_is_minimum_across_data_bearing_members() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);

        let mut primary = rs_primary_hello("repl", vec!["a:27017", "b:27017"]);
        primary.insert("logicalSessionTimeoutMinutes", 30);
        topology.update(describe("a:27017", 10, primary)).unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(30 * 60))
        );

        let mut secondary = rs_secondary_hello("repl", vec!["a:27017", "b:27017"]);
        secondary.insert("logicalSessionTimeoutMinutes", 20);
        topology.update(describe("b:27017", 10, secondary)).unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(20 * 60))
        );

        // A data-bearing server without a session timeout clears the topology's value.
        let mut no_timeout = rs_secondary_hello("repl", vec!["a:27017", "b:27017"]);
        no_timeout.remove("logicalSessionTimeoutMinutes");
        topology.update(describe("b:27017", 10, no_timeout)).unwrap();
        assert_eq!(topology.logical_session_timeout, None);
    }
}

mod selection {
    use super::*;
    use crate::sdam::description::topology::server_selection;
    use pretty_assertions::assert_eq;

    fn rs_topology() -> TopologyDescription {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017", "c:27017"]);

        let mut primary = rs_primary_hello("repl", vec!["a:27017", "b:27017", "c:27017"]);
        primary.insert("lastWrite", doc! { "lastWriteDate": bson::DateTime::now() });
        topology.update(describe("a:27017", 10, primary)).unwrap();

        let mut secondary_b =
            rs_secondary_hello("repl", vec!["a:27017", "b:27017", "c:27017"]);
        secondary_b.insert("tags", doc! { "dc": "east" });
        secondary_b.insert("lastWrite", doc! { "lastWriteDate": bson::DateTime::now() });
        topology.update(describe("b:27017", 14, secondary_b)).unwrap();

        let mut secondary_c =
            rs_secondary_hello("repl", vec!["a:27017", "b:27017", "c:27017"]);
        secondary_c.insert("tags", doc! { "dc": "west" });
        secondary_c.insert("lastWrite", doc! { "lastWriteDate": bson::DateTime::now() });
        topology.update(describe("c:27017", 80, secondary_c)).unwrap();

        topology
    }

    #[test]
    fn primary_mode_selects_only_the_primary() {
        let topology = rs_topology();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let suitable = topology.selection_candidates(&criteria).unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, addr("a:27017"));
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let topology = rs_topology();
        // Nearest: min RTT is 10ms, so with the default 15ms threshold only a (10ms) and
        // b (14ms) are in the window.
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });
        let suitable = topology.selection_candidates(&criteria).unwrap();
        let mut addresses: Vec<_> = suitable.iter().map(|s| s.address.to_string()).collect();
        addresses.sort();
        assert_eq!(addresses, vec!["a:27017", "b:27017"]);
    }

    #[test]
    fn tag_sets_filter_in_order() {
        let topology = rs_topology();
        let read_pref = ReadPreference::Secondary { options: None }
            .with_tags(vec![
                [("dc".to_string(), "south".to_string())].into_iter().collect(),
                [("dc".to_string(), "west".to_string())].into_iter().collect(),
            ])
            .unwrap();
        let criteria = SelectionCriteria::ReadPreference(read_pref);
        let suitable = topology.selection_candidates(&criteria).unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, addr("c:27017"));
    }

    #[test]
    fn unknown_servers_are_never_selected() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology
            .update(describe(
                "a:27017",
                10,
                rs_primary_hello("repl", vec!["a:27017", "b:27017"]),
            ))
            .unwrap();

        // b is still Unknown.
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });
        let suitable = topology.selection_candidates(&criteria).unwrap();
        assert!(suitable.iter().all(|s| s.address != addr("b:27017")));
    }

    #[test]
    fn max_staleness_below_90s_is_rejected() {
        let topology = rs_topology();
        let read_pref = ReadPreference::Secondary { options: None }
            .with_max_staleness(Duration::from_secs(30))
            .unwrap();
        let criteria = SelectionCriteria::ReadPreference(read_pref);
        assert!(topology.selection_candidates(&criteria).is_err());
    }

    #[tokio::test]
    async fn operation_count_breaks_ties_in_window() {
        let topology = rs_topology();
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });

        let mut servers = std::collections::HashMap::new();
        servers.insert(
            addr("a:27017"),
            crate::sdam::Server::new_mocked(addr("a:27017"), 5),
        );
        servers.insert(
            addr("b:27017"),
            crate::sdam::Server::new_mocked(addr("b:27017"), 0),
        );
        servers.insert(
            addr("c:27017"),
            crate::sdam::Server::new_mocked(addr("c:27017"), 0),
        );

        // a and b are the only servers in the latency window, so the two random choices are
        // always {a, b}, and the tiebreak must consistently prefer the less loaded b.
        for _ in 0..20 {
            let selected =
                server_selection::pick_server(&criteria, &topology, &servers, None)
                    .unwrap()
                    .expect("a server should be selected");
            assert_eq!(selected.address, addr("b:27017"));
        }
    }

    #[tokio::test]
    async fn deprioritized_server_is_avoided() {
        let topology = rs_topology();
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });

        let mut servers = std::collections::HashMap::new();
        for address in ["a:27017", "b:27017", "c:27017"] {
            servers.insert(addr(address), crate::sdam::Server::new_mocked(addr(address), 0));
        }

        for _ in 0..20 {
            let selected = server_selection::pick_server(
                &criteria,
                &topology,
                &servers,
                Some(&addr("a:27017")),
            )
            .unwrap()
            .expect("a server should be selected");
            assert_ne!(selected.address, addr("a:27017"));
        }
    }
}

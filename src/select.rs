// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.md

use {
	crate::{
		common::{ReadPreference, ReadPreferenceMode, ServerAddress, TagSet},
		topology::{ServerDescription, ServerType, TopologyDescription, TopologyType}
	},
	rand::seq::SliceRandom,
	std::{fmt, time::{Duration, SystemTime, UNIX_EPOCH}}
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SelectionCriteria {
	Write,
	Read(ReadPreference)
}

impl fmt::Display for SelectionCriteria {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Write => f.write_str("write"),
			Self::Read(preference) => {
				write!(f, "read preference {}", preference.mode.as_str())?;
				if !preference.tag_sets.is_empty() {
					write!(f, " with tags {:?}", preference.tag_sets)?;
				}
				if let Some(max_staleness) = preference.max_staleness {
					write!(f, " and max staleness {}s", max_staleness.as_secs())?;
				}
				Ok(())
			}
		}
	}
}

/// Servers matching `criteria`, before the latency window is applied.
pub fn suitable_servers<'a>(description: &'a TopologyDescription, criteria: &SelectionCriteria) -> Vec<&'a ServerDescription> {
	let of_type = |server_type: ServerType| description.servers.values()
		.filter(|s| s.server_type == server_type)
		.collect::<Vec<_>>();

	match description.topology_type {
		TopologyType::Unknown => Vec::new(),
		TopologyType::Single => description.servers.values()
			.filter(|s| s.server_type != ServerType::Unknown)
			.collect(),
		TopologyType::Sharded => of_type(ServerType::Mongos),
		TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => match criteria {
			SelectionCriteria::Write => of_type(ServerType::RsPrimary),
			SelectionCriteria::Read(preference) => {
				let primary = of_type(ServerType::RsPrimary);
				let secondaries = of_type(ServerType::RsSecondary);
				let eligible = |servers: Vec<&'a ServerDescription>| filter_tags(
					filter_stale(description, servers, preference.max_staleness), &preference.tag_sets);

				match preference.mode {
					ReadPreferenceMode::Primary => primary,
					ReadPreferenceMode::PrimaryPreferred if !primary.is_empty() => primary,
					ReadPreferenceMode::PrimaryPreferred | ReadPreferenceMode::Secondary => eligible(secondaries),
					ReadPreferenceMode::SecondaryPreferred => match eligible(secondaries) {
						servers if servers.is_empty() => primary,
						servers => servers
					},
					ReadPreferenceMode::Nearest => eligible(primary.into_iter().chain(secondaries).collect())
				}
			}
		}
	}
}

/// Picks a server at random from the latency window of the suitable ones. Excluded
/// servers are only considered when no other server is suitable.
pub fn select<'a>(
	description:     &'a TopologyDescription,
	criteria:        &SelectionCriteria,
	excluded:        &[ServerAddress],
	local_threshold: Duration
) -> Option<&'a ServerDescription> {
	let suitable = suitable_servers(description, criteria);
	let preferred = suitable.iter()
		.filter(|s| !excluded.contains(&s.address))
		.copied()
		.collect::<Vec<_>>();
	let candidates = if preferred.is_empty() { suitable } else { preferred };

	latency_window(candidates, local_threshold)
		.choose(&mut rand::thread_rng())
		.copied()
}

fn latency_window(servers: Vec<&ServerDescription>, local_threshold: Duration) -> Vec<&ServerDescription> {
	let rtt = |s: &ServerDescription| s.round_trip_time.unwrap_or(Duration::ZERO);
	let Some(fastest) = servers.iter().map(|s| rtt(*s)).min() else { return servers };
	servers.into_iter()
		.filter(|s| rtt(*s) <= fastest + local_threshold)
		.collect()
}

/// The first tag set that matches any server wins. No tag sets match everything.
fn filter_tags<'a>(servers: Vec<&'a ServerDescription>, tag_sets: &[TagSet]) -> Vec<&'a ServerDescription> {
	if tag_sets.is_empty() {
		return servers;
	}

	for tags in tag_sets {
		let matching = servers.iter()
			.filter(|s| tags.iter().all(|(k, v)| s.tags.get(k) == Some(v)))
			.copied()
			.collect::<Vec<_>>();
		if !matching.is_empty() {
			return matching;
		}
	}

	Vec::new()
}

fn millis(time: Option<SystemTime>) -> i64 {
	time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map_or(0, |d| d.as_millis() as i64)
}

/// see https://github.com/mongodb/specifications/blob/master/source/max-staleness/max-staleness.md
fn filter_stale<'a>(
	description:   &TopologyDescription,
	servers:       Vec<&'a ServerDescription>,
	max_staleness: Option<Duration>
) -> Vec<&'a ServerDescription> {
	let Some(max_staleness) = max_staleness else { return servers };
	let max_staleness = max_staleness.as_millis() as i64;
	let heartbeat = description.heartbeat_frequency.as_millis() as i64;

	let staleness: Box<dyn Fn(&ServerDescription) -> i64> = match description.primary() {
		Some(primary) => {
			let primary_lag = millis(primary.last_update_time) - millis(primary.last_write_date);
			Box::new(move |s: &ServerDescription| millis(s.last_update_time) - millis(s.last_write_date) - primary_lag + heartbeat)
		}
		None => {
			let newest = description.servers.values()
				.filter(|s| s.server_type == ServerType::RsSecondary)
				.map(|s| millis(s.last_write_date))
				.max()
				.unwrap_or(0);
			Box::new(move |s: &ServerDescription| newest - millis(s.last_write_date) + heartbeat)
		}
	};

	servers.into_iter()
		.filter(|s| s.server_type == ServerType::RsPrimary || staleness(*s) <= max_staleness)
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	const HEARTBEAT: Duration = Duration::from_secs(10);

	fn address(host: &str) -> ServerAddress {
		ServerAddress::new(host, 27017)
	}

	fn server(host: &str, server_type: ServerType, rtt_ms: u64) -> ServerDescription {
		ServerDescription {
			server_type,
			round_trip_time:  Some(Duration::from_millis(rtt_ms)),
			last_update_time: Some(SystemTime::now()),
			last_write_date:  Some(SystemTime::now()),
			min_wire_version: 6,
			max_wire_version: 17,
			set_name:         Some("rs".to_string()),
			..ServerDescription::new(address(host))
		}
	}

	/// Builds a replica set topology out of the given member descriptions.
	fn replica_set(mut members: Vec<ServerDescription>) -> TopologyDescription {
		let hosts = members.iter().map(|m| m.address.clone()).collect::<Vec<_>>();
		let mut topology = TopologyDescription::new(&hosts, false, Some("rs".into()), HEARTBEAT);
		// primaries go last so that their membership view does not drop anyone
		members.sort_by_key(|m| m.server_type == ServerType::RsPrimary);
		for mut member in members {
			member.hosts = hosts.clone();
			topology = topology.apply(member).unwrap().0;
		}
		topology
	}

	fn read(mode: ReadPreferenceMode) -> SelectionCriteria {
		SelectionCriteria::Read(ReadPreference::new(mode))
	}

	fn select_host(topology: &TopologyDescription, criteria: &SelectionCriteria) -> Option<String> {
		select(topology, criteria, &[], Duration::from_millis(15)).map(|s| s.address.host.clone())
	}

	#[test]
	fn routes_by_mode() {
		let topology = replica_set(vec![
			server("p", ServerType::RsPrimary, 5),
			server("s", ServerType::RsSecondary, 5)
		]);

		assert_eq!(select_host(&topology, &SelectionCriteria::Write).as_deref(), Some("p"));
		assert_eq!(select_host(&topology, &read(ReadPreferenceMode::Primary)).as_deref(), Some("p"));
		assert_eq!(select_host(&topology, &read(ReadPreferenceMode::PrimaryPreferred)).as_deref(), Some("p"));
		assert_eq!(select_host(&topology, &read(ReadPreferenceMode::Secondary)).as_deref(), Some("s"));
		assert_eq!(select_host(&topology, &read(ReadPreferenceMode::SecondaryPreferred)).as_deref(), Some("s"));
	}

	#[test]
	fn falls_back_between_primary_and_secondaries() {
		let primary_only = replica_set(vec![server("p", ServerType::RsPrimary, 5)]);
		assert_eq!(select_host(&primary_only, &read(ReadPreferenceMode::SecondaryPreferred)).as_deref(), Some("p"));
		assert_eq!(select_host(&primary_only, &read(ReadPreferenceMode::Secondary)), None);

		let secondary_only = replica_set(vec![server("s", ServerType::RsSecondary, 5)]);
		assert_eq!(select_host(&secondary_only, &read(ReadPreferenceMode::PrimaryPreferred)).as_deref(), Some("s"));
		assert_eq!(select_host(&secondary_only, &SelectionCriteria::Write), None);
	}

	#[test]
	fn nearest_respects_latency_window() {
		let topology = replica_set(vec![
			server("p", ServerType::RsPrimary, 50),
			server("a", ServerType::RsSecondary, 5),
			server("b", ServerType::RsSecondary, 15)
		]);

		for _ in 0..50 {
			let host = select_host(&topology, &read(ReadPreferenceMode::Nearest)).unwrap();
			assert!(host == "a" || host == "b", "{} is outside the latency window", host);
		}
	}

	#[test]
	fn first_matching_tag_set_wins() {
		let tagged = |host, dc: &str| ServerDescription {
			tags: [("dc".to_string(), dc.to_string())].into_iter().collect(),
			..server(host, ServerType::RsSecondary, 5)
		};
		let topology = replica_set(vec![tagged("east", "east"), tagged("west", "west")]);

		let tags = |dc: &str| [("dc".to_string(), dc.to_string())].into_iter().collect::<TagSet>();
		let preference = ReadPreference::new(ReadPreferenceMode::Secondary)
			.with_tag_sets(vec![tags("north"), tags("west"), tags("east")]);
		assert_eq!(select_host(&topology, &SelectionCriteria::Read(preference)).as_deref(), Some("west"));

		let preference = ReadPreference::new(ReadPreferenceMode::Secondary).with_tag_sets(vec![tags("north")]);
		assert_eq!(select_host(&topology, &SelectionCriteria::Read(preference)), None);

		let preference = ReadPreference::new(ReadPreferenceMode::Secondary).with_tag_sets(vec![TagSet::new()]);
		assert!(select_host(&topology, &SelectionCriteria::Read(preference)).is_some());
	}

	#[test]
	fn filters_stale_secondaries() {
		let now = SystemTime::now();
		let lagging = ServerDescription {
			last_write_date: Some(now - Duration::from_secs(300)),
			..server("lagging", ServerType::RsSecondary, 5)
		};
		let topology = replica_set(vec![
			server("p", ServerType::RsPrimary, 5),
			server("fresh", ServerType::RsSecondary, 5),
			lagging
		]);

		let preference = ReadPreference::new(ReadPreferenceMode::Secondary).with_max_staleness(Duration::from_secs(90));
		for _ in 0..20 {
			assert_eq!(select_host(&topology, &SelectionCriteria::Read(preference.clone())).as_deref(), Some("fresh"));
		}
	}

	#[test]
	fn filters_stale_secondaries_without_primary() {
		let now = SystemTime::now();
		let topology = replica_set(vec![
			server("fresh", ServerType::RsSecondary, 5),
			ServerDescription {
				last_write_date: Some(now - Duration::from_secs(300)),
				..server("lagging", ServerType::RsSecondary, 5)
			}
		]);

		let preference = ReadPreference::new(ReadPreferenceMode::Nearest).with_max_staleness(Duration::from_secs(90));
		assert_eq!(select_host(&topology, &SelectionCriteria::Read(preference)).as_deref(), Some("fresh"));
	}

	#[test]
	fn excluded_servers_are_a_last_resort() {
		let topology = replica_set(vec![
			server("p", ServerType::RsPrimary, 5),
			server("a", ServerType::RsSecondary, 5),
			server("b", ServerType::RsSecondary, 5)
		]);

		let criteria = read(ReadPreferenceMode::Secondary);
		for _ in 0..20 {
			let selected = select(&topology, &criteria, &[address("a")], Duration::from_millis(15)).unwrap();
			assert_eq!(selected.address, address("b"));
		}

		let selected = select(&topology, &SelectionCriteria::Write, &[address("p")], Duration::from_millis(15)).unwrap();
		assert_eq!(selected.address, address("p"));
	}

	#[test]
	fn unknown_topology_selects_nothing() {
		let topology = TopologyDescription::new(&[address("a"), address("b")], false, None, HEARTBEAT);
		assert!(select(&topology, &SelectionCriteria::Write, &[], Duration::from_millis(15)).is_none());
	}

	#[test]
	fn sharded_uses_any_mongos() {
		let mut topology = TopologyDescription::new(&[address("m1"), address("m2")], false, None, HEARTBEAT);
		for host in ["m1", "m2"] {
			let mongos = ServerDescription { set_name: None, ..server(host, ServerType::Mongos, 5) };
			topology = topology.apply(mongos).unwrap().0;
		}
		assert_eq!(topology.topology_type, TopologyType::Sharded);
		assert!(select(&topology, &read(ReadPreferenceMode::Secondary), &[], Duration::from_millis(15)).is_some());
		assert!(select(&topology, &SelectionCriteria::Write, &[], Duration::from_millis(15)).is_some());
	}
}

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

use {
	crate::{
		Error, Result,
		apm::{Event, EventListeners},
		common::{ClientOptions, ConnectionPoolOptions, ServerAddress, ServerSelectionConfig, TagSet, MIN_HEARTBEAT_FREQUENCY},
		conn::{ConnectionOptions, HelloReply},
		monitor,
		pool::Pool,
		select::{self, SelectionCriteria},
		wire
	},
	async_std::{channel::{self, Sender}, sync::{Condvar, Mutex}},
	bson::oid::ObjectId,
	std::{
		collections::{HashMap, HashSet},
		fmt,
		sync::{Arc, PoisonError, RwLock, atomic::{AtomicBool, Ordering}},
		time::{Duration, Instant, SystemTime}
	}
};

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.md#topologytype
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TopologyType {
	Single,
	ReplicaSetNoPrimary,
	ReplicaSetWithPrimary,
	Sharded,
	Unknown
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.md#servertype
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerType {
	Unknown,
	Standalone,
	Mongos,
	RsPrimary,
	RsSecondary,
	RsArbiter,
	RsOther,
	RsGhost
}

impl ServerType {
	pub fn is_data_bearing(self) -> bool {
		matches!(self, Self::Standalone | Self::Mongos | Self::RsPrimary | Self::RsSecondary)
	}

	fn is_replica_set_member(self) -> bool {
		matches!(self, Self::RsPrimary | Self::RsSecondary | Self::RsArbiter | Self::RsOther)
	}
}

/// The kind of the last failure seen against a server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorState {
	None,
	Network,
	Timeout,
	Auth,
	Protocol
}

impl From<&Error> for ErrorState {
	fn from(e: &Error) -> Self {
		match e {
			Error::Network(_)  => Self::Network,
			Error::Timeout(_)  => Self::Timeout,
			Error::Auth(_)     => Self::Auth,
			Error::Protocol(_) => Self::Protocol,
			_                  => Self::None
		}
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.md#serverdescription
#[derive(Debug, Clone)]
pub struct ServerDescription {
	pub address:                 ServerAddress,
	pub server_type:             ServerType,
	/// Moving average of heartbeat round trips, `None` until the first reply.
	pub round_trip_time:         Option<Duration>,
	pub last_update_time:        Option<SystemTime>,
	pub last_write_date:         Option<SystemTime>,
	pub min_wire_version:        i32,
	pub max_wire_version:        i32,
	pub me:                      Option<ServerAddress>,
	pub hosts:                   Vec<ServerAddress>,
	pub passives:                Vec<ServerAddress>,
	pub arbiters:                Vec<ServerAddress>,
	pub primary:                 Option<ServerAddress>,
	pub set_name:                Option<String>,
	pub set_version:             Option<i64>,
	pub election_id:             Option<ObjectId>,
	pub tags:                    TagSet,
	pub logical_session_timeout: Option<Duration>,
	pub error_state:             ErrorState,
	pub error:                   Option<String>
}

fn parse_addresses(list: &[String]) -> Vec<ServerAddress> {
	list.iter()
		.filter_map(|host| match host.parse() {
			Ok(address) => Some(address),
			Err(_) => {
				tracing::warn!(host = %host, "ignoring invalid host in hello reply");
				None
			}
		})
		.collect()
}

impl ServerDescription {
	/// An unknown server that has not been checked yet.
	pub fn new(address: ServerAddress) -> Self {
		Self {
			address,
			server_type:             ServerType::Unknown,
			round_trip_time:         None,
			last_update_time:        None,
			last_write_date:         None,
			min_wire_version:        0,
			max_wire_version:        0,
			me:                      None,
			hosts:                   Vec::new(),
			passives:                Vec::new(),
			arbiters:                Vec::new(),
			primary:                 None,
			set_name:                None,
			set_version:             None,
			election_id:             None,
			tags:                    TagSet::new(),
			logical_session_timeout: None,
			error_state:             ErrorState::None,
			error:                   None
		}
	}

	/// Describes a server from its `hello` reply.
	pub fn from_hello(address: ServerAddress, reply: &HelloReply, round_trip_time: Duration) -> Self {
		let server_type = match reply {
			HelloReply { msg: Some(msg), .. } if msg == "isdbgrid"            => ServerType::Mongos,
			HelloReply { set_name: Some(_), .. } if reply.is_writable_primary() => ServerType::RsPrimary,
			HelloReply { set_name: Some(_), secondary: Some(true), .. }        => ServerType::RsSecondary,
			HelloReply { set_name: Some(_), arbiter_only: Some(true), .. }     => ServerType::RsArbiter,
			HelloReply { set_name: Some(_), .. }                               => ServerType::RsOther,
			HelloReply { isreplicaset: Some(true), .. }                        => ServerType::RsGhost,
			_                                                                  => ServerType::Standalone
		};

		Self {
			server_type,
			round_trip_time:         Some(round_trip_time),
			last_update_time:        Some(SystemTime::now()),
			last_write_date:         reply.last_write.as_ref().map(|w| w.last_write_date.to_system_time()),
			min_wire_version:        reply.min_wire_version,
			max_wire_version:        reply.max_wire_version,
			me:                      reply.me.as_ref().and_then(|me| me.parse().ok()),
			hosts:                   parse_addresses(&reply.hosts),
			passives:                parse_addresses(&reply.passives),
			arbiters:                parse_addresses(&reply.arbiters),
			primary:                 reply.primary.as_ref().and_then(|p| p.parse().ok()),
			set_name:                reply.set_name.clone(),
			set_version:             reply.set_version,
			election_id:             reply.election_id,
			tags:                    reply.tags.clone(),
			logical_session_timeout: reply.logical_session_timeout_minutes
				.and_then(|m| u64::try_from(m).ok())
				.map(|m| Duration::from_secs(m * 60)),
			..Self::new(address)
		}
	}

	/// An unknown server carrying the error that made it so.
	pub fn failed(address: ServerAddress, error: &Error) -> Self {
		Self {
			last_update_time: Some(SystemTime::now()),
			error_state:      ErrorState::from(error),
			error:            Some(error.to_string()),
			..Self::new(address)
		}
	}

	fn unknown_because(address: ServerAddress, reason: String) -> Self {
		Self {
			last_update_time: Some(SystemTime::now()),
			error:            Some(reason),
			..Self::new(address)
		}
	}

	/// Whether this server has answered a heartbeat with a usable role.
	pub fn is_available(&self) -> bool {
		self.server_type != ServerType::Unknown && self.round_trip_time.is_some()
	}

	fn members(&self) -> impl Iterator<Item = &ServerAddress> {
		self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
	}

	/// Equality ignoring measurements that change with every heartbeat.
	pub fn is_equivalent(&self, other: &Self) -> bool {
		self.address == other.address
			&& self.server_type == other.server_type
			&& self.min_wire_version == other.min_wire_version
			&& self.max_wire_version == other.max_wire_version
			&& self.me == other.me
			&& self.hosts == other.hosts
			&& self.passives == other.passives
			&& self.arbiters == other.arbiters
			&& self.primary == other.primary
			&& self.set_name == other.set_name
			&& self.set_version == other.set_version
			&& self.election_id == other.election_id
			&& self.tags == other.tags
			&& self.logical_session_timeout == other.logical_session_timeout
			&& self.error == other.error
	}
}

/// Infers the topology type from the current servers and the configuration alone.
pub fn infer_topology_type<'a>(
	servers:           impl IntoIterator<Item = &'a ServerDescription>,
	direct_connection: bool,
	replica_set:       bool
) -> TopologyType {
	if direct_connection {
		return TopologyType::Single;
	}

	let (mut total, mut mongos, mut primaries, mut members, mut standalones) = (0, 0, 0, 0, 0);
	for server in servers {
		total += 1;
		match server.server_type {
			ServerType::Mongos     => mongos += 1,
			ServerType::Standalone => standalones += 1,
			ServerType::RsPrimary  => primaries += 1,
			_ => ()
		}
		// ghosts alone do not identify a replica set
		if server.server_type.is_replica_set_member() {
			members += 1;
		}
	}

	if mongos > 0 {
		TopologyType::Sharded
	} else if primaries == 1 {
		TopologyType::ReplicaSetWithPrimary
	} else if members > 0 || replica_set {
		TopologyType::ReplicaSetNoPrimary
	} else if total == 1 && standalones == 1 {
		TopologyType::Single
	} else {
		TopologyType::Unknown
	}
}

/// An immutable snapshot of the deployment. Every update produces a new value.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.md#topologydescription
#[derive(Debug, Clone)]
pub struct TopologyDescription {
	pub topology_type:           TopologyType,
	pub set_name:                Option<String>,
	pub servers:                 HashMap<ServerAddress, ServerDescription>,
	pub max_set_version:         Option<i64>,
	pub max_election_id:         Option<ObjectId>,
	pub version:                 u64,
	pub updated:                 SystemTime,
	pub compatibility_error:     Option<String>,
	pub logical_session_timeout: Option<Duration>,
	pub heartbeat_frequency:     Duration,
	direct_connection:           bool
}

impl TopologyDescription {
	pub fn new(
		seeds:               &[ServerAddress],
		direct_connection:   bool,
		replica_set:         Option<String>,
		heartbeat_frequency: Duration
	) -> Self {
		let mut description = Self {
			topology_type:           TopologyType::Unknown,
			set_name:                replica_set,
			servers:                 seeds.iter().map(|a| (a.clone(), ServerDescription::new(a.clone()))).collect(),
			max_set_version:         None,
			max_election_id:         None,
			version:                 0,
			updated:                 SystemTime::now(),
			compatibility_error:     None,
			logical_session_timeout: None,
			heartbeat_frequency,
			direct_connection
		};
		description.refresh();
		description
	}

	pub fn primary(&self) -> Option<&ServerDescription> {
		self.servers.values().find(|s| s.server_type == ServerType::RsPrimary)
	}

	/// Notes an error against a server while keeping its type and everything it reported.
	pub fn record_error(&self, address: &ServerAddress, error: &Error) -> Option<Self> {
		let mut next = self.clone();
		let server = next.servers.get_mut(address)?;
		server.error_state = ErrorState::from(error);
		server.error = Some(error.to_string());
		next.version += 1;
		next.updated = SystemTime::now();
		Some(next)
	}

	/// Applies a server's new description, returning the next snapshot and the servers
	/// that should be checked immediately. Reports about servers that are no longer part
	/// of the topology are ignored.
	pub fn apply(&self, description: ServerDescription) -> Option<(Self, Vec<ServerAddress>)> {
		if !self.servers.contains_key(&description.address) {
			return None;
		}

		let mut next = self.clone();
		next.version += 1;
		next.updated = SystemTime::now();
		let check_now = next.update(description);
		next.refresh();
		Some((next, check_now))
	}

	fn update(&mut self, description: ServerDescription) -> Vec<ServerAddress> {
		let address = description.address.clone();

		if self.direct_connection {
			let description = match &self.set_name {
				Some(expected) if description.server_type != ServerType::Unknown
					&& description.set_name.as_ref() != Some(expected) => ServerDescription::unknown_because(
					address.clone(), format!("replica set name does not match `{}`", expected)),
				_ => description
			};
			self.servers.insert(address, description);
			return Vec::new();
		}

		match description.server_type {
			ServerType::Unknown | ServerType::RsGhost => {
				self.servers.insert(address, description);
			}
			ServerType::Standalone => if self.servers.len() > 1 || self.set_name.is_some() {
				tracing::debug!(%address, "removing standalone from multi-server topology");
				self.servers.remove(&address);
			} else {
				self.servers.insert(address, description);
			},
			ServerType::Mongos => if self.set_name.is_some() || self.has_members_other_than(&address) {
				tracing::debug!(%address, "removing mongos from replica set");
				self.servers.remove(&address);
			} else {
				self.servers.insert(address, description);
			},
			ServerType::RsPrimary => self.update_from_primary(description),
			ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther =>
				return self.update_from_member(description)
		}

		Vec::new()
	}

	fn has_members_other_than(&self, address: &ServerAddress) -> bool {
		self.servers.values().any(|s| &s.address != address && s.server_type.is_replica_set_member())
	}

	fn has_mongos(&self) -> bool {
		self.servers.values().any(|s| s.server_type == ServerType::Mongos)
	}

	/// Adopts the first set name seen; false if the server belongs to another set.
	fn check_set_name(&mut self, description: &ServerDescription) -> bool {
		match &self.set_name {
			None => {
				self.set_name = description.set_name.clone();
				true
			}
			Some(name) => description.set_name.as_ref() == Some(name)
		}
	}

	fn update_from_primary(&mut self, description: ServerDescription) {
		let address = description.address.clone();
		if self.has_mongos() || !self.check_set_name(&description) {
			tracing::debug!(%address, set_name = ?description.set_name, "removing primary of a foreign deployment");
			self.servers.remove(&address);
			return;
		}

		if let (Some(set_version), Some(election_id)) = (description.set_version, description.election_id) {
			if let (Some(max_set_version), Some(max_election_id)) = (self.max_set_version, self.max_election_id) {
				if (max_set_version, max_election_id) > (set_version, election_id) {
					tracing::info!(%address, set_version, %election_id, "ignoring stale primary");
					self.servers.insert(address.clone(), ServerDescription::unknown_because(
						address, "primary is stale".to_string()));
					return;
				}
			}
			self.max_election_id = Some(election_id);
		}

		if let Some(set_version) = description.set_version {
			if self.max_set_version.map_or(true, |max| set_version > max) {
				self.max_set_version = Some(set_version);
			}
		}

		// a new primary demotes the old one
		for server in self.servers.values_mut()
			.filter(|s| s.server_type == ServerType::RsPrimary && s.address != address) {
			tracing::info!(address = %server.address, "demoting old primary");
			*server = ServerDescription::unknown_because(server.address.clone(), "a new primary was elected".to_string());
		}

		// the primary's view of the membership is authoritative
		let members = description.members().cloned().collect::<HashSet<_>>();
		self.servers.retain(|address, _| members.contains(address));
		for member in &members {
			if !self.servers.contains_key(member) {
				self.servers.insert(member.clone(), ServerDescription::new(member.clone()));
			}
		}

		if members.contains(&address) {
			self.servers.insert(address, description);
		}
	}

	fn update_from_member(&mut self, description: ServerDescription) -> Vec<ServerAddress> {
		let address = description.address.clone();
		if self.has_mongos() || !self.check_set_name(&description) {
			tracing::debug!(%address, set_name = ?description.set_name, "removing member of a foreign deployment");
			self.servers.remove(&address);
			return Vec::new();
		}

		if description.me.as_ref().map_or(false, |me| me != &address) {
			tracing::debug!(%address, me = ?description.me, "removing member reporting another address");
			self.servers.remove(&address);
			return Vec::new();
		}

		let has_primary = self.servers.values()
			.any(|s| s.server_type == ServerType::RsPrimary && s.address != address);
		let reported_primary = description.primary.clone();

		if !has_primary {
			for member in description.members() {
				if !self.servers.contains_key(member) {
					self.servers.insert(member.clone(), ServerDescription::new(member.clone()));
				}
			}
		}

		self.servers.insert(address.clone(), description);

		match reported_primary {
			Some(primary) if !has_primary && primary != address => match self.servers.get_mut(&primary) {
				Some(server) if server.server_type != ServerType::RsPrimary => {
					tracing::debug!(%primary, reported_by = %address, "marking reported primary");
					server.server_type = ServerType::RsPrimary;
					vec![primary]
				}
				_ => Vec::new()
			},
			_ => Vec::new()
		}
	}

	/// Recomputes everything derived from the server set.
	fn refresh(&mut self) {
		self.topology_type = infer_topology_type(self.servers.values(), self.direct_connection, self.set_name.is_some());

		self.compatibility_error = self.servers.values()
			.filter(|s| s.is_available())
			.find_map(|s| if s.min_wire_version > wire::MAX_WIRE_VERSION {
				Some(format!("server at {} requires wire version {}, but this client only supports up to {}",
					s.address, s.min_wire_version, wire::MAX_WIRE_VERSION))
			} else if s.max_wire_version < wire::MIN_WIRE_VERSION {
				Some(format!("server at {} reports wire version {}, but this client requires at least {}",
					s.address, s.max_wire_version, wire::MIN_WIRE_VERSION))
			} else {
				None
			});

		let mut data_bearing = self.servers.values()
			.filter(|s| s.is_available() && s.server_type.is_data_bearing())
			.map(|s| s.logical_session_timeout)
			.peekable();
		self.logical_session_timeout = match data_bearing.peek() {
			None => None,
			Some(_) => data_bearing.try_fold(Duration::MAX, |min, timeout| timeout.map(|t| min.min(t)))
		};
	}

	/// Equality ignoring measurements and the version counter.
	pub fn is_equivalent(&self, other: &Self) -> bool {
		self.topology_type == other.topology_type
			&& self.set_name == other.set_name
			&& self.compatibility_error == other.compatibility_error
			&& self.servers.len() == other.servers.len()
			&& self.servers.iter().all(|(address, s)| other.servers.get(address)
				.map_or(false, |o| s.is_equivalent(o)))
	}
}

impl fmt::Display for TopologyDescription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?} [", self.topology_type)?;
		let mut servers = self.servers.values().collect::<Vec<_>>();
		servers.sort_by(|a, b| a.address.cmp(&b.address));
		for (i, server) in servers.iter().enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			write!(f, "{}: {:?}", server.address, server.server_type)?;
			if let Some(error) = &server.error {
				write!(f, " ({})", error)?;
			}
		}
		f.write_str("]")
	}
}

/// A node known to the topology, with its pool and a handle to its monitor.
pub(crate) struct Server {
	pub address: ServerAddress,
	pub pool:    Arc<Pool>,
	check:       Sender<()>
}

impl fmt::Debug for Server {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Server")
			.field("address", &self.address)
			.field("pool", &self.pool)
			.finish()
	}
}

impl Server {
	/// Wakes the monitor for an immediate heartbeat. Requests coalesce.
	pub fn request_check(&self) {
		let _ = self.check.try_send(());
	}

	fn close(&self) {
		self.check.close();
		self.pool.close();
	}
}

struct State {
	description: Arc<TopologyDescription>,
	servers:     HashMap<ServerAddress, Arc<Server>>
}

/// Owns the current description, the servers and their monitors.
pub(crate) struct Topology {
	state:              RwLock<State>,
	/// Latest published description version.
	changed:            Mutex<u64>,
	condvar:            Condvar,
	connection_options: Arc<ConnectionOptions>,
	pool_options:       ConnectionPoolOptions,
	selection:          ServerSelectionConfig,
	listeners:          EventListeners,
	closed:             AtomicBool
}

impl fmt::Debug for Topology {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Topology")
			.field("description", &self.description())
			.field("closed", &self.closed)
			.finish()
	}
}

impl Topology {
	pub fn new(options: &ClientOptions, connection_options: Arc<ConnectionOptions>) -> Arc<Self> {
		let description = TopologyDescription::new(
			&options.hosts,
			options.direct_connection,
			options.replica_set.clone(),
			options.server_selection.heartbeat_frequency
		);
		let version = description.version;

		let topology = Arc::new(Self {
			state:              RwLock::new(State { description: Arc::new(description), servers: HashMap::new() }),
			changed:            Mutex::new(version),
			condvar:            Condvar::new(),
			listeners:          options.event_listeners.clone(),
			connection_options,
			pool_options:       options.pool,
			selection:          options.server_selection,
			closed:             AtomicBool::new(false)
		});

		let started = {
			let mut state = topology.state.write().unwrap_or_else(PoisonError::into_inner);
			let seeds = state.description.servers.keys().cloned().collect::<Vec<_>>();
			let mut started = Vec::with_capacity(seeds.len());
			for address in seeds {
				let server = topology.start_server(address.clone());
				state.servers.insert(address, server.clone());
				started.push(server);
			}
			started
		};
		topology.announce(&started);

		topology
	}

	/// Creates a server with its pool and monitor. Events are published separately by
	/// `announce` once the state lock is released.
	fn start_server(self: &Arc<Self>, address: ServerAddress) -> Arc<Server> {
		let (check, requests) = channel::bounded(1);
		let pool = Pool::new(address.clone(), self.pool_options, self.connection_options.clone());
		async_std::task::spawn(monitor::run(Arc::downgrade(self), address.clone(), requests));
		Arc::new(Server { address, pool, check })
	}

	/// Listeners may call back into the topology, so this must run without the state lock.
	fn announce(&self, started: &[Arc<Server>]) {
		for server in started {
			tracing::debug!(address = %server.address, "adding server");
			self.listeners.dispatch(Event::ServerOpening { address: &server.address });
			server.pool.announce();
		}
	}

	pub fn description(&self) -> Arc<TopologyDescription> {
		self.state.read().unwrap_or_else(PoisonError::into_inner).description.clone()
	}

	pub fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
		self.state.read().unwrap_or_else(PoisonError::into_inner).servers.get(address).cloned()
	}

	pub fn connection_options(&self) -> &ConnectionOptions {
		&self.connection_options
	}

	pub fn listeners(&self) -> &EventListeners {
		&self.listeners
	}

	pub fn heartbeat_frequency(&self) -> Duration {
		self.selection.heartbeat_frequency
	}

	pub fn server_selection_timeout(&self) -> Duration {
		self.selection.server_selection_timeout
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Publishes a server's new description and brings servers, pools and monitors in
	/// line with the resulting snapshot.
	pub async fn update_server(self: &Arc<Self>, description: ServerDescription) {
		if self.is_closed() {
			return;
		}

		let (previous, next, check_now, removed, started) = {
			let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
			let Some((next, check_now)) = state.description.apply(description) else { return };
			let next = Arc::new(next);

			let gone = state.servers.keys()
				.filter(|address| !next.servers.contains_key(*address))
				.cloned()
				.collect::<Vec<_>>();
			let removed = gone.iter().filter_map(|address| state.servers.remove(address)).collect::<Vec<_>>();

			let mut started = Vec::new();
			for address in next.servers.keys() {
				if !state.servers.contains_key(address) {
					let server = self.start_server(address.clone());
					state.servers.insert(address.clone(), server.clone());
					started.push(server);
				}
			}

			let check_now = check_now.iter()
				.filter_map(|address| state.servers.get(address).cloned())
				.collect::<Vec<_>>();
			let previous = std::mem::replace(&mut state.description, next.clone());
			(previous, next, check_now, removed, started)
		};

		self.announce(&started);

		for server in removed {
			tracing::debug!(address = %server.address, "removing server");
			server.close();
			self.listeners.dispatch(Event::ServerClosed { address: &server.address });
		}

		for server in check_now {
			server.request_check();
		}

		self.publish(&previous, &next).await;
	}

	/// Records an error that does not change what is known about the server's role.
	async fn record_error(&self, address: &ServerAddress, error: &Error) {
		if self.is_closed() {
			return;
		}

		let (previous, next) = {
			let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
			let Some(next) = state.description.record_error(address, error) else { return };
			let next = Arc::new(next);
			(std::mem::replace(&mut state.description, next.clone()), next)
		};
		self.publish(&previous, &next).await;
	}

	async fn publish(&self, previous: &TopologyDescription, next: &TopologyDescription) {
		if !previous.is_equivalent(next) {
			if previous.topology_type != next.topology_type {
				tracing::info!(from = ?previous.topology_type, to = ?next.topology_type, "topology type changed");
			}
			tracing::debug!(topology = %next, "topology changed");
			self.listeners.dispatch(Event::TopologyDescriptionChanged { previous, new: next });
		}

		let mut changed = self.changed.lock().await;
		*changed = (*changed).max(next.version);
		self.condvar.notify_all();
	}

	/// Marks a server unknown after a failure and clears its pool.
	pub async fn mark_failed(self: &Arc<Self>, address: &ServerAddress, error: &Error, recheck: bool) {
		self.update_server(ServerDescription::failed(address.clone(), error)).await;
		if let Some(server) = self.server(address) {
			server.pool.invalidate_all(error);
			if recheck {
				server.request_check();
			}
		}
	}

	/// Updates the topology after an operation against `address` failed. `generation` is
	/// the generation of the connection that saw the error, `None` if it happened while
	/// the connection was being established.
	pub async fn handle_error(self: &Arc<Self>, address: &ServerAddress, error: &Error, generation: Option<u64>) {
		let Some(server) = self.server(address) else { return };
		if generation.map_or(false, |g| g < server.pool.generation()) {
			// the pool was already cleared for an earlier error
			return;
		}

		let establishing = generation.is_none();
		if matches!(error, Error::Network(_) | Error::Protocol(_) | Error::Auth(_))
			|| (establishing && error.is_timeout()) {
			tracing::debug!(%address, %error, "marking server unknown");
			self.mark_failed(address, error, true).await;
		} else if error.is_timeout() {
			// the connection is discarded, the server keeps its role and its pool
			tracing::debug!(%address, %error, "operation timed out");
			self.record_error(address, error).await;
		} else if error.is_state_change() {
			tracing::info!(%address, %error, "server changed state");
			self.update_server(ServerDescription::unknown_because(address.clone(), error.to_string())).await;
			if error.is_shutdown() {
				server.pool.invalidate_all(error);
			}
			server.request_check();
		}
	}

	pub fn request_all_checks(&self) {
		let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
		for server in state.servers.values() {
			server.request_check();
		}
	}

	/// Waits until a description newer than `seen` is published or `timeout` elapses.
	pub async fn wait_for_change(&self, seen: u64, timeout: Duration) {
		let changed = self.changed.lock().await;
		let _ = self.condvar.wait_timeout_until(changed, timeout, |version| *version > seen).await;
	}

	/// Selects a server matching `criteria`, waiting for topology changes until `deadline`.
	/// Servers in `excluded` are only used when nothing else matches.
	pub async fn select_server(
		&self,
		criteria: &SelectionCriteria,
		deadline: Instant,
		excluded: &[ServerAddress]
	) -> Result<Arc<Server>> {
		let mut waited = false;
		loop {
			if self.is_closed() {
				return Err(Error::ClientClosed);
			}

			let description = self.description();
			if let Some(error) = &description.compatibility_error {
				return Err(Error::ServerSelection(error.clone()));
			}

			if let Some(selected) = select::select(&description, criteria, excluded, self.selection.local_threshold) {
				if let Some(server) = self.server(&selected.address) {
					tracing::trace!(address = %server.address, %criteria, "selected server");
					return Ok(server);
				}
			}

			let now = Instant::now();
			if now >= deadline {
				return Err(Error::ServerSelection(format!(
					"no server matching {} within {:?}, topology: {}",
					criteria, self.selection.server_selection_timeout, description)));
			}

			if !waited {
				tracing::debug!(%criteria, topology = %description, "waiting for a suitable server");
				waited = true;
			}

			self.request_all_checks();
			self.wait_for_change(description.version, (deadline - now).min(MIN_HEARTBEAT_FREQUENCY)).await;
		}
	}

	/// Stops all monitors and closes all pools.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		let servers = {
			let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
			state.servers.drain().map(|(_, server)| server).collect::<Vec<_>>()
		};

		for server in servers {
			server.close();
			self.listeners.dispatch(Event::ServerClosed { address: &server.address });
		}
		tracing::debug!("topology closed");
	}
}

impl Drop for Topology {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use {super::*, bson::doc, proptest::prelude::*};

	fn address(host: &str) -> ServerAddress {
		ServerAddress::new(host, 27017)
	}

	fn hello(fields: bson::Document) -> HelloReply {
		let mut reply = doc! { "minWireVersion": 6, "maxWireVersion": 17, "logicalSessionTimeoutMinutes": 30 };
		reply.extend(fields);
		bson::from_document(reply).unwrap()
	}

	fn member(host: &str, primary: bool, hosts: &[&str], reported_primary: Option<&str>) -> ServerDescription {
		let mut fields = doc! {
			"isWritablePrimary": primary,
			"secondary": !primary,
			"setName": "rs",
			"me": format!("{}:27017", host),
			"hosts": hosts.iter().map(|h| format!("{}:27017", h)).collect::<Vec<_>>()
		};
		if let Some(p) = reported_primary {
			fields.insert("primary", format!("{}:27017", p));
		}
		ServerDescription::from_hello(address(host), &hello(fields), Duration::from_millis(5))
	}

	fn replica_set(hosts: &[&str]) -> TopologyDescription {
		let seeds = hosts.iter().map(|h| address(h)).collect::<Vec<_>>();
		TopologyDescription::new(&seeds, false, None, Duration::from_secs(10))
	}

	fn apply(topology: &TopologyDescription, description: ServerDescription) -> TopologyDescription {
		topology.apply(description).unwrap().0
	}

	fn server_type(topology: &TopologyDescription, host: &str) -> Option<ServerType> {
		topology.servers.get(&address(host)).map(|s| s.server_type)
	}

	#[test]
	fn classifies_hello_replies() {
		let classify = |fields| ServerDescription::from_hello(address("a"), &hello(fields), Duration::ZERO).server_type;
		assert_eq!(classify(doc! { "msg": "isdbgrid" }), ServerType::Mongos);
		assert_eq!(classify(doc! { "setName": "rs", "isWritablePrimary": true }), ServerType::RsPrimary);
		assert_eq!(classify(doc! { "setName": "rs", "ismaster": true }), ServerType::RsPrimary);
		assert_eq!(classify(doc! { "setName": "rs", "secondary": true }), ServerType::RsSecondary);
		assert_eq!(classify(doc! { "setName": "rs", "arbiterOnly": true }), ServerType::RsArbiter);
		assert_eq!(classify(doc! { "setName": "rs", "hidden": true }), ServerType::RsOther);
		assert_eq!(classify(doc! { "isreplicaset": true }), ServerType::RsGhost);
		assert_eq!(classify(doc! { "isWritablePrimary": true }), ServerType::Standalone);
	}

	#[test]
	fn primary_switch_leaves_one_primary() {
		let hosts = ["a", "b", "c"];
		let mut topology = replica_set(&hosts);
		topology = apply(&topology, member("a", true, &hosts, Some("a")));
		topology = apply(&topology, member("b", false, &hosts, Some("a")));
		topology = apply(&topology, member("c", false, &hosts, Some("a")));
		assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);

		let (topology, check_now) = topology.apply(member("a", false, &hosts, Some("b"))).unwrap();
		assert_eq!(check_now, vec![address("b")]);
		assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(topology.primary().map(|s| &s.address), Some(&address("b")));
		assert_eq!(topology.servers.values().filter(|s| s.server_type == ServerType::RsPrimary).count(), 1);

		let selected = select::select(&topology, &SelectionCriteria::Write, &[], Duration::from_millis(15));
		assert_eq!(selected.map(|s| &s.address), Some(&address("b")));
	}

	#[test]
	fn new_primary_demotes_old_one() {
		let hosts = ["a", "b"];
		let mut topology = replica_set(&hosts);
		topology = apply(&topology, member("a", true, &hosts, None));
		topology = apply(&topology, member("b", true, &hosts, None));
		assert_eq!(server_type(&topology, "a"), Some(ServerType::Unknown));
		assert_eq!(server_type(&topology, "b"), Some(ServerType::RsPrimary));
	}

	#[test]
	fn primary_membership_is_authoritative() {
		let topology = replica_set(&["a", "b", "c"]);
		let topology = apply(&topology, member("a", true, &["a", "b", "d"], None));
		let mut hosts = topology.servers.keys().map(|a| a.host.as_str()).collect::<Vec<_>>();
		hosts.sort_unstable();
		assert_eq!(hosts, ["a", "b", "d"]);
	}

	#[test]
	fn secondaries_only_add_members() {
		let topology = replica_set(&["a", "b"]);
		let topology = apply(&topology, member("a", false, &["a", "c"], None));
		assert_eq!(topology.servers.len(), 3);
		assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
	}

	#[test]
	fn stale_primary_is_marked_unknown() {
		let hosts = ["a", "b"];
		let with_election = |host, set_version, id: [u8; 12]| {
			let mut description = member(host, true, &hosts, None);
			description.set_version = Some(set_version);
			description.election_id = Some(ObjectId::from_bytes(id));
			description
		};

		let topology = replica_set(&hosts);
		let topology = apply(&topology, with_election("a", 2, [2; 12]));
		let topology = apply(&topology, with_election("b", 1, [9; 12]));
		assert_eq!(server_type(&topology, "a"), Some(ServerType::RsPrimary));
		assert_eq!(server_type(&topology, "b"), Some(ServerType::Unknown));
		assert_eq!(topology.servers[&address("b")].error.as_deref(), Some("primary is stale"));
		assert_eq!(topology.max_set_version, Some(2));
	}

	#[test]
	fn set_name_mismatch_removes_server() {
		let seeds = [address("a"), address("b")];
		let topology = TopologyDescription::new(&seeds, false, Some("other".into()), Duration::from_secs(10));
		assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
		let topology = apply(&topology, member("a", false, &["a", "b"], None));
		assert!(!topology.servers.contains_key(&address("a")));
	}

	#[test]
	fn standalones() {
		let standalone = |host| ServerDescription::from_hello(
			address(host), &hello(doc! { "isWritablePrimary": true }), Duration::ZERO);

		let single = apply(&replica_set(&["a"]), standalone("a"));
		assert_eq!(single.topology_type, TopologyType::Single);

		let multi = apply(&replica_set(&["a", "b"]), standalone("a"));
		assert_eq!(multi.topology_type, TopologyType::Unknown);
		assert!(!multi.servers.contains_key(&address("a")));
	}

	#[test]
	fn mongos_makes_sharded() {
		let mongos = ServerDescription::from_hello(address("a"), &hello(doc! { "msg": "isdbgrid" }), Duration::ZERO);
		let topology = apply(&replica_set(&["a", "b"]), mongos);
		assert_eq!(topology.topology_type, TopologyType::Sharded);
		assert_eq!(topology.logical_session_timeout, Some(Duration::from_secs(30 * 60)));
	}

	#[test]
	fn failure_keeps_server() {
		let hosts = ["a", "b"];
		let topology = apply(&replica_set(&hosts), member("a", true, &hosts, None));
		let error = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
		let topology = apply(&topology, ServerDescription::failed(address("a"), &error));

		let a = &topology.servers[&address("a")];
		assert_eq!(a.server_type, ServerType::Unknown);
		assert_eq!(a.error_state, ErrorState::Network);
		assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
	}

	#[test]
	fn ignores_removed_servers() {
		let topology = replica_set(&["a"]);
		assert!(topology.apply(ServerDescription::new(address("z"))).is_none());
	}

	#[test]
	fn reports_incompatible_wire_versions() {
		let old = ServerDescription::from_hello(
			address("a"), &hello(doc! { "isWritablePrimary": true, "maxWireVersion": 2 }), Duration::ZERO);
		let topology = apply(&replica_set(&["a"]), old);
		assert!(topology.compatibility_error.is_some());
	}

	#[test]
	fn direct_connection_is_single() {
		let topology = TopologyDescription::new(&[address("a")], true, None, Duration::from_secs(10));
		assert_eq!(topology.topology_type, TopologyType::Single);
		let topology = apply(&topology, member("a", false, &["a", "b"], None));
		assert_eq!(topology.topology_type, TopologyType::Single);
		assert_eq!(topology.servers.len(), 1);
	}

	fn arb_server_type() -> impl Strategy<Value = ServerType> {
		prop_oneof![
			Just(ServerType::Unknown),
			Just(ServerType::Standalone),
			Just(ServerType::Mongos),
			Just(ServerType::RsPrimary),
			Just(ServerType::RsSecondary),
			Just(ServerType::RsArbiter),
			Just(ServerType::RsOther),
			Just(ServerType::RsGhost)
		]
	}

	proptest! {
		#[test]
		fn type_inference_ignores_order(
			types in prop::collection::vec(arb_server_type(), 0..8),
			direct in any::<bool>(),
			replica_set in any::<bool>()
		) {
			let servers = types.iter().enumerate()
				.map(|(i, t)| ServerDescription { server_type: *t, ..ServerDescription::new(ServerAddress::new("h", i as u16 + 1)) })
				.collect::<Vec<_>>();
			let forward = infer_topology_type(&servers, direct, replica_set);
			prop_assert_eq!(forward, infer_topology_type(servers.iter().rev(), direct, replica_set));

			if direct {
				prop_assert_eq!(forward, TopologyType::Single);
			} else if types.contains(&ServerType::Mongos) {
				prop_assert_eq!(forward, TopologyType::Sharded);
			} else if types.iter().filter(|t| **t == ServerType::RsPrimary).count() == 1 {
				prop_assert_eq!(forward, TopologyType::ReplicaSetWithPrimary);
			}
		}
	}
}

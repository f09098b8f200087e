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
	crate::{Client, Error, Result, apm::EventListeners, wire::Compressor},
	bson::{doc, Bson, Document},
	std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, time::Duration}
};

pub const DEFAULT_PORT:                     u16      = 27017;
pub const DEFAULT_CONNECT_TIMEOUT:          Duration = Duration::from_secs(20);
pub const DEFAULT_MIN_POOL_SIZE:            usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:            usize    = 50;
pub const DEFAULT_MAX_CONNECTING:           usize    = 2;
pub const DEFAULT_MAINTENANCE_INTERVAL:     Duration = Duration::from_millis(500);
pub const DEFAULT_LOCAL_THRESHOLD:          Duration = Duration::from_millis(15);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_FREQUENCY:      Duration = Duration::from_secs(10);
pub const MIN_HEARTBEAT_FREQUENCY:          Duration = Duration::from_millis(500);
/// Interval at which a primary writes a no-op to the oplog while idle.
pub const IDLE_WRITE_PERIOD:                Duration = Duration::from_secs(10);
pub const SMALLEST_MAX_STALENESS:           Duration = Duration::from_secs(90);

/// A `host:port` pair. Host names are compared case-insensitively, so they are
/// stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
	pub host: String,
	pub port: u16
}

impl ServerAddress {
	pub fn new(host: &str, port: u16) -> Self {
		Self { host: host.to_ascii_lowercase(), port }
	}
}

impl FromStr for ServerAddress {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let invalid = || Error::invalid_options(format!("invalid address `{}`", s));

		let (host, port) = if let Some(rest) = s.strip_prefix('[') {
			// ipv6 literal, optionally followed by `:port`
			let end = rest.find(']').ok_or_else(invalid)?;
			let port = match &rest[end + 1..] {
				"" => None,
				tail => Some(tail.strip_prefix(':').ok_or_else(invalid)?)
			};
			(&rest[..end], port)
		} else {
			match s.split_once(':') {
				// unbracketed ipv6 literals are ambiguous
				Some((_, port)) if port.contains(':') => return Err(invalid()),
				Some((host, port)) => (host, Some(port)),
				None => (s, None)
			}
		};

		if host.is_empty() || host.contains(&['[', ']'][..]) {
			return Err(Error::invalid_options(format!("invalid address `{}`", s)));
		}

		let port = match port {
			None => DEFAULT_PORT,
			Some(port) => match port.parse::<u16>() {
				Ok(port) if port != 0 => port,
				_ => return Err(Error::invalid_options(format!("invalid port in address `{}`", s)))
			}
		};

		Ok(Self::new(host, port))
	}
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/uri-options/uri-options.md
#[derive(Debug, Clone)]
pub struct ClientOptions {
	pub hosts:                  Vec<ServerAddress>,
	pub app_name:               Option<String>,
	/// Talk to the single seed only; never discover other members.
	pub direct_connection:      bool,
	pub replica_set:            Option<String>,
	pub compressors:            Vec<Compressor>,
	/// -1 selects the zlib default.
	pub zlib_compression_level: i32,
	pub connect_timeout:        Duration,
	/// Default deadline of a single operation, covering selection, checkout and the round trip.
	pub timeout:                Option<Duration>,
	pub retry_reads:            bool,
	pub retry_writes:           bool,
	pub credential:             Option<Credential>,
	pub server_selection:       ServerSelectionConfig,
	pub pool:                   ConnectionPoolOptions,
	pub read_preference:        ReadPreference,
	pub read_concern:           Option<ReadConcern>,
	pub write_concern:          Option<WriteConcern>,
	pub tls:                    Option<TlsOptions>,
	pub event_listeners:        EventListeners
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			hosts:                  vec![ServerAddress::new("localhost", DEFAULT_PORT)],
			app_name:               None,
			direct_connection:      false,
			replica_set:            None,
			compressors:            Vec::new(),
			zlib_compression_level: -1,
			connect_timeout:        DEFAULT_CONNECT_TIMEOUT,
			timeout:                None,
			retry_reads:            true,
			retry_writes:           true,
			credential:             None,
			server_selection:       ServerSelectionConfig::default(),
			pool:                   ConnectionPoolOptions::default(),
			read_preference:        ReadPreference::default(),
			read_concern:           None,
			write_concern:          None,
			tls:                    None,
			event_listeners:        EventListeners::default()
		}
	}
}

impl ClientOptions {
	pub fn connect(self) -> Result<Client> {
		Client::new(self)
	}

	/// Checks the options for contradictions. Runs once, when the client is created.
	pub fn validate(&self) -> Result<()> {
		if self.hosts.is_empty() {
			return Err(Error::invalid_options("at least one seed address is required"));
		}

		if self.direct_connection && self.hosts.len() > 1 {
			return Err(Error::invalid_options("directConnection requires exactly one seed"));
		}

		self.pool.validate()?;

		if self.server_selection.heartbeat_frequency < MIN_HEARTBEAT_FREQUENCY {
			return Err(Error::invalid_options(format!(
				"heartbeatFrequencyMS must be at least {} ms", MIN_HEARTBEAT_FREQUENCY.as_millis())));
		}

		self.read_preference.validate(self.server_selection.heartbeat_frequency)?;

		if let Some(credential) = &self.credential {
			credential.validate()?;
		}

		if let Some(wc) = &self.write_concern {
			if wc.w == Some(Acknowledgment::Nodes(0)) && wc.journal == Some(true) {
				return Err(Error::invalid_options("an unacknowledged write concern cannot request journaling"));
			}
		}

		if let Some(c) = self.compressors.iter().find(|c| !Compressor::supported().contains(c)) {
			return Err(Error::invalid_options(format!("compressor `{}` is not supported", c)));
		}

		if !(-1..=9).contains(&self.zlib_compression_level) {
			return Err(Error::invalid_options("zlibCompressionLevel must be within -1..=9"));
		}

		if let Some(tls) = &self.tls {
			if tls.crl_file.is_some() {
				return Err(Error::invalid_options("tlsCRLFile is not supported by the rustls backend"));
			}
			if tls.certificate_key_file_password.is_some() && tls.certificate_key_file.is_none() {
				return Err(Error::invalid_options("tlsCertificateKeyFilePassword requires tlsCertificateKeyFile"));
			}
		}

		Ok(())
	}
}

impl FromStr for ClientOptions {
	type Err = Error;

	/// Parses a `mongodb://[user[:password]@]host1[:port1][,host2...][/authdb][?options]`
	/// connection string.
	fn from_str(s: &str) -> Result<Self> {
		let mut self_ = Self::default();
		let mut s = s.strip_prefix("mongodb://")
			.ok_or_else(|| Error::invalid_options("connection string must start with `mongodb://`"))?;

		let end = s.find(['/', '?']).unwrap_or(s.len());
		let (authority, rest) = s.split_at(end);
		let (userinfo, hosts) = match authority.rfind('@') {
			Some(i) => (Some(&authority[..i]), &authority[i + 1..]),
			None    => (None, authority)
		};

		self_.hosts = hosts.split(',')
			.map(|h| percent_decode(h)?.parse())
			.collect::<Result<_>>()?;

		let mut credential = userinfo.map(|userinfo| -> Result<Credential> {
			let mut split = userinfo.splitn(2, ':');
			Ok(Credential {
				username: split.next().map(percent_decode).transpose()?,
				password: split.next().map(percent_decode).transpose()?,
				..Credential::default()
			})
		}).transpose()?;

		s = rest.strip_prefix('/').unwrap_or(rest);
		let (database, query) = match s.find('?') {
			Some(i) => (&s[..i], &s[i + 1..]),
			None    => (s.trim_start_matches('?'), "")
		};

		if !database.is_empty() {
			credential.get_or_insert_with(Credential::default).source = Some(percent_decode(database)?);
		}

		let mut tls_enabled = None;
		for pair in query.split('&').filter(|pair| !pair.is_empty()) {
			let (key, value) = pair.split_once('=')
				.ok_or_else(|| Error::invalid_options(format!("option `{}` has no value", pair)))?;
			let value = percent_decode(value)?;
			let value = value.as_str();

			match key.to_ascii_lowercase().as_str() {
				"appname"                       => self_.app_name = Some(value.to_string()),
				"authmechanism"                 => credential.get_or_insert_with(Credential::default)
					.mechanism = Some(value.parse()?),
				"authmechanismproperties"       => credential.get_or_insert_with(Credential::default)
					.mechanism_properties = parse_pairs(value)?,
				"authsource"                    => credential.get_or_insert_with(Credential::default)
					.source = Some(value.to_string()),
				"compressors"                   => self_.compressors = value.split(',')
					.map(str::parse)
					.collect::<Result<_>>()?,
				"connecttimeoutms"              => self_.connect_timeout = parse_millis(key, value)?,
				"directconnection"              => self_.direct_connection = parse_bool(key, value)?,
				"fsync"                         => self_.write_concern.get_or_insert_with(WriteConcern::default)
					.fsync = Some(parse_bool(key, value)?),
				"heartbeatfrequencyms"          => self_.server_selection.heartbeat_frequency = parse_millis(key, value)?,
				"journal"                       => self_.write_concern.get_or_insert_with(WriteConcern::default)
					.journal = Some(parse_bool(key, value)?),
				"localthresholdms"              => self_.server_selection.local_threshold = parse_millis(key, value)?,
				"maxconnecting"                 => self_.pool.max_connecting = parse_num(key, value)?,
				"maxidletimems"                 => self_.pool.max_idle_time = Some(parse_millis(key, value)?)
					.filter(|d| !d.is_zero()),
				"maxpoolsize"                   => self_.pool.max_pool_size = parse_num(key, value)?,
				"maxstalenessseconds"           => self_.read_preference.max_staleness =
					staleness_from_seconds(parse_num(key, value)?),
				"minpoolsize"                   => self_.pool.min_pool_size = parse_num(key, value)?,
				"readconcernlevel"              => self_.read_concern = Some(ReadConcern { level: value.parse()? }),
				"readpreference"                => self_.read_preference.mode = value.parse()?,
				"readpreferencetags"            => self_.read_preference.tag_sets.push(parse_pairs(value)?),
				"replicaset"                    => self_.replica_set = Some(value.to_string()),
				"retryreads"                    => self_.retry_reads = parse_bool(key, value)?,
				"retrywrites"                   => self_.retry_writes = parse_bool(key, value)?,
				"serverselectiontimeoutms"      => self_.server_selection.server_selection_timeout = parse_millis(key, value)?,
				"timeoutms"                     => self_.timeout = Some(parse_millis(key, value)?)
					.filter(|d| !d.is_zero()),
				"tls" | "ssl"                   => tls_enabled = Some(parse_bool(key, value)?),
				"tlsallowinvalidcertificates"   => self_.tls.get_or_insert_with(TlsOptions::default)
					.allow_invalid_certificates = parse_bool(key, value)?,
				"tlsallowinvalidhostnames"      => self_.tls.get_or_insert_with(TlsOptions::default)
					.allow_invalid_hostnames = parse_bool(key, value)?,
				"tlscafile"                     => self_.tls.get_or_insert_with(TlsOptions::default)
					.ca_file = Some(PathBuf::from(value)),
				"tlscertificatekeyfile"         => self_.tls.get_or_insert_with(TlsOptions::default)
					.certificate_key_file = Some(PathBuf::from(value)),
				"tlscertificatekeyfilepassword" => self_.tls.get_or_insert_with(TlsOptions::default)
					.certificate_key_file_password = Some(value.to_string()),
				"tlscrlfile"                    => self_.tls.get_or_insert_with(TlsOptions::default)
					.crl_file = Some(PathBuf::from(value)),
				"tlsinsecure"                   => if parse_bool(key, value)? {
					let tls = self_.tls.get_or_insert_with(TlsOptions::default);
					tls.allow_invalid_certificates = true;
					tls.allow_invalid_hostnames = true;
				},
				"w"                             => self_.write_concern.get_or_insert_with(WriteConcern::default)
					.w = Some(value.parse()?),
				"waitqueuetimeoutms"            => self_.pool.wait_queue_timeout = Some(parse_millis(key, value)?)
					.filter(|d| !d.is_zero()),
				"wtimeoutms"                    => self_.write_concern.get_or_insert_with(WriteConcern::default)
					.w_timeout = Some(parse_millis(key, value)?),
				"zlibcompressionlevel"          => self_.zlib_compression_level = parse_num(key, value)?,
				_ => return Err(Error::invalid_options(format!("unknown option `{}`", key)))
			}
		}

		match tls_enabled {
			Some(false) if self_.tls.is_some() =>
				return Err(Error::invalid_options("tls=false conflicts with other tls options")),
			Some(false) => (),
			Some(true) => { self_.tls.get_or_insert_with(TlsOptions::default); }
			None => ()
		}

		self_.credential = credential;
		Ok(self_)
	}
}

fn percent_decode(s: &str) -> Result<String> {
	percent_encoding::percent_decode_str(s)
		.decode_utf8()
		.map(|s| s.into_owned())
		.map_err(|_| Error::invalid_options(format!("`{}` is not valid percent-encoded UTF-8", s)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
	match value {
		"true"  => Ok(true),
		"false" => Ok(false),
		_       => Err(Error::invalid_options(format!("`{}` expects true or false, got `{}`", key, value)))
	}
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
	value.parse()
		.map_err(|_| Error::invalid_options(format!("`{}` expects a number, got `{}`", key, value)))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
	parse_num::<u64>(key, value).map(Duration::from_millis)
}

/// `k1:v1,k2:v2`
fn parse_pairs(value: &str) -> Result<HashMap<String, String>> {
	value.split(',')
		.filter(|pair| !pair.is_empty())
		.map(|pair| pair.split_once(':')
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.ok_or_else(|| Error::invalid_options(format!("expected `key:value`, got `{}`", pair))))
		.collect()
}

/// Negative values mean "no maximum".
pub fn staleness_from_seconds(seconds: i64) -> Option<Duration> {
	u64::try_from(seconds).ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
	pub username:             Option<String>,
	pub password:             Option<String>,
	pub source:               Option<String>,
	/// Negotiated with the server when `None`.
	pub mechanism:            Option<AuthMech>,
	pub mechanism_properties: HashMap<String, String>
}

impl Credential {
	/// The database the credential is defined in.
	pub fn resolved_source(&self) -> &str {
		match (&self.source, self.mechanism) {
			(Some(source), _) => source,
			(None, Some(AuthMech::MongoDbX509 | AuthMech::Plain | AuthMech::GssApi | AuthMech::MongoDbAws)) => "$external",
			(None, _) => "admin"
		}
	}

	fn validate(&self) -> Result<()> {
		match self.mechanism {
			Some(AuthMech::GssApi | AuthMech::MongoDbAws) => Err(Error::invalid_options(format!(
				"authentication mechanism {} is not supported", self.mechanism.map_or("", AuthMech::as_str)))),
			Some(AuthMech::MongoDbX509) if self.password.is_some() =>
				Err(Error::invalid_options("MONGODB-X509 does not accept a password")),
			Some(AuthMech::MongoDbX509) if self.source.as_deref().map_or(false, |s| s != "$external") =>
				Err(Error::invalid_options("MONGODB-X509 requires authSource $external")),
			Some(AuthMech::MongoDbX509) => Ok(()),
			_ if self.username.is_none() =>
				Err(Error::invalid_options("a username is required for authentication")),
			_ if self.password.is_none() =>
				Err(Error::invalid_options("a password is required for authentication")),
			_ => Ok(())
		}
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthMech {
	MongoDbX509,
	GssApi,
	Plain,
	ScramSha1,
	ScramSha256,
	MongoDbAws
}

impl AuthMech {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::MongoDbX509 => "MONGODB-X509",
			Self::GssApi      => "GSSAPI",
			Self::Plain       => "PLAIN",
			Self::ScramSha1   => "SCRAM-SHA-1",
			Self::ScramSha256 => "SCRAM-SHA-256",
			Self::MongoDbAws  => "MONGODB-AWS"
		}
	}
}

impl FromStr for AuthMech {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Ok(match s {
			"MONGODB-X509"  => Self::MongoDbX509,
			"GSSAPI"        => Self::GssApi,
			"PLAIN"         => Self::Plain,
			"SCRAM-SHA-1"   => Self::ScramSha1,
			"SCRAM-SHA-256" => Self::ScramSha256,
			"MONGODB-AWS"   => Self::MongoDbAws,
			_ => return Err(Error::invalid_options(format!("unknown authentication mechanism `{}`", s)))
		})
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.md#connection-pool-options
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionPoolOptions {
	/// 0 means unbounded.
	pub max_pool_size:        usize,
	pub min_pool_size:        usize,
	pub max_connecting:       usize,
	/// Idle connections older than this are closed. `None` keeps them forever.
	pub max_idle_time:        Option<Duration>,
	/// Upper bound on the time a checkout may wait for a free connection.
	pub wait_queue_timeout:   Option<Duration>,
	pub maintenance_interval: Duration
}

impl Default for ConnectionPoolOptions {
	fn default() -> Self {
		Self {
			max_pool_size:        DEFAULT_MAX_POOL_SIZE,
			min_pool_size:        DEFAULT_MIN_POOL_SIZE,
			max_connecting:       DEFAULT_MAX_CONNECTING,
			max_idle_time:        None,
			wait_queue_timeout:   None,
			maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL
		}
	}
}

impl ConnectionPoolOptions {
	fn validate(&self) -> Result<()> {
		if self.max_pool_size != 0 && self.min_pool_size > self.max_pool_size {
			Err(Error::invalid_options("minPoolSize must not exceed maxPoolSize"))
		} else if self.max_connecting == 0 {
			Err(Error::invalid_options("maxConnecting must be at least 1"))
		} else if self.maintenance_interval.is_zero() {
			Err(Error::invalid_options("the pool maintenance interval must not be zero"))
		} else {
			Ok(())
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServerSelectionConfig {
	/// Width of the latency window above the fastest eligible server.
	pub local_threshold:          Duration,
	pub server_selection_timeout: Duration,
	pub heartbeat_frequency:      Duration
}

impl Default for ServerSelectionConfig {
	fn default() -> Self {
		Self {
			local_threshold:          DEFAULT_LOCAL_THRESHOLD,
			server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
			heartbeat_frequency:      DEFAULT_HEARTBEAT_FREQUENCY
		}
	}
}

pub type TagSet = HashMap<String, String>;

/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.md#read-preference
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadPreference {
	pub mode:          ReadPreferenceMode,
	pub tag_sets:      Vec<TagSet>,
	pub max_staleness: Option<Duration>
}

impl Default for ReadPreference {
	fn default() -> Self {
		Self::new(ReadPreferenceMode::Primary)
	}
}

impl ReadPreference {
	pub fn new(mode: ReadPreferenceMode) -> Self {
		Self { mode, tag_sets: Vec::new(), max_staleness: None }
	}

	pub fn primary() -> Self {
		Self::new(ReadPreferenceMode::Primary)
	}

	pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
		self.tag_sets = tag_sets;
		self
	}

	pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
		self.max_staleness = Some(max_staleness);
		self
	}

	pub fn validate(&self, heartbeat_frequency: Duration) -> Result<()> {
		if self.mode == ReadPreferenceMode::Primary {
			if !self.tag_sets.is_empty() {
				return Err(Error::invalid_options("read preference primary cannot be combined with tags"));
			} else if self.max_staleness.is_some() {
				return Err(Error::invalid_options("read preference primary cannot be combined with maxStalenessSeconds"));
			}
		}

		if let Some(max_staleness) = self.max_staleness {
			let smallest = SMALLEST_MAX_STALENESS.max(heartbeat_frequency + IDLE_WRITE_PERIOD);
			if max_staleness < smallest {
				return Err(Error::invalid_options(format!(
					"maxStalenessSeconds must be at least {} seconds", smallest.as_secs())));
			}
		}

		Ok(())
	}

	/// The `$readPreference` field sent to mongos and replica set members.
	pub fn to_document(&self) -> Document {
		let mut doc = doc! { "mode": self.mode.as_str() };
		if !self.tag_sets.is_empty() {
			doc.insert("tags", self.tag_sets.iter()
				.map(|tags| Bson::Document(tags.iter()
					.map(|(k, v)| (k.clone(), Bson::String(v.clone())))
					.collect()))
				.collect::<Vec<_>>());
		}
		if let Some(max_staleness) = self.max_staleness {
			doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
		}
		doc
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum ReadPreferenceMode {
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl ReadPreferenceMode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Primary            => "primary",
			Self::PrimaryPreferred   => "primaryPreferred",
			Self::Secondary          => "secondary",
			Self::SecondaryPreferred => "secondaryPreferred",
			Self::Nearest            => "nearest"
		}
	}
}

impl FromStr for ReadPreferenceMode {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(Error::invalid_options(format!("unknown read preference `{}`", s)))
		})
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReadConcern {
	pub level: ReadConcernLevel
}

impl ReadConcern {
	pub fn to_document(&self) -> Document {
		doc! { "level": self.level.as_str() }
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadConcernLevel {
	Local,
	Majority,
	Linearizable,
	Available,
	Snapshot
}

impl ReadConcernLevel {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Local        => "local",
			Self::Majority     => "majority",
			Self::Linearizable => "linearizable",
			Self::Available    => "available",
			Self::Snapshot     => "snapshot"
		}
	}
}

impl FromStr for ReadConcernLevel {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Ok(match s {
			"local"        => Self::Local,
			"majority"     => Self::Majority,
			"linearizable" => Self::Linearizable,
			"available"    => Self::Available,
			"snapshot"     => Self::Snapshot,
			_ => return Err(Error::invalid_options(format!("unknown read concern level `{}`", s)))
		})
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/read-write-concern/read-write-concern.md#write-concern
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct WriteConcern {
	pub w:         Option<Acknowledgment>,
	pub w_timeout: Option<Duration>,
	pub journal:   Option<bool>,
	pub fsync:     Option<bool>
}

impl WriteConcern {
	pub fn majority() -> Self {
		Self { w: Some(Acknowledgment::Majority), ..Self::default() }
	}

	pub fn is_acknowledged(&self) -> bool {
		self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
	}

	pub fn to_document(&self) -> Document {
		let mut doc = Document::new();
		match &self.w {
			Some(Acknowledgment::Nodes(n)) => { doc.insert("w", *n as i32); }
			Some(Acknowledgment::Majority) => { doc.insert("w", "majority"); }
			Some(Acknowledgment::Tag(tag)) => { doc.insert("w", tag.as_str()); }
			None => ()
		}
		if let Some(w_timeout) = self.w_timeout {
			doc.insert("wtimeout", w_timeout.as_millis() as i64);
		}
		if let Some(journal) = self.journal {
			doc.insert("j", journal);
		}
		if let Some(fsync) = self.fsync {
			doc.insert("fsync", fsync);
		}
		doc
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Acknowledgment {
	Nodes(u32),
	Majority,
	Tag(String)
}

impl FromStr for Acknowledgment {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Ok(match s {
			"majority" => Self::Majority,
			s => match s.parse::<i64>() {
				Ok(n) => Self::Nodes(u32::try_from(n)
					.map_err(|_| Error::invalid_options(format!("w must not be negative, got {}", n)))?),
				Err(_) => Self::Tag(s.to_string())
			}
		})
	}
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TlsOptions {
	pub ca_file:                       Option<PathBuf>,
	pub certificate_key_file:          Option<PathBuf>,
	pub certificate_key_file_password: Option<String>,
	pub crl_file:                      Option<PathBuf>,
	pub allow_invalid_certificates:    bool,
	pub allow_invalid_hostnames:       bool
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_addresses() {
		assert_eq!("Example.com".parse::<ServerAddress>().unwrap(), ServerAddress::new("example.com", 27017));
		assert_eq!("db:27018".parse::<ServerAddress>().unwrap(), ServerAddress::new("db", 27018));
		assert_eq!("[::1]:27019".parse::<ServerAddress>().unwrap(), ServerAddress::new("::1", 27019));
		assert_eq!(ServerAddress::new("::1", 1).to_string(), "[::1]:1");
		assert!("db:0".parse::<ServerAddress>().is_err());
		assert!("db:x".parse::<ServerAddress>().is_err());
		assert!(":27017".parse::<ServerAddress>().is_err());
		assert_eq!("[::1]".parse::<ServerAddress>().unwrap(), ServerAddress::new("::1", 27017));
		assert!("::1".parse::<ServerAddress>().is_err());
		assert!("fe80::1:27017".parse::<ServerAddress>().is_err());
		assert!("[::1]x".parse::<ServerAddress>().is_err());
		assert!("[::1]:27017x".parse::<ServerAddress>().is_err());
		assert!("[::1".parse::<ServerAddress>().is_err());
		assert!("db]:1".parse::<ServerAddress>().is_err());
	}

	#[test]
	fn parses_connection_string() {
		let options: ClientOptions = "mongodb://al%40ice:p%3Ass@a:1,b/admin?replicaSet=rs0\
			&maxPoolSize=10&minPoolSize=2&maxConnecting=3&heartbeatFrequencyMS=1000\
			&readPreference=secondaryPreferred&readPreferenceTags=dc:ny,rack:1\
			&maxStalenessSeconds=120&w=majority&journal=true&retryWrites=false\
			&compressors=zstd,zlib&authMechanism=SCRAM-SHA-256".parse().unwrap();

		assert_eq!(options.hosts, vec![ServerAddress::new("a", 1), ServerAddress::new("b", 27017)]);
		assert_eq!(options.replica_set.as_deref(), Some("rs0"));
		assert_eq!(options.pool.max_pool_size, 10);
		assert_eq!(options.pool.min_pool_size, 2);
		assert_eq!(options.pool.max_connecting, 3);
		assert_eq!(options.server_selection.heartbeat_frequency, Duration::from_secs(1));
		assert_eq!(options.read_preference.mode, ReadPreferenceMode::SecondaryPreferred);
		assert_eq!(options.read_preference.tag_sets[0].get("dc").map(String::as_str), Some("ny"));
		assert_eq!(options.read_preference.max_staleness, Some(Duration::from_secs(120)));
		assert_eq!(options.write_concern.as_ref().unwrap().w, Some(Acknowledgment::Majority));
		assert!(!options.retry_writes);
		assert_eq!(options.compressors, vec![Compressor::Zstd, Compressor::Zlib]);

		let credential = options.credential.unwrap();
		assert_eq!(credential.username.as_deref(), Some("al@ice"));
		assert_eq!(credential.password.as_deref(), Some("p:ss"));
		assert_eq!(credential.resolved_source(), "admin");
		assert_eq!(credential.mechanism, Some(AuthMech::ScramSha256));
	}

	#[test]
	fn negative_staleness_is_unset() {
		let options: ClientOptions = "mongodb://a/?readPreference=secondary&maxStalenessSeconds=-1"
			.parse().unwrap();
		assert_eq!(options.read_preference.max_staleness, None);
		assert_eq!(staleness_from_seconds(-5), None);
		assert_eq!(staleness_from_seconds(0), Some(Duration::ZERO));
	}

	#[test]
	fn rejects_unknown_options() {
		assert!("mongodb://a/?bogus=1".parse::<ClientOptions>().is_err());
		assert!("mongodb://a/?retryReads=yes".parse::<ClientOptions>().is_err());
		assert!("postgres://a".parse::<ClientOptions>().is_err());
	}

	#[test]
	fn validates_options() {
		assert!(ClientOptions::default().validate().is_ok());

		let mut options = ClientOptions::default();
		options.pool.min_pool_size = 100;
		assert!(options.validate().is_err());

		let mut options = ClientOptions::default();
		options.read_preference = ReadPreference::new(ReadPreferenceMode::Secondary)
			.with_max_staleness(Duration::from_secs(10));
		assert!(options.validate().is_err());

		let mut options = ClientOptions::default();
		options.read_preference = ReadPreference::primary().with_max_staleness(Duration::from_secs(100));
		assert!(options.validate().is_err());

		let mut options = ClientOptions::default();
		options.hosts.push(ServerAddress::new("other", 27017));
		options.direct_connection = true;
		assert!(options.validate().is_err());

		let mut options = ClientOptions::default();
		options.credential = Some(Credential { username: Some("u".into()), ..Credential::default() });
		assert!(options.validate().is_err());

		let mut options = ClientOptions::default();
		options.credential = Some(Credential { mechanism: Some(AuthMech::GssApi), ..Credential::default() });
		assert!(options.validate().is_err());

		let mut options = ClientOptions::default();
		options.tls = Some(TlsOptions { crl_file: Some("crl.pem".into()), ..TlsOptions::default() });
		assert!(options.validate().is_err());
	}

	#[test]
	fn write_concern_document() {
		let wc = WriteConcern {
			w:         Some(Acknowledgment::Nodes(2)),
			w_timeout: Some(Duration::from_millis(500)),
			journal:   Some(true),
			fsync:     None
		};
		assert_eq!(wc.to_document(), doc! { "w": 2, "wtimeout": 500i64, "j": true });
		assert!(wc.is_acknowledged());
		assert!(!WriteConcern { w: Some(Acknowledgment::Nodes(0)), ..WriteConcern::default() }.is_acknowledged());
	}
}

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
		Error, Result, DRIVER_NAME,
		apm::{ConnectionClosedReason, Event, EventListeners},
		auth::{self, CommandStream},
		common::{ClientOptions, Credential, ServerAddress, TagSet},
		operation::check_reply,
		wire::{self, Compressor, DocumentSequence, Message}
	},
	async_std::{future::timeout, net::TcpStream},
	async_trait::async_trait,
	bson::{oid::ObjectId, Document},
	futures_io::{AsyncRead, AsyncWrite},
	rustls::ClientConfig,
	serde::{Serialize, Deserialize},
	std::{
		io, pin::Pin, sync::{Arc, atomic::{AtomicI32, Ordering}},
		task::{Context, Poll}, time::{Duration, Instant}
	}
};

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
	REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Settings shared by every connection a client opens.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionOptions {
	pub connect_timeout:        Duration,
	pub tls:                    Option<Arc<ClientConfig>>,
	pub credential:             Option<Credential>,
	pub compressors:            Vec<Compressor>,
	pub zlib_compression_level: i32,
	pub app_name:               Option<String>,
	pub event_listeners:        EventListeners
}

impl ConnectionOptions {
	pub fn new(options: &ClientOptions) -> Result<Self> {
		Ok(Self {
			connect_timeout:        options.connect_timeout,
			tls:                    options.tls.as_ref().map(crate::tls::client_config).transpose()?,
			credential:             options.credential.clone(),
			compressors:            options.compressors.clone(),
			zlib_compression_level: options.zlib_compression_level,
			app_name:               options.app_name.clone(),
			event_listeners:        options.event_listeners.clone()
		})
	}
}

pub(crate) enum Stream {
	Tcp(TcpStream),
	Tls(Box<async_tls::client::TlsStream<TcpStream>>)
}

impl std::fmt::Debug for Stream {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str(match self {
			Self::Tcp(..) => "Stream::Tcp(...)",
			Self::Tls(..) => "Stream::Tls(...)"
		})
	}
}

impl Stream {
	async fn connect(address: &ServerAddress, tls: Option<&Arc<ClientConfig>>) -> Result<Self> {
		let tcp = TcpStream::connect((address.host.as_str(), address.port)).await?;
		tcp.set_nodelay(true)?;

		Ok(match tls {
			None => Self::Tcp(tcp),
			Some(config) => Self::Tls(Box::new(async_tls::TlsConnector::from(config.clone())
				.connect(&address.host, tcp)
				.await?))
		})
	}
}

impl AsyncRead for Stream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
			Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf)
		}
	}
}

impl AsyncWrite for Stream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
			Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf)
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
			Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx)
		}
	}

	fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Self::Tcp(stream) => Pin::new(stream).poll_close(cx),
			Self::Tls(stream) => Pin::new(stream.as_mut()).poll_close(cx)
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HelloCommand<'a> {
	hello:                i32,
	#[serde(skip_serializing_if = "Option::is_none")]
	client:               Option<ClientMetadata<'a>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	compression:          Option<&'a [Compressor]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	sasl_supported_mechs: Option<String>,
	#[serde(rename = "$db")]
	db:                   &'a str
}

/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.md
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMetadata<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	application: Option<AppMetadata<'a>>,
	driver:      DriverMetadata<'a>,
	os:          OsMetadata<'a>
}

#[derive(Debug, Clone, Serialize)]
struct AppMetadata<'a> {
	name: &'a str
}

#[derive(Debug, Clone, Serialize)]
struct DriverMetadata<'a> {
	name:    &'a str,
	version: &'a str
}

#[derive(Debug, Clone, Serialize)]
struct OsMetadata<'a> {
	#[serde(rename = "type")]
	r#type:       &'a str,
	architecture: &'a str
}

impl<'a> ClientMetadata<'a> {
	fn new(app_name: Option<&'a str>) -> Self {
		Self {
			application: app_name.map(|name| AppMetadata { name }),
			driver: DriverMetadata {
				name:    DRIVER_NAME,
				version: env!("CARGO_PKG_VERSION")
			},
			os: OsMetadata {
				r#type:       std::env::consts::OS,
				architecture: std::env::consts::ARCH
			}
		}
	}
}

/// The fields of a `hello` reply the client acts upon.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloReply {
	pub is_writable_primary:             Option<bool>,
	#[serde(rename = "ismaster")]
	pub is_master:                       Option<bool>,
	pub secondary:                       Option<bool>,
	pub arbiter_only:                    Option<bool>,
	pub hidden:                          Option<bool>,
	pub isreplicaset:                    Option<bool>,
	// sharded instances
	pub msg:                             Option<String>,
	// replica sets
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i64>,
	pub election_id:                     Option<ObjectId>,
	pub primary:                         Option<String>,
	pub me:                              Option<String>,
	pub hosts:                           Vec<String>,
	pub passives:                        Vec<String>,
	pub arbiters:                        Vec<String>,
	pub tags:                            TagSet,
	pub last_write:                      Option<LastWrite>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub max_bson_object_size:            Option<i64>,
	pub max_message_size_bytes:          Option<i64>,
	pub max_write_batch_size:            Option<i64>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub compression:                     Vec<String>,
	pub sasl_supported_mechs:            Option<Vec<String>>
}

impl HelloReply {
	pub fn is_writable_primary(&self) -> bool {
		self.is_writable_primary.or(self.is_master).unwrap_or(false)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
	pub last_write_date: bson::DateTime
}

/// A single stateful socket to one node. Serves one request at a time.
#[derive(Debug)]
pub struct Connection {
	id:               u64,
	address:          ServerAddress,
	generation:       u64,
	stream:           Stream,
	compressor:       Option<Compressor>,
	zlib_level:       i32,
	max_message_size: usize,
	hello:            HelloReply,
	last_used:        Instant,
	broken:           bool,
	monitoring:       bool,
	/// Handshake and authentication commands are not published as command events.
	established:      bool,
	listeners:        EventListeners
}

impl Connection {
	/// Opens an authenticated connection for the pool.
	pub(crate) async fn open(
		address:    &ServerAddress,
		options:    &ConnectionOptions,
		id:         u64,
		generation: u64
	) -> Result<Self> {
		Self::establish(address, options, id, generation, false).await
	}

	/// Opens an unauthenticated connection for heartbeats.
	pub(crate) async fn open_monitoring(address: &ServerAddress, options: &ConnectionOptions) -> Result<Self> {
		Self::establish(address, options, 0, 0, true).await
	}

	async fn establish(
		address:    &ServerAddress,
		options:    &ConnectionOptions,
		id:         u64,
		generation: u64,
		monitoring: bool
	) -> Result<Self> {
		let establish = async {
			let stream = Stream::connect(address, options.tls.as_ref()).await?;
			let mut conn = Self {
				id,
				address:          address.clone(),
				generation,
				stream,
				compressor:       None,
				zlib_level:       options.zlib_compression_level,
				max_message_size: wire::DEFAULT_MAX_MESSAGE_SIZE,
				hello:            HelloReply::default(),
				last_used:        Instant::now(),
				broken:           false,
				monitoring,
				established:      false,
				listeners:        options.event_listeners.clone()
			};

			conn.handshake(options).await?;

			if !monitoring {
				if let Some(credential) = &options.credential {
					let mechs = conn.hello.sasl_supported_mechs.clone();
					auth::authenticate(&mut conn, credential, mechs.as_deref()).await?;
				}
			}

			conn.established = true;
			Ok::<Self, Error>(conn)
		};

		let conn = timeout(options.connect_timeout, establish).await
			.map_err(|_| Error::Timeout(format!("connecting to {}", address)))??;
		tracing::debug!(%address, id, generation, monitoring, compressor = ?conn.compressor, "connection established");
		Ok(conn)
	}

	/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.md
	async fn handshake(&mut self, options: &ConnectionOptions) -> Result<()> {
		let sasl_supported_mechs = match &options.credential {
			Some(credential) if credential.mechanism.is_none() && !self.monitoring => credential.username.as_ref()
				.map(|user| format!("{}.{}", credential.resolved_source(), user)),
			_ => None
		};

		let command = bson::to_document(&HelloCommand {
			hello:       1,
			client:      Some(ClientMetadata::new(options.app_name.as_deref())),
			compression: Some(options.compressors.as_slice()),
			sasl_supported_mechs,
			db:          "admin"
		})?;

		let reply = check_reply(self.command(command, None).await?)?;
		self.hello = bson::from_document(reply)?;

		if let Some(size) = self.hello.max_message_size_bytes {
			self.max_message_size = usize::try_from(size).unwrap_or(wire::DEFAULT_MAX_MESSAGE_SIZE);
		}

		self.compressor = options.compressors.iter()
			.find(|c| self.hello.compression.iter().any(|s| s == c.as_str()))
			.copied();

		Ok(())
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn compressor(&self) -> Option<Compressor> {
		self.compressor
	}

	/// The reply to the connection handshake.
	pub fn hello_reply(&self) -> &HelloReply {
		&self.hello
	}

	pub fn last_used(&self) -> Instant {
		self.last_used
	}

	/// Broken connections are never reused.
	pub fn is_broken(&self) -> bool {
		self.broken
	}

	pub(crate) fn mark_broken(&mut self) {
		self.broken = true;
	}

	pub async fn command(&mut self, command: Document, deadline: Option<Instant>) -> Result<Document> {
		self.send_and_receive(command, Vec::new(), deadline).await
	}

	/// Sends one command and waits for its reply. Any fault once the request is on
	/// the wire, including the deadline passing or the future being dropped, leaves
	/// the connection broken.
	pub async fn send_and_receive(
		&mut self,
		command:   Document,
		sequences: Vec<DocumentSequence>,
		deadline:  Option<Instant>
	) -> Result<Document> {
		let command_name = command.keys().next().cloned().unwrap_or_default();
		let database_name = command.get_str("$db").unwrap_or_default().to_string();
		let request_id = next_request_id();
		let mut message = Message::new(request_id, command);
		message.sequences = sequences;

		let start = Instant::now();
		let publish = self.established && !self.monitoring;
		if publish {
			self.listeners.dispatch(Event::CommandStarted {
				address:       &self.address,
				command:       &message.document,
				database_name: &database_name,
				command_name:  &command_name,
				request_id,
				connection_id: self.id
			});
		}

		let result = self.round_trip(&message, &command_name, deadline).await;

		if publish {
			let duration = start.elapsed();
			match &result {
				Ok(reply) => self.listeners.dispatch(Event::CommandSucceeded {
					address:       &self.address,
					duration,
					reply,
					command_name:  &command_name,
					request_id,
					connection_id: self.id
				}),
				Err(failure) => self.listeners.dispatch(Event::CommandFailed {
					address:       &self.address,
					duration,
					failure,
					command_name:  &command_name,
					request_id,
					connection_id: self.id
				})
			}
		}

		result
	}

	async fn round_trip(&mut self, message: &Message, command_name: &str, deadline: Option<Instant>) -> Result<Document> {
		let bytes = match self.compressor {
			Some(compressor) if wire::is_compressible(command_name) =>
				message.encode_compressed(compressor, self.zlib_level)?,
			_ => message.encode()?
		};

		// nothing has been written yet, so the connection stays usable
		let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
		if remaining.map_or(false, |remaining| remaining.is_zero()) {
			return Err(Error::Timeout(format!("{} on {}", command_name, self.address)));
		}

		// cleared only once the reply has been read in full
		self.broken = true;

		let max_message_size = self.max_message_size;
		let stream = &mut self.stream;
		let io = async {
			wire::write_message(stream, &bytes).await?;
			wire::read_message(stream, max_message_size).await
		};

		let reply = match remaining {
			None => io.await?,
			Some(remaining) => timeout(remaining, io).await
				.map_err(|_| Error::Timeout(format!("{} on {}", command_name, self.address)))??
		};

		if reply.response_to != message.request_id {
			return Err(Error::protocol(format!(
				"reply is for request {}, expected {}", reply.response_to, message.request_id)));
		}

		self.broken = false;
		self.last_used = Instant::now();
		Ok(reply.document)
	}

	/// Shuts the transport down.
	pub(crate) fn close(self, reason: ConnectionClosedReason) {
		tracing::debug!(address = %self.address, id = self.id, ?reason, "connection closed");
		self.listeners.dispatch(Event::ConnectionClosed {
			address:       &self.address,
			connection_id: self.id,
			reason
		});
		if let Stream::Tcp(stream) = &self.stream {
			let _ = stream.shutdown(std::net::Shutdown::Both);
		}
	}
}

#[async_trait]
impl CommandStream for Connection {
	async fn command(&mut self, command: Document) -> Result<Document> {
		Connection::command(self, command, None).await
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::test_util::{hello_reply, MockReply, MockServer},
		bson::doc
	};

	fn options() -> ConnectionOptions {
		ConnectionOptions::new(&ClientOptions::default()).unwrap()
	}

	#[async_std::test]
	async fn handshake_and_command() {
		let server = MockServer::start(|cmd| if cmd.contains_key("hello") {
			MockReply::Reply(hello_reply(doc! { "compression": ["zlib"] }))
		} else {
			MockReply::Reply(doc! { "ok": 1, "echo": cmd.get_str("$db").unwrap_or_default() })
		}).await;

		let mut options = options();
		options.compressors = vec![Compressor::Zstd, Compressor::Zlib];
		let mut conn = Connection::open(&server.address, &options, 1, 0).await.unwrap();
		assert_eq!(conn.compressor(), Some(Compressor::Zlib));
		assert!(conn.hello_reply().is_writable_primary());

		let reply = conn.command(doc! { "ping": 1, "$db": "admin" }, None).await.unwrap();
		assert_eq!(reply.get_str("echo").unwrap(), "admin");
		assert!(!conn.is_broken());
	}

	#[async_std::test]
	async fn deadline_breaks_connection() {
		let server = MockServer::start(|cmd| if cmd.contains_key("hello") {
			MockReply::Reply(hello_reply(doc! {}))
		} else {
			MockReply::Delay(Duration::from_millis(500), doc! { "ok": 1 })
		}).await;

		let mut conn = Connection::open(&server.address, &options(), 1, 0).await.unwrap();
		let err = conn.command(doc! { "ping": 1, "$db": "admin" }, Some(Instant::now() + Duration::from_millis(50)))
			.await.unwrap_err();
		assert!(err.is_timeout());
		assert!(conn.is_broken());
	}

	#[async_std::test]
	async fn elapsed_deadline_keeps_connection() {
		let server = MockServer::start(|cmd| if cmd.contains_key("hello") {
			MockReply::Reply(hello_reply(doc! {}))
		} else {
			MockReply::Reply(doc! { "ok": 1 })
		}).await;

		let mut conn = Connection::open(&server.address, &options(), 1, 0).await.unwrap();
		let err = conn.command(doc! { "ping": 1, "$db": "admin" }, Some(Instant::now()))
			.await.unwrap_err();
		assert!(err.is_timeout());
		assert!(!conn.is_broken());

		// the request was never written, so the stream is still in sync
		assert!(conn.command(doc! { "ping": 1, "$db": "admin" }, None).await.is_ok());
	}

	#[async_std::test]
	async fn hangup_is_network_error() {
		let server = MockServer::start(|cmd| if cmd.contains_key("hello") {
			MockReply::Reply(hello_reply(doc! {}))
		} else {
			MockReply::Hangup
		}).await;

		let mut conn = Connection::open(&server.address, &options(), 1, 0).await.unwrap();
		let err = conn.command(doc! { "ping": 1, "$db": "admin" }, None).await.unwrap_err();
		assert!(err.is_network());
		assert!(conn.is_broken());
	}

	#[async_std::test]
	async fn refused_connection_is_network_error() {
		let address = crate::test_util::unreachable_address().await;
		assert!(Connection::open(&address, &options(), 1, 0).await.unwrap_err().is_network());
	}
}

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

#![warn(clippy::all)]
#![forbid(unsafe_code)]

use {
	self::{
		conn::ConnectionOptions,
		operation::{check_reply, Intent, RetryContext, Session},
		topology::{Server, ServerDescription, ServerType, Topology, TopologyDescription}
	},
	bson::Document,
	std::{sync::{Arc, atomic::{AtomicI64, Ordering}}, time::Instant}
};

pub use self::{
	common::*,
	coll::*,
	cursor::*,
	db::*,
	error::{Error, Result},
	operation::Operation
};

pub mod apm;
pub mod auth;
pub mod common;
pub mod conn;
pub mod error;
pub mod operation;
pub mod pool;
pub mod select;
pub mod topology;
pub mod wire;
mod coll;
mod cursor;
mod db;
mod monitor;
mod tls;
#[cfg(test)]
mod test_util;

pub static DRIVER_NAME: &str = "aiomongo";

/// Handle to a deployment. Cheap to clone; all clones share pools and monitors.
#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

pub struct ClientInner {
	pub options: ClientOptions,
	topology:    Arc<Topology>,
	txn_number:  AtomicI64
}

impl std::ops::Deref for Client {
	type Target = ClientInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl std::fmt::Debug for ClientInner {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("ClientInner")
			.field("options", &self.options)
			.field("topology", &self.topology)
			.finish()
	}
}

impl Client {
	/// Validates the options and starts monitoring the seeds. Does not wait for any
	/// server to respond.
	pub fn new(options: ClientOptions) -> Result<Self> {
		options.validate()?;
		let connection_options = Arc::new(ConnectionOptions::new(&options)?);
		let topology = Topology::new(&options, connection_options);
		tracing::debug!(hosts = ?options.hosts, "client created");

		Ok(Self(Arc::new(ClientInner {
			options,
			topology,
			txn_number: AtomicI64::new(1)
		})))
	}

	/// The current view of the deployment.
	pub fn topology(&self) -> Arc<TopologyDescription> {
		self.topology.description()
	}

	/// Runs a command against the primary, without retries.
	pub async fn run_command(&self, database: &str, command: Document) -> Result<Document> {
		self.execute(Operation::read(database, command).with_read_preference(ReadPreference::primary())).await
	}

	/// Selects a server, checks out a connection and runs the operation on it. Retryable
	/// operations are attempted once more on another server after a network error.
	pub async fn execute(&self, operation: Operation) -> Result<Document> {
		self.execute_with_address(operation).await.map(|(reply, _)| reply)
	}

	/// Like `execute`, also returning the server that produced the reply.
	pub(crate) async fn execute_with_address(&self, mut operation: Operation) -> Result<(Document, ServerAddress)> {
		if self.topology.is_closed() {
			return Err(Error::ClientClosed);
		}

		let deadline = operation.timeout.or(self.options.timeout).map(|timeout| Instant::now() + timeout);
		if operation.intent == Intent::Read && operation.read_preference.is_none() {
			operation.read_preference = Some(self.options.read_preference.clone());
		}

		let criteria = operation.criteria(&self.options.read_preference);
		let mut retry = RetryContext::new(deadline);
		let mut session = None;

		loop {
			let server = match self.select_server(&operation, &criteria, &retry).await {
				Ok(server) => server,
				// a failed retry selection reports what made the retry necessary
				Err(e) => return Err(retry.first_error.take().unwrap_or(e))
			};

			let description = self.topology.description();
			let server_description = description.servers.get(&server.address).cloned()
				.unwrap_or_else(|| ServerDescription::new(server.address.clone()));
			let retryable = self.is_retryable(&operation, &description, &server_description);

			if retryable && operation.intent == Intent::Write && session.is_none() {
				session = Some(Session::new(self.txn_number.fetch_add(1, Ordering::Relaxed)));
			}

			match self.attempt(&server, &operation, &description, &server_description, session.as_ref(), deadline).await {
				Ok(reply) => return Ok((reply, server.address.clone())),
				Err(e) if retryable && retry.can_retry(&e) => {
					tracing::debug!(address = %server.address, operation = operation.name(), error = %e, "retrying operation");
					retry.record(server.address.clone(), e);
				}
				Err(e) => {
					tracing::debug!(address = %server.address, operation = operation.name(), error = %e, "operation failed");
					return Err(e);
				}
			}
		}
	}

	async fn select_server(
		&self,
		operation: &Operation,
		criteria:  &select::SelectionCriteria,
		retry:     &RetryContext
	) -> Result<Arc<Server>> {
		if let Some(address) = &operation.pinned {
			return self.topology.server(address).ok_or_else(|| Error::ServerSelection(
				format!("{} is no longer part of the topology", address)));
		}

		let mut deadline = Instant::now() + self.topology.server_selection_timeout();
		if let Some(operation_deadline) = retry.deadline {
			deadline = deadline.min(operation_deadline);
		}
		self.topology.select_server(criteria, deadline, &retry.excluded).await
	}

	/// see https://github.com/mongodb/specifications/blob/master/source/retryable-writes/retryable-writes.md#supported-server-versions
	fn is_retryable(&self, operation: &Operation, description: &TopologyDescription, server: &ServerDescription) -> bool {
		operation.retryable && match operation.intent {
			Intent::Read => self.options.retry_reads,
			Intent::Write => self.options.retry_writes
				&& description.logical_session_timeout.is_some()
				&& server.server_type != ServerType::Standalone
				&& operation.write_concern.as_ref().map_or(true, WriteConcern::is_acknowledged)
		}
	}

	async fn attempt(
		&self,
		server:             &Server,
		operation:          &Operation,
		description:        &TopologyDescription,
		server_description: &ServerDescription,
		session:            Option<&Session>,
		deadline:           Option<Instant>
	) -> Result<Document> {
		let mut conn = match server.pool.checkout(deadline).await {
			Ok(conn) => conn,
			Err(e) => {
				// running out of operation time while opening says nothing about the server
				let cut_short = e.is_timeout() && deadline.map_or(false, |d| Instant::now() >= d);
				if !cut_short {
					self.topology.handle_error(&server.address, &e, None).await;
				}
				return Err(e);
			}
		};

		let generation = conn.generation();
		let command = operation.assemble(description, server_description, session);
		let result = conn.send_and_receive(command, operation.sequences.clone(), deadline).await
			.and_then(check_reply);
		drop(conn);

		if let Err(e) = &result {
			self.topology.handle_error(&server.address, e, Some(generation)).await;
		}
		result
	}

	pub fn database(&self, name: &str) -> Database {
		self.database_with(name, None, None, None)
	}

	pub fn database_with(
		&self,
		name:            &str,
		read_preference: Option<ReadPreference>,
		read_concern:    Option<ReadConcern>,
		write_concern:   Option<WriteConcern>
	) -> Database {
		Database(Arc::new(DatabaseInner {
			client:          self.clone(),
			name:            name.to_string(),
			read_preference: read_preference.unwrap_or_else(|| self.options.read_preference.clone()),
			read_concern:    read_concern.or(self.options.read_concern),
			write_concern:   write_concern.or_else(|| self.options.write_concern.clone())
		}))
	}

	/// Stops monitoring and closes all pools. Operations started afterwards fail with
	/// `Error::ClientClosed`.
	pub fn close(&self) {
		self.topology.close();
		tracing::debug!("client closed");
	}
}

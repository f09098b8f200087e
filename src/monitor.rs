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

//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-monitoring.md

use {
	crate::{
		Result,
		apm::{ConnectionClosedReason, Event},
		common::{ServerAddress, MIN_HEARTBEAT_FREQUENCY},
		conn::{Connection, HelloReply},
		operation::check_reply,
		topology::{ServerDescription, Topology}
	},
	async_std::{channel::Receiver, future::timeout, task},
	bson::{doc, Document},
	std::{sync::{Arc, Weak}, time::{Duration, Instant}}
};

/// Weight of the newest sample in the round trip time average.
const RTT_ALPHA: f64 = 0.2;

struct Monitor {
	address:         ServerAddress,
	connection:      Option<Connection>,
	round_trip_time: Option<Duration>
}

/// Checks one server until it leaves the topology or the topology is dropped.
pub(crate) async fn run(topology: Weak<Topology>, address: ServerAddress, requests: Receiver<()>) {
	let mut monitor = Monitor { address, connection: None, round_trip_time: None };

	loop {
		let Some(topology) = topology.upgrade() else { break };
		if topology.is_closed() || requests.is_closed() {
			break;
		}

		let started = Instant::now();
		monitor.check(&topology).await;
		let heartbeat = topology.heartbeat_frequency();
		drop(topology);

		let next = started + heartbeat;
		match timeout(next.saturating_duration_since(Instant::now()), requests.recv()).await {
			// the server was removed
			Ok(Err(_)) => break,
			Ok(Ok(())) => task::sleep((started + MIN_HEARTBEAT_FREQUENCY).saturating_duration_since(Instant::now())).await,
			Err(_) => ()
		}
	}

	tracing::trace!(address = %monitor.address, "monitor stopped");
}

impl Monitor {
	async fn check(&mut self, topology: &Arc<Topology>) {
		let was_available = topology.description().servers.get(&self.address)
			.map_or(false, ServerDescription::is_available);

		let mut result = self.heartbeat(topology).await;
		// a known server gets one immediate retry before it is marked unknown
		if matches!(&result, Err(e) if e.is_network()) && was_available {
			tracing::debug!(address = %self.address, "retrying failed heartbeat");
			result = self.heartbeat(topology).await;
		}

		match result {
			Ok((reply, round_trip_time)) => {
				let average = self.average(round_trip_time);
				topology.update_server(ServerDescription::from_hello(self.address.clone(), &reply, average)).await;
			}
			Err(e) => {
				tracing::debug!(address = %self.address, error = %e, "server check failed");
				self.round_trip_time = None;
				topology.mark_failed(&self.address, &e, false).await;
			}
		}
	}

	async fn heartbeat(&mut self, topology: &Topology) -> Result<(HelloReply, Duration)> {
		let listeners = topology.listeners();
		listeners.dispatch(Event::ServerHeartbeatStarted { address: &self.address });

		let start = Instant::now();
		let result = self.hello(topology).await;
		let duration = start.elapsed();

		match result {
			Ok((document, reply)) => {
				listeners.dispatch(Event::ServerHeartbeatSucceeded {
					address:  &self.address,
					duration,
					reply:    &document
				});
				tracing::trace!(address = %self.address, ?duration, "heartbeat succeeded");
				Ok((reply, duration))
			}
			Err(e) => {
				if let Some(conn) = self.connection.take() {
					conn.close(ConnectionClosedReason::Error);
				}
				listeners.dispatch(Event::ServerHeartbeatFailed {
					address:  &self.address,
					duration,
					failure:  &e
				});
				Err(e)
			}
		}
	}

	async fn hello(&mut self, topology: &Topology) -> Result<(Document, HelloReply)> {
		let connection = match self.connection.take() {
			Some(connection) => connection,
			None => Connection::open_monitoring(&self.address, topology.connection_options()).await?
		};
		let connection = self.connection.insert(connection);

		let deadline = Instant::now() + topology.connection_options().connect_timeout;
		let document = check_reply(connection.command(doc! { "hello": 1, "$db": "admin" }, Some(deadline)).await?)?;
		let reply = bson::from_document(document.clone())?;
		Ok((document, reply))
	}

	/// Folds a sample into the exponentially weighted moving average.
	fn average(&mut self, sample: Duration) -> Duration {
		let average = match self.round_trip_time {
			None => sample,
			Some(previous) => previous.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA)
		};
		self.round_trip_time = Some(average);
		average
	}
}

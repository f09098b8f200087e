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

//! see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.md

use {
	crate::{
		Error, Result,
		apm::{ConnectionCheckOutFailedReason, ConnectionClosedReason, Event, EventListeners},
		common::{ConnectionPoolOptions, ServerAddress},
		conn::{Connection, ConnectionOptions}
	},
	async_std::{channel::{self, Receiver, Sender}, future::timeout, task},
	std::{
		collections::VecDeque,
		ops::{Deref, DerefMut},
		sync::{Arc, Mutex, MutexGuard, PoisonError, Weak, atomic::{AtomicU64, Ordering}},
		time::{Duration, Instant}
	}
};

/// What a waiting checkout is handed.
enum Grant {
	Connection(Connection),
	/// Permission to open a new connection, already counted as pending.
	Slot
}

struct Waiter {
	id: u64,
	tx: Sender<Grant>
}

#[derive(Default)]
struct PoolState {
	/// Most recently used last.
	idle:        VecDeque<Connection>,
	/// idle + in use + pending
	total:       usize,
	pending:     usize,
	generation:  u64,
	waiters:     VecDeque<Waiter>,
	next_waiter: u64,
	closed:      bool
}

/// Connections closed after the pool lock has been released.
type Closing = Vec<(Connection, ConnectionClosedReason)>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolStatus {
	pub idle:       usize,
	pub in_use:     usize,
	pub pending:    usize,
	pub waiters:    usize,
	pub generation: u64
}

pub struct Pool {
	address:            ServerAddress,
	options:            ConnectionPoolOptions,
	connection_options: Arc<ConnectionOptions>,
	state:              Mutex<PoolState>,
	next_id:            AtomicU64,
	listeners:          EventListeners
}

impl std::fmt::Debug for Pool {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Pool")
			.field("address", &self.address)
			.field("options", &self.options)
			.field("status", &self.status())
			.finish()
	}
}

impl Pool {
	/// Creates the pool and starts its maintenance task.
	pub(crate) fn new(
		address:            ServerAddress,
		options:            ConnectionPoolOptions,
		connection_options: Arc<ConnectionOptions>
	) -> Arc<Self> {
		let pool = Arc::new(Self {
			listeners: connection_options.event_listeners.clone(),
			address,
			options,
			connection_options,
			state:     Mutex::new(PoolState::default()),
			next_id:   AtomicU64::new(1)
		});

		task::spawn(maintain(Arc::downgrade(&pool), pool.options.maintenance_interval));
		pool
	}

	/// Publishes `PoolCreated`. Left to the owner, which may be holding locks while
	/// creating the pool.
	pub(crate) fn announce(&self) {
		self.listeners.dispatch(Event::PoolCreated { address: &self.address, options: &self.options });
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	fn lock(&self) -> MutexGuard<'_, PoolState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn status(&self) -> PoolStatus {
		let state = self.lock();
		PoolStatus {
			idle:       state.idle.len(),
			in_use:     state.total - state.idle.len() - state.pending,
			pending:    state.pending,
			waiters:    state.waiters.len(),
			generation: state.generation
		}
	}

	pub fn generation(&self) -> u64 {
		self.lock().generation
	}

	fn is_perished(&self, conn: &Connection, generation: u64) -> Option<ConnectionClosedReason> {
		if conn.generation() != generation {
			Some(ConnectionClosedReason::Stale)
		} else if self.options.max_idle_time.map_or(false, |max| conn.last_used().elapsed() >= max) {
			Some(ConnectionClosedReason::Idle)
		} else {
			None
		}
	}

	/// Hands out an idle connection or a slot for a new one, if either is available.
	fn try_grant(&self, state: &mut PoolState, closing: &mut Closing) -> Option<Grant> {
		while let Some(conn) = state.idle.pop_back() {
			match self.is_perished(&conn, state.generation) {
				Some(reason) => {
					state.total -= 1;
					closing.push((conn, reason));
				}
				None => return Some(Grant::Connection(conn))
			}
		}

		let has_room = self.options.max_pool_size == 0 || state.total < self.options.max_pool_size;
		if has_room && state.pending < self.options.max_connecting {
			state.total += 1;
			state.pending += 1;
			Some(Grant::Slot)
		} else {
			None
		}
	}

	fn undo_grant(&self, state: &mut PoolState, grant: Grant) {
		match grant {
			Grant::Connection(conn) => state.idle.push_back(conn),
			Grant::Slot => {
				state.total -= 1;
				state.pending -= 1;
			}
		}
	}

	/// Serves waiters in FIFO order for as long as there is something to hand out.
	fn dispatch(&self, state: &mut PoolState, closing: &mut Closing) {
		while !state.waiters.is_empty() {
			let Some(grant) = self.try_grant(state, closing) else { break };
			let Some(waiter) = state.waiters.pop_front() else {
				self.undo_grant(state, grant);
				break;
			};

			if let Err(e) = waiter.tx.try_send(grant) {
				// the waiter gave up
				self.undo_grant(state, e.into_inner());
			}
		}
	}

	fn close_all(&self, closing: Closing) {
		for (conn, reason) in closing {
			conn.close(reason);
		}
	}

	/// Checks out a connection. `deadline` bounds both waiting and establishment.
	pub async fn checkout(self: &Arc<Self>, deadline: Option<Instant>) -> Result<PooledConnection> {
		let start = Instant::now();
		self.listeners.dispatch(Event::ConnectionCheckOutStarted { address: &self.address });

		match self.checkout_inner(deadline).await {
			Ok(conn) => {
				self.listeners.dispatch(Event::ConnectionCheckedOut {
					address:       &self.address,
					connection_id: conn.id(),
					duration:      start.elapsed()
				});
				Ok(PooledConnection { pool: self.clone(), conn: Some(conn) })
			}
			Err(e) => {
				self.listeners.dispatch(Event::ConnectionCheckOutFailed {
					address:  &self.address,
					reason:   match &e {
						Error::PoolClosed(_) => ConnectionCheckOutFailedReason::PoolClosed,
						Error::PoolExhausted(_) | Error::Timeout(_) => ConnectionCheckOutFailedReason::Timeout,
						_ => ConnectionCheckOutFailedReason::ConnectionError
					},
					duration: start.elapsed()
				});
				Err(e)
			}
		}
	}

	async fn checkout_inner(&self, deadline: Option<Instant>) -> Result<Connection> {
		let mut closing = Closing::new();
		let immediate = {
			let mut state = self.lock();
			if state.closed {
				return Err(Error::PoolClosed(self.address.clone()));
			}

			// new callers never jump the queue
			let grant = if state.waiters.is_empty() { self.try_grant(&mut state, &mut closing) } else { None };
			match grant {
				Some(grant) => Ok(grant),
				None if deadline.map_or(false, |d| d <= Instant::now()) => Err(None),
				None => {
					let (tx, rx) = channel::bounded(1);
					let id = state.next_waiter;
					state.next_waiter += 1;
					state.waiters.push_back(Waiter { id, tx });
					Err(Some((id, rx)))
				}
			}
		};
		self.close_all(closing);

		let grant = match immediate {
			Ok(grant) => grant,
			Err(None) => return Err(Error::PoolExhausted(self.address.clone())),
			Err(Some((id, rx))) => {
				// waitQueueTimeoutMS caps the wait, never the establishment
				let queue_deadline = self.options.wait_queue_timeout.map(|wait| Instant::now() + wait);
				let wait_deadline = match (deadline, queue_deadline) {
					(Some(a), Some(b)) => Some(a.min(b)),
					(a, b) => a.or(b)
				};

				let mut guard = WaitGuard { pool: self, id, rx, done: false };
				let received = match wait_deadline {
					None => guard.rx.recv().await,
					Some(wait_deadline) => timeout(wait_deadline.saturating_duration_since(Instant::now()), guard.rx.recv()).await
						.map_err(|_| Error::PoolExhausted(self.address.clone()))?
				};
				guard.done = true;
				// the sender is dropped when the pool closes
				received.map_err(|_| Error::PoolClosed(self.address.clone()))?
			}
		};

		match grant {
			Grant::Connection(conn) => Ok(conn),
			Grant::Slot => self.open(deadline).await
		}
	}

	/// Opens a connection on a slot that was already granted.
	async fn open(&self, deadline: Option<Instant>) -> Result<Connection> {
		let mut slot = PendingSlot { pool: self, opened: false };
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let generation = self.generation();
		let start = Instant::now();
		self.listeners.dispatch(Event::ConnectionCreated { address: &self.address, connection_id: id });

		let open = Connection::open(&self.address, &self.connection_options, id, generation);
		let conn = match deadline {
			None => open.await?,
			Some(deadline) => timeout(deadline.saturating_duration_since(Instant::now()), open).await
				.map_err(|_| Error::Timeout(format!("opening a connection to {}", self.address)))??
		};

		slot.opened = true;
		drop(slot);
		self.listeners.dispatch(Event::ConnectionReady {
			address:       &self.address,
			connection_id: id,
			duration:      start.elapsed()
		});
		Ok(conn)
	}

	/// Releases a pending slot once its open attempt has finished.
	fn finish_pending(&self, opened: bool) {
		let mut closing = Closing::new();
		{
			let mut state = self.lock();
			state.pending -= 1;
			if !opened {
				state.total -= 1;
			}
			self.dispatch(&mut state, &mut closing);
		}
		self.close_all(closing);
	}

	/// Returns a connection. Broken, stale and orphaned connections are closed.
	pub(crate) fn checkin(&self, conn: Connection) {
		self.listeners.dispatch(Event::ConnectionCheckedIn { address: &self.address, connection_id: conn.id() });

		let mut closing = Closing::new();
		{
			let mut state = self.lock();
			let reason = if state.closed {
				Some(ConnectionClosedReason::PoolClosed)
			} else if conn.is_broken() {
				Some(ConnectionClosedReason::Error)
			} else if conn.generation() != state.generation {
				Some(ConnectionClosedReason::Stale)
			} else {
				None
			};

			match reason {
				Some(reason) => {
					state.total -= 1;
					closing.push((conn, reason));
				}
				None => state.idle.push_back(conn)
			}

			self.dispatch(&mut state, &mut closing);
		}
		self.close_all(closing);
	}

	/// Marks every existing connection stale because of `reason`. Idle connections close
	/// now, checked out ones on check-in.
	pub fn invalidate_all(&self, reason: &Error) {
		let mut closing = Closing::new();
		let generation = {
			let mut state = self.lock();
			state.generation += 1;
			state.total -= state.idle.len();
			closing.extend(state.idle.drain(..).map(|conn| (conn, ConnectionClosedReason::Stale)));
			self.dispatch(&mut state, &mut closing);
			state.generation
		};
		self.close_all(closing);

		tracing::info!(address = %self.address, generation, %reason, "connection pool cleared");
		self.listeners.dispatch(Event::PoolCleared { address: &self.address, generation });
	}

	/// Closes idle connections and fails waiters. Checked out connections are closed on check-in.
	pub fn close(&self) {
		let closing = {
			let mut state = self.lock();
			if state.closed {
				return;
			}
			state.closed = true;
			state.total -= state.idle.len();
			// dropping the senders wakes every waiter
			state.waiters.clear();
			state.idle.drain(..).map(|conn| (conn, ConnectionClosedReason::PoolClosed)).collect::<Closing>()
		};
		self.close_all(closing);

		tracing::debug!(address = %self.address, "connection pool closed");
		self.listeners.dispatch(Event::PoolClosed { address: &self.address });
	}

	pub fn is_closed(&self) -> bool {
		self.lock().closed
	}

	/// Closes idle connections past their lifetime.
	fn remove_perished(&self) {
		let mut closing = Closing::new();
		{
			let mut state = self.lock();
			let generation = state.generation;
			let mut kept = VecDeque::with_capacity(state.idle.len());
			for conn in state.idle.drain(..) {
				match self.is_perished(&conn, generation) {
					Some(reason) => closing.push((conn, reason)),
					None => kept.push_back(conn)
				}
			}
			state.total -= closing.len();
			state.idle = kept;
			self.dispatch(&mut state, &mut closing);
		}
		self.close_all(closing);
	}

	/// Opens connections until the pool holds `min_pool_size`.
	async fn fill(&self) {
		loop {
			{
				let mut state = self.lock();
				if state.closed
					|| state.total >= self.options.min_pool_size
					|| state.pending >= self.options.max_connecting
					|| !state.waiters.is_empty() {
					return;
				}
				state.total += 1;
				state.pending += 1;
			}

			match self.open(None).await {
				Ok(conn) => self.checkin(conn),
				Err(e) => {
					tracing::debug!(address = %self.address, error = %e, "failed to fill connection pool");
					return;
				}
			}
		}
	}
}

async fn maintain(pool: Weak<Pool>, interval: Duration) {
	loop {
		task::sleep(interval).await;
		let Some(pool) = pool.upgrade() else { break };
		if pool.is_closed() {
			break;
		}
		pool.remove_perished();
		pool.fill().await;
	}
}

/// Removes an abandoned waiter, or hands back a grant it was sent but never took.
struct WaitGuard<'a> {
	pool: &'a Pool,
	id:   u64,
	rx:   Receiver<Grant>,
	done: bool
}

impl Drop for WaitGuard<'_> {
	fn drop(&mut self) {
		if self.done {
			return;
		}

		let mut closing = Closing::new();
		{
			let mut state = self.pool.lock();
			let queued = state.waiters.len();
			let id = self.id;
			state.waiters.retain(|w| w.id != id);
			if state.waiters.len() == queued {
				if let Ok(grant) = self.rx.try_recv() {
					self.pool.undo_grant(&mut state, grant);
					self.pool.dispatch(&mut state, &mut closing);
				}
			}
		}
		self.pool.close_all(closing);
	}
}

/// Gives a slot back if the open attempt fails or is cancelled.
struct PendingSlot<'a> {
	pool:   &'a Pool,
	opened: bool
}

impl Drop for PendingSlot<'_> {
	fn drop(&mut self) {
		self.pool.finish_pending(self.opened);
	}
}

/// A checked out connection. Dropping it checks it back in.
#[derive(Debug)]
pub struct PooledConnection {
	pool: Arc<Pool>,
	/// Taken only on drop.
	conn: Option<Connection>
}

impl Deref for PooledConnection {
	type Target = Connection;

	fn deref(&self) -> &Self::Target {
		match &self.conn {
			Some(conn) => conn,
			None => unreachable!("connection taken before drop")
		}
	}
}

impl DerefMut for PooledConnection {
	fn deref_mut(&mut self) -> &mut Self::Target {
		match &mut self.conn {
			Some(conn) => conn,
			None => unreachable!("connection taken before drop")
		}
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(conn) = self.conn.take() {
			self.pool.checkin(conn);
		}
	}
}

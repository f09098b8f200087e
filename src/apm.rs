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
	crate::{Error, common::{ConnectionPoolOptions, ServerAddress}, topology::TopologyDescription},
	bson::Document,
	std::{fmt, sync::Arc, time::Duration}
};

/// Receives events synchronously on the task that produced them. Implementations
/// must not block.
pub trait EventListener: Send + Sync {
	fn on_event(&self, event: &Event);
}

impl<F: Fn(&Event) + Send + Sync> EventListener for F {
	fn on_event(&self, event: &Event) {
		self(event)
	}
}

#[derive(Clone, Default)]
pub struct EventListeners(Vec<Arc<dyn EventListener>>);

impl EventListeners {
	pub fn push(&mut self, listener: impl EventListener + 'static) {
		self.0.push(Arc::new(listener));
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub(crate) fn dispatch(&self, event: Event) {
		for listener in &self.0 {
			listener.on_event(&event);
		}
	}
}

impl fmt::Debug for EventListeners {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "EventListeners({})", self.0.len())
	}
}

pub type Address<'a> = &'a ServerAddress;

/// see https://github.com/mongodb/specifications/blob/master/source/command-logging-and-monitoring/command-logging-and-monitoring.md
/// https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring-logging-and-monitoring.md
/// https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.md#events
#[derive(Debug)]
pub enum Event<'a> {
	CommandStarted {
		address:       Address<'a>,
		command:       &'a Document,
		database_name: &'a str,
		command_name:  &'a str,
		request_id:    i32,
		connection_id: u64
	},
	CommandSucceeded {
		address:       Address<'a>,
		duration:      Duration,
		reply:         &'a Document,
		command_name:  &'a str,
		request_id:    i32,
		connection_id: u64
	},
	CommandFailed {
		address:       Address<'a>,
		duration:      Duration,
		failure:       &'a Error,
		command_name:  &'a str,
		request_id:    i32,
		connection_id: u64
	},
	ServerHeartbeatStarted {
		address: Address<'a>
	},
	ServerHeartbeatSucceeded {
		address:  Address<'a>,
		duration: Duration,
		reply:    &'a Document
	},
	ServerHeartbeatFailed {
		address:  Address<'a>,
		duration: Duration,
		failure:  &'a Error
	},
	TopologyDescriptionChanged {
		previous: &'a TopologyDescription,
		new:      &'a TopologyDescription
	},
	ServerOpening {
		address: Address<'a>
	},
	ServerClosed {
		address: Address<'a>
	},
	PoolCreated {
		address: Address<'a>,
		options: &'a ConnectionPoolOptions
	},
	PoolCleared {
		address:    Address<'a>,
		generation: u64
	},
	PoolClosed {
		address: Address<'a>
	},
	ConnectionCreated {
		address:       Address<'a>,
		connection_id: u64
	},
	ConnectionReady {
		address:       Address<'a>,
		connection_id: u64,
		duration:      Duration
	},
	ConnectionClosed {
		address:       Address<'a>,
		connection_id: u64,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		address: Address<'a>
	},
	ConnectionCheckOutFailed {
		address:  Address<'a>,
		reason:   ConnectionCheckOutFailedReason,
		duration: Duration
	},
	ConnectionCheckedOut {
		address:       Address<'a>,
		connection_id: u64,
		duration:      Duration
	},
	ConnectionCheckedIn {
		address:       Address<'a>,
		connection_id: u64
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	ConnectionError
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	/// The pool was cleared after the connection was created.
	Stale,
	Idle,
	Error,
	PoolClosed
}

#[cfg(test)]
mod tests {
	use {super::*, std::sync::Mutex};

	#[test]
	fn dispatches_to_all_listeners() {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let mut listeners = EventListeners::default();
		for i in 0..2 {
			let seen = seen.clone();
			listeners.push(move |event: &Event| if let Event::PoolClosed { address } = event {
				seen.lock().unwrap().push((i, address.to_string()));
			});
		}

		listeners.dispatch(Event::PoolClosed { address: &ServerAddress::new("a", 1) });
		assert_eq!(*seen.lock().unwrap(), vec![(0, "a:1".to_string()), (1, "a:1".to_string())]);
		assert_eq!(format!("{:?}", listeners), "EventListeners(2)");
	}
}

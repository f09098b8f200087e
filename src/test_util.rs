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

//! In-process OP_MSG server for tests.

use {
	crate::{common::ServerAddress, wire::{self, Message}},
	async_std::{net::{TcpListener, TcpStream}, task},
	bson::{doc, Document},
	std::{sync::{Arc, atomic::{AtomicUsize, Ordering}}, time::Duration}
};

pub(crate) enum MockReply {
	Reply(Document),
	Delay(Duration, Document),
	/// Closes the socket without answering.
	Hangup
}

pub(crate) struct MockServer {
	pub address: ServerAddress,
	accepted:    Arc<AtomicUsize>,
	open:        Arc<AtomicUsize>
}

impl MockServer {
	pub async fn start(handler: impl Fn(&Document) -> MockReply + Send + Sync + 'static) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let accepted = Arc::new(AtomicUsize::new(0));
		let open = Arc::new(AtomicUsize::new(0));
		let handler = Arc::new(handler);

		task::spawn({
			let accepted = accepted.clone();
			let open = open.clone();
			async move {
				while let Ok((stream, _)) = listener.accept().await {
					accepted.fetch_add(1, Ordering::SeqCst);
					open.fetch_add(1, Ordering::SeqCst);
					let handler = handler.clone();
					let open = open.clone();
					task::spawn(async move {
						serve(stream, &*handler).await;
						open.fetch_sub(1, Ordering::SeqCst);
					});
				}
			}
		});

		Self { address: ServerAddress::new("127.0.0.1", port), accepted, open }
	}

	/// Connections accepted so far.
	pub fn accepted(&self) -> usize {
		self.accepted.load(Ordering::SeqCst)
	}

	/// Connections currently open.
	pub fn open(&self) -> usize {
		self.open.load(Ordering::SeqCst)
	}
}

async fn serve(mut stream: TcpStream, handler: &(dyn Fn(&Document) -> MockReply + Send + Sync)) {
	while let Ok(mut request) = wire::read_message(&mut stream, wire::DEFAULT_MAX_MESSAGE_SIZE).await {
		// a server treats document sequences as array fields of the body
		for sequence in request.sequences.drain(..) {
			request.document.insert(sequence.identifier, sequence.documents);
		}

		let reply = match handler(&request.document) {
			MockReply::Reply(doc) => doc,
			MockReply::Delay(delay, doc) => {
				task::sleep(delay).await;
				doc
			}
			MockReply::Hangup => return
		};

		let mut message = Message::new(0, reply);
		message.response_to = request.request_id;
		let Ok(bytes) = message.encode() else { return };
		if wire::write_message(&mut stream, &bytes).await.is_err() {
			return;
		}
	}
}

/// A standalone `hello` reply, extended or overridden by `fields`.
pub(crate) fn hello_reply(fields: Document) -> Document {
	let mut reply = doc! {
		"ok": 1.0,
		"isWritablePrimary": true,
		"minWireVersion": 0,
		"maxWireVersion": 17,
		"maxMessageSizeBytes": 48_000_000,
		"maxBsonObjectSize": 16 * 1024 * 1024,
		"maxWriteBatchSize": 100_000,
		"logicalSessionTimeoutMinutes": 30
	};
	reply.extend(fields);
	reply
}

/// A `hello` reply from a member of replica set `rs`.
pub(crate) fn member_reply(primary: bool, hosts: &[&ServerAddress], primary_address: Option<&ServerAddress>) -> Document {
	let mut fields = doc! {
		"isWritablePrimary": primary,
		"secondary": !primary,
		"setName": "rs",
		"hosts": hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>()
	};
	if let Some(address) = primary_address {
		fields.insert("primary", address.to_string());
	}
	hello_reply(fields)
}

/// An address nothing listens on.
pub(crate) async fn unreachable_address() -> ServerAddress {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	drop(listener);
	ServerAddress::new("127.0.0.1", port)
}

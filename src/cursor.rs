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
	crate::{Client, CursorOptions, Error, ReadPreference, Result, ServerAddress, operation::Operation},
	bson::{doc, Document},
	serde::{Serialize, Deserialize},
	std::collections::VecDeque
};

/// Iterates the results of a cursor command, fetching further batches with `getMore`
/// from the server that created the cursor. Dropping a live cursor kills it on the server.
#[derive(Debug)]
pub struct Cursor {
	client:          Client,
	address:         ServerAddress,
	database:        String,
	collection:      String,
	cursor_id:       i64,
	buffer:          VecDeque<Document>,
	read_preference: Option<ReadPreference>,
	options:         CursorOptions
}

impl Cursor {
	pub(crate) fn new(
		client:          Client,
		address:         ServerAddress,
		database:        &str,
		reply:           Document,
		read_preference: Option<ReadPreference>,
		options:         CursorOptions
	) -> Result<Self> {
		let reply: CursorReply = bson::from_document(reply)?;
		let collection = collection_name(&reply.cursor.ns)?;
		Ok(Self {
			client,
			address,
			database:  database.to_string(),
			collection,
			cursor_id: reply.cursor.id,
			buffer:    reply.cursor.batch.into(),
			read_preference,
			options
		})
	}

	/// The server-side id. Zero once the server has no more results.
	pub fn id(&self) -> i64 {
		self.cursor_id
	}

	/// The server all `getMore`s are sent to.
	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	/// The next document, or `None` once the cursor is exhausted.
	pub async fn next(&mut self) -> Result<Option<Document>> {
		loop {
			if let Some(document) = self.buffer.pop_front() {
				return Ok(Some(document));
			} else if self.cursor_id == 0 {
				return Ok(None);
			}
			self.get_more().await?;
		}
	}

	/// Drains the cursor.
	pub async fn try_collect(mut self) -> Result<Vec<Document>> {
		let mut documents = Vec::with_capacity(self.buffer.len());
		while let Some(document) = self.next().await? {
			documents.push(document);
		}
		Ok(documents)
	}

	async fn get_more(&mut self) -> Result<()> {
		let command = bson::to_document(&GetMoreCommand {
			get_more:    self.cursor_id,
			collection:  &self.collection,
			batch_size:  self.options.batch_size,
			max_time_ms: self.options.max_time_ms
		})?;

		let mut operation = Operation::read(&self.database, command).pinned_to(self.address.clone());
		operation.read_preference = self.read_preference.clone();

		let reply: CursorReply = match self.client.execute(operation).await {
			Ok(reply) => bson::from_document(reply)?,
			Err(e) => {
				// the server may have discarded the cursor, don't try to kill it again
				if e.is_network() {
					self.cursor_id = 0;
				}
				return Err(e);
			}
		};

		self.buffer.extend(reply.cursor.batch);
		self.cursor_id = reply.cursor.id;
		Ok(())
	}
}

impl Drop for Cursor {
	fn drop(&mut self) {
		if self.cursor_id == 0 || self.client.topology.is_closed() {
			return;
		}

		let operation = Operation::read(&self.database, doc! {
			"killCursors": self.collection.as_str(),
			"cursors":     [self.cursor_id]
		}).pinned_to(self.address.clone());
		let client = self.client.clone();
		let cursor_id = self.cursor_id;

		async_std::task::spawn(async move {
			if let Err(e) = client.execute(operation).await {
				tracing::debug!(cursor_id, error = %e, "failed to kill cursor");
			}
		});
	}
}

fn collection_name(namespace: &str) -> Result<String> {
	namespace.split_once('.')
		.map(|(_, collection)| collection.to_string())
		.ok_or_else(|| Error::protocol(format!("invalid cursor namespace `{}`", namespace)))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetMoreCommand<'a> {
	get_more:    i64,
	collection:  &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	batch_size:  Option<i64>,
	#[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
	max_time_ms: Option<i64>
}

#[derive(Debug, Deserialize)]
struct CursorReply {
	cursor: CursorBatch
}

#[derive(Debug, Deserialize)]
struct CursorBatch {
	#[serde(alias = "firstBatch", alias = "nextBatch")]
	batch: Vec<Document>,
	id:    i64,
	ns:    String
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{ClientOptions, test_util::{hello_reply, MockReply, MockServer}},
		std::{sync::{Arc, Mutex}, time::Duration}
	};

	fn cursor_reply(id: i64, key: &str, batch: Vec<Document>) -> Document {
		let mut cursor = doc! { "id": id, "ns": "db.c" };
		cursor.insert(key, batch);
		doc! { "ok": 1, "cursor": cursor }
	}

	async fn server(commands: Arc<Mutex<Vec<Document>>>) -> MockServer {
		MockServer::start(move |cmd| {
			if cmd.contains_key("hello") {
				return MockReply::Reply(hello_reply(doc! {}));
			}
			commands.lock().unwrap().push(cmd.clone());
			MockReply::Reply(if cmd.contains_key("find") {
				cursor_reply(42, "firstBatch", vec![doc! { "a": 1 }, doc! { "a": 2 }])
			} else if cmd.contains_key("getMore") {
				cursor_reply(0, "nextBatch", vec![doc! { "a": 3 }])
			} else {
				doc! { "ok": 1, "cursorsKilled": [42_i64] }
			})
		}).await
	}

	fn client(server: &MockServer) -> Client {
		Client::new(ClientOptions { hosts: vec![server.address.clone()], ..ClientOptions::default() }).unwrap()
	}

	#[async_std::test]
	async fn fetches_batches_until_exhausted() {
		let commands = Arc::new(Mutex::new(Vec::new()));
		let server = server(commands.clone()).await;
		let client = client(&server);

		let cursor = client.database("db").collection("c")
			.find(None, Some(crate::FindOptions { batch_size: Some(2), ..Default::default() }))
			.await
			.unwrap();
		assert_eq!(cursor.id(), 42);
		assert_eq!(cursor.address(), &server.address);

		let documents = cursor.try_collect().await.unwrap();
		assert_eq!(documents.iter().map(|d| d.get_i32("a").unwrap()).collect::<Vec<_>>(), vec![1, 2, 3]);

		let commands = commands.lock().unwrap();
		let get_more = commands.iter().find(|c| c.contains_key("getMore")).unwrap();
		assert_eq!(get_more.get_i64("getMore").unwrap(), 42);
		assert_eq!(get_more.get_str("collection").unwrap(), "c");
		assert_eq!(get_more.get_i64("batchSize").unwrap(), 2);
		assert!(!commands.iter().any(|c| c.contains_key("killCursors")));
	}

	#[async_std::test]
	async fn dropping_live_cursor_kills_it() {
		let commands = Arc::new(Mutex::new(Vec::new()));
		let server = server(commands.clone()).await;
		let client = client(&server);

		let mut cursor = client.database("db").collection("c").find(None, None).await.unwrap();
		assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("a").unwrap(), 1);
		drop(cursor);

		for _ in 0..100 {
			if commands.lock().unwrap().iter().any(|c| c.contains_key("killCursors")) {
				return;
			}
			async_std::task::sleep(Duration::from_millis(10)).await;
		}
		panic!("cursor was not killed");
	}

	#[test]
	fn parses_namespaces() {
		assert_eq!(collection_name("db.system.users").unwrap(), "system.users");
		assert!(collection_name("db").is_err());
	}
}

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
	crate::{*, operation::Operation},
	bson::{doc, oid::ObjectId, Bson, Document},
	serde::{Serialize, Deserialize}
};

#[derive(Debug, Clone)]
pub struct Collection {
	pub db:              Database,
	pub name:            String,
	pub read_preference: ReadPreference,
	pub read_concern:    Option<ReadConcern>,
	pub write_concern:   Option<WriteConcern>
}

impl Collection {
	fn read(&self, command: Document) -> Operation {
		Operation::read(&self.db.name, command)
			.with_read_preference(self.read_preference.clone())
			.with_read_concern(self.read_concern)
			.retryable(true)
	}

	fn write(&self, command: Document) -> Operation {
		Operation::write(&self.db.name, command)
			.with_write_concern(self.write_concern.clone())
	}

	fn acknowledged(&self) -> bool {
		self.write_concern.as_ref().map_or(true, WriteConcern::is_acknowledged)
	}

	/// Runs an aggregation framework pipeline.
	///
	/// see https://docs.mongodb.com/manual/reference/command/aggregate/
	pub async fn aggregate(
		&self,
		pipeline: Vec<Document>,
		options:  Option<AggregateOptions>
	) -> Result<Cursor> {
		let options = options.unwrap_or_default();
		let command = bson::to_document(&AggregateCommand {
			aggregate:      &self.name,
			pipeline,
			allow_disk_use: options.allow_disk_use,
			cursor:         AggregateCommandCursor { batch_size: options.batch_size },
			max_time_ms:    options.max_time_ms,
			hint:           options.hint,
			comment:        options.comment.as_deref()
		})?;

		self.db.run_cursor_command(self.read(command), CursorOptions {
			batch_size:  options.batch_size,
			max_time_ms: options.max_time_ms
		}).await
	}

	/// Count the number of documents in a collection that match the given
	/// filter. Note that an empty filter will force a scan of the entire
	/// collection.
	pub async fn count_documents(
		&self,
		filter:  Option<Document>,
		options: Option<CountOptions>
	) -> Result<u64> {
		let options = options.unwrap_or_default();
		let mut pipeline = vec![doc! { "$match": filter.unwrap_or_default() }];

		if let Some(skip) = options.skip {
			pipeline.push(doc! { "$skip": skip });
		}

		if let Some(limit) = options.limit {
			pipeline.push(doc! { "$limit": limit });
		}

		pipeline.push(doc! { "$group": { "_id": 1, "n": { "$sum": 1 } } });

		let mut cursor = self.aggregate(pipeline, Some(AggregateOptions {
			hint:        options.hint,
			max_time_ms: options.max_time_ms,
			..AggregateOptions::default()
		})).await?;

		// an empty collection yields no group at all
		match cursor.next().await?.as_ref().and_then(|result| result.get("n")) {
			None => Ok(0),
			Some(Bson::Int32(n)) => Ok(*n as u64),
			Some(Bson::Int64(n)) => Ok(*n as u64),
			Some(n) => Err(Error::protocol(format!("unexpected count `{}`", n)))
		}
	}

	pub async fn find_one(
		&self,
		filter:  Option<Document>,
		options: Option<FindOptions>
	) -> Result<Option<Document>> {
		let mut options = options.unwrap_or_default();
		options.batch_size = Some(1);
		options.limit = Some(-1);
		self.find(filter, Some(options)).await?.next().await
	}

	/// see https://docs.mongodb.com/manual/reference/command/find/
	pub async fn find(
		&self,
		filter:  Option<Document>,
		options: Option<FindOptions>
	) -> Result<Cursor> {
		let options = options.unwrap_or_default();
		let command = bson::to_document(&FindCommand {
			find:                  &self.name,
			filter,
			sort:                  options.sort,
			projection:            options.projection,
			hint:                  options.hint,
			skip:                  options.skip,
			limit:                 options.limit,
			batch_size:            options.batch_size,
			comment:               options.comment.as_deref(),
			max_time_ms:           options.max_time_ms,
			no_cursor_timeout:     options.no_cursor_timeout,
			allow_partial_results: options.allow_partial_results
		})?;

		self.db.run_cursor_command(self.read(command), CursorOptions {
			batch_size:  options.batch_size,
			max_time_ms: options.max_time_ms
		}).await
	}

	/// Inserts the provided document, assigning an `_id` if it has none.
	///
	/// see https://docs.mongodb.com/manual/reference/command/insert/
	pub async fn insert_one(
		&self,
		document: Document,
		options:  Option<InsertOneOptions>
	) -> Result<InsertOneResult> {
		let options = options.unwrap_or_default();
		self.insert_many(std::iter::once(document), Some(InsertManyOptions {
			ordered:                    true,
			bypass_document_validation: options.bypass_document_validation
		})).await.map(|mut result| InsertOneResult {
			acknowledged: result.acknowledged,
			inserted_id:  result.inserted_ids.pop().unwrap_or(Bson::Null)
		})
	}

	/// Inserts the provided documents, assigning an `_id` to those that have none. The
	/// documents are sent as a document sequence rather than inside the command body.
	///
	/// see https://docs.mongodb.com/manual/reference/command/insert/
	pub async fn insert_many(
		&self,
		documents: impl IntoIterator<Item = Document>,
		options:   Option<InsertManyOptions>
	) -> Result<InsertManyResult> {
		let options = options.unwrap_or_default();
		let mut inserted_ids = Vec::new();
		let documents = documents.into_iter()
			.map(|mut document| {
				let id = document.entry("_id".to_string())
					.or_insert_with(|| Bson::ObjectId(ObjectId::new()))
					.clone();
				inserted_ids.push(id);
				document
			})
			.collect::<Vec<_>>();

		if documents.is_empty() {
			return Err(Error::invalid_options("insert_many requires at least one document"));
		}

		let command = bson::to_document(&InsertCommand {
			insert:                     &self.name,
			ordered:                    options.ordered,
			bypass_document_validation: options.bypass_document_validation
		})?;

		let reply = self.db.client.execute(self.write(command)
			.with_sequence("documents", documents)
			.retryable(true)).await?;
		WriteCommandResponse::from_reply(reply)?;

		Ok(InsertManyResult {
			acknowledged: self.acknowledged(),
			inserted_ids
		})
	}

	/// Updates all documents matching `filter`. Multi-document writes are not retryable.
	///
	/// see https://docs.mongodb.com/manual/reference/command/update/
	pub async fn update_many(
		&self,
		filter:  Document,
		update:  Document,
		options: Option<UpdateOptions>
	) -> Result<UpdateResult> {
		let options = options.unwrap_or_default();
		let command = bson::to_document(&UpdateCommand {
			update:                     &self.name,
			updates:                    [UpdateStatement {
				q:             filter,
				u:             update,
				upsert:        options.upsert,
				multi:         true,
				array_filters: options.array_filters
			}],
			bypass_document_validation: options.bypass_document_validation
		})?;

		let result = WriteCommandResponse::from_reply(self.db.client.execute(self.write(command)).await?)?;
		Ok(UpdateResult {
			acknowledged:   self.acknowledged(),
			matched_count:  result.n as u64,
			modified_count: result.n_modified.unwrap_or(0) as u64,
			upserted_id:    result.upserted.and_then(|mut upserted| upserted.pop()).map(|u| u.id)
		})
	}

	/// Deletes all documents matching `filter`. Multi-document writes are not retryable.
	///
	/// see https://docs.mongodb.com/manual/reference/command/delete/
	pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
		let command = bson::to_document(&DeleteCommand {
			delete:  &self.name,
			deletes: [DeleteStatement { q: filter, limit: 0 }]
		})?;

		let result = WriteCommandResponse::from_reply(self.db.client.execute(self.write(command)).await?)?;
		Ok(DeleteResult {
			acknowledged:  self.acknowledged(),
			deleted_count: result.n as u64
		})
	}
}

//
// OPTIONS
//

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AggregateOptions {
	/// Enables writing to temporary files.
	pub allow_disk_use: Option<bool>,
	/// The number of documents to return per batch.
	pub batch_size:     Option<i64>,
	/// The maximum amount of time to allow the query to run.
	pub max_time_ms:    Option<i64>,
	/// The index to use for the aggregation.
	pub hint:           Option<Document>,
	pub comment:        Option<String>
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CountOptions {
	/// The index to use.
	pub hint:        Option<Document>,
	/// The maximum number of documents to count.
	pub limit:       Option<i64>,
	/// The maximum amount of time to allow the operation to run.
	pub max_time_ms: Option<i64>,
	/// The number of documents to skip before counting.
	pub skip:        Option<i64>
}

/// see https://docs.mongodb.com/manual/reference/command/find/
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FindOptions {
	/// Get partial results from a mongos if some shards are down (instead of throwing an error).
	pub allow_partial_results: Option<bool>,
	/// The number of documents to return per batch.
	pub batch_size:            Option<i64>,
	/// Attaches a comment to the query.
	pub comment:               Option<String>,
	/// The index to use.
	pub hint:                  Option<Document>,
	/// The maximum number of documents to return. A negative limit closes the cursor
	/// after the first batch.
	pub limit:                 Option<i64>,
	/// The maximum amount of time to allow the query to run.
	pub max_time_ms:           Option<i64>,
	/// The server normally times out idle cursors after an inactivity period (10 minutes)
	/// to prevent excess memory use. Set this option to prevent that.
	pub no_cursor_timeout:     Option<bool>,
	/// Limits the fields to return for all matching documents.
	pub projection:            Option<Document>,
	/// The number of documents to skip before returning.
	pub skip:                  Option<i64>,
	/// The order in which to return matching documents.
	pub sort:                  Option<Document>
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct InsertOneOptions {
	/// If true, allows the write to opt-out of document level validation.
	pub bypass_document_validation: Option<bool>
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InsertManyOptions {
	/// If true, when an insert fails, return without performing the remaining
	/// writes. If false, when a write fails, continue with the remaining writes, if any.
	/// Defaults to true.
	pub ordered:                    bool,
	/// If true, allows the write to opt-out of document level validation.
	pub bypass_document_validation: Option<bool>
}

impl Default for InsertManyOptions {
	fn default() -> Self {
		Self {
			ordered:                    true,
			bypass_document_validation: None
		}
	}
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateOptions {
	/// A set of filters specifying to which array elements an update should apply.
	pub array_filters:              Option<Vec<Document>>,
	/// If true, allows the write to opt-out of document level validation.
	pub bypass_document_validation: Option<bool>,
	/// When true, creates a new document if no document matches the query.
	pub upsert:                     Option<bool>
}

//
// RESULTS
//

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
	/// Indicates whether this write result was acknowledged. If not, then all
	/// other members of this result will be undefined.
	pub acknowledged: bool,
	/// The `_id` of the inserted document, assigned by the client if it had none.
	pub inserted_id:  Bson
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
	/// Indicates whether this write result was acknowledged. If not, then all
	/// other members of this result will be undefined.
	pub acknowledged: bool,
	/// The `_id`s of the inserted documents, in input order.
	pub inserted_ids: Vec<Bson>
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeleteResult {
	/// Indicates whether this write result was acknowledged. If not, then all
	/// other members of this result will be undefined.
	pub acknowledged:  bool,
	/// The number of documents that were deleted.
	pub deleted_count: u64
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
	/// Indicates whether this write result was acknowledged. If not, then all
	/// other members of this result will be undefined.
	pub acknowledged:   bool,
	/// The number of documents that matched the filter.
	pub matched_count:  u64,
	/// The number of documents that were modified.
	pub modified_count: u64,
	/// The identifier of the inserted document if an upsert took place.
	pub upserted_id:    Option<Bson>
}

//
// COMMANDS
//

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregateCommand<'a> {
	aggregate:      &'a str,
	pipeline:       Vec<Document>,
	#[serde(skip_serializing_if = "Option::is_none")]
	allow_disk_use: Option<bool>,
	cursor:         AggregateCommandCursor,
	#[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
	max_time_ms:    Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	hint:           Option<Document>,
	#[serde(skip_serializing_if = "Option::is_none")]
	comment:        Option<&'a str>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregateCommandCursor {
	#[serde(skip_serializing_if = "Option::is_none")]
	batch_size: Option<i64>
}

/// https://docs.mongodb.com/manual/reference/command/find/
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindCommand<'a> {
	find:                  &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	filter:                Option<Document>,
	#[serde(skip_serializing_if = "Option::is_none")]
	sort:                  Option<Document>,
	#[serde(skip_serializing_if = "Option::is_none")]
	projection:            Option<Document>,
	#[serde(skip_serializing_if = "Option::is_none")]
	hint:                  Option<Document>,
	#[serde(skip_serializing_if = "Option::is_none")]
	skip:                  Option<i64>,
	/// A negative limit asks for a single batch.
	#[serde(skip_serializing_if = "Option::is_none")]
	limit:                 Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	batch_size:            Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	comment:               Option<&'a str>,
	#[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
	max_time_ms:           Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	no_cursor_timeout:     Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	allow_partial_results: Option<bool>
}

/// The documents travel in the `documents` sequence.
///
/// https://docs.mongodb.com/manual/reference/command/insert/
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertCommand<'a> {
	insert:                     &'a str,
	ordered:                    bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	bypass_document_validation: Option<bool>
}

/// https://docs.mongodb.com/manual/reference/command/update/
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCommand<'a> {
	update:                     &'a str,
	updates:                    [UpdateStatement; 1],
	#[serde(skip_serializing_if = "Option::is_none")]
	bypass_document_validation: Option<bool>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStatement {
	q:             Document,
	u:             Document,
	#[serde(skip_serializing_if = "Option::is_none")]
	upsert:        Option<bool>,
	multi:         bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	array_filters: Option<Vec<Document>>
}

/// https://docs.mongodb.com/manual/reference/command/delete/
#[derive(Debug, Clone, Serialize)]
struct DeleteCommand<'a> {
	delete:  &'a str,
	deletes: [DeleteStatement; 1]
}

#[derive(Debug, Clone, Serialize)]
struct DeleteStatement {
	q:     Document,
	/// Zero deletes every match.
	limit: i32
}

/// The reply to insert, update and delete. Write errors arrive in an `ok: 1` reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteCommandResponse {
	#[serde(default)]
	n:            i64,
	n_modified:   Option<i64>,
	write_errors: Option<Vec<CommandWriteError>>,
	upserted:     Option<Vec<Upserted>>
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandWriteError {
	code:      i32,
	code_name: Option<String>,
	errmsg:    String
}

#[derive(Debug, Clone, Deserialize)]
struct Upserted {
	#[serde(rename = "_id")]
	id: Bson
}

impl WriteCommandResponse {
	fn from_reply(reply: Document) -> Result<Self> {
		let mut response: Self = bson::from_document(reply)?;
		// ordered writes stop at the first error, so it is the one that matters
		let first_error = response.write_errors.as_mut().filter(|e| !e.is_empty()).map(|e| e.remove(0));
		match first_error {
			Some(e) => Err(Error::ServerCommand {
				code:      e.code,
				code_name: e.code_name.unwrap_or_default(),
				message:   e.errmsg,
				labels:    Vec::new()
			}),
			None => Ok(response)
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::test_util::{hello_reply, MockReply, MockServer},
		std::sync::{Arc, Mutex}
	};

	async fn collection(handler: impl Fn(&Document) -> Document + Send + Sync + 'static) -> (MockServer, Collection) {
		let server = MockServer::start(move |cmd| MockReply::Reply(if cmd.contains_key("hello") {
			hello_reply(doc! {})
		} else {
			handler(cmd)
		})).await;
		let client = Client::new(ClientOptions { hosts: vec![server.address.clone()], ..ClientOptions::default() }).unwrap();
		let collection = client.database("db").collection("c");
		(server, collection)
	}

	#[async_std::test]
	async fn inserts_assign_missing_ids() {
		let received = Arc::new(Mutex::new(Document::new()));
		let (_server, collection) = collection({
			let received = received.clone();
			move |cmd| {
				*received.lock().unwrap() = cmd.clone();
				doc! { "ok": 1, "n": 2 }
			}
		}).await;

		let result = collection.insert_many(vec![doc! { "_id": 7, "a": 1 }, doc! { "a": 2 }], None).await.unwrap();
		assert!(result.acknowledged);
		assert_eq!(result.inserted_ids[0], Bson::Int32(7));
		assert!(matches!(result.inserted_ids[1], Bson::ObjectId(_)));

		let command = received.lock().unwrap().clone();
		assert_eq!(command.get_str("insert").unwrap(), "c");
		assert!(command.get_bool("ordered").unwrap());
		let documents = command.get_array("documents").unwrap();
		assert_eq!(documents.len(), 2);
		assert_eq!(documents[1].as_document().unwrap().get("_id"), Some(&result.inserted_ids[1]));
	}

	#[async_std::test]
	async fn insert_one_reports_its_id() {
		let (_server, collection) = collection(|_| doc! { "ok": 1, "n": 1 }).await;
		let result = collection.insert_one(doc! { "_id": "x" }, None).await.unwrap();
		assert_eq!(result.inserted_id, Bson::String("x".to_string()));
	}

	#[async_std::test]
	async fn write_errors_are_surfaced() {
		let (_server, collection) = collection(|_| doc! {
			"ok": 1,
			"n": 0,
			"writeErrors": [{ "index": 0, "code": 11000, "codeName": "DuplicateKey", "errmsg": "E11000 duplicate key" }]
		}).await;

		let err = collection.insert_one(doc! { "_id": 1 }, None).await.unwrap_err();
		assert_eq!(err.code(), Some(11000));
		assert!(err.to_string().contains("E11000"));
	}

	#[async_std::test]
	async fn update_and_delete_report_counts() {
		let received = Arc::new(Mutex::new(Vec::new()));
		let (_server, collection) = collection({
			let received = received.clone();
			move |cmd| {
				received.lock().unwrap().push(cmd.clone());
				if cmd.contains_key("update") {
					doc! { "ok": 1, "n": 3, "nModified": 2 }
				} else {
					doc! { "ok": 1, "n": 4 }
				}
			}
		}).await;

		let updated = collection.update_many(doc! { "a": 1 }, doc! { "$set": { "b": 2 } }, None).await.unwrap();
		assert_eq!((updated.matched_count, updated.modified_count, updated.upserted_id), (3, 2, None));
		let deleted = collection.delete_many(doc! {}).await.unwrap();
		assert_eq!(deleted.deleted_count, 4);

		let received = received.lock().unwrap();
		let update = received[0].get_array("updates").unwrap()[0].as_document().unwrap().clone();
		assert!(update.get_bool("multi").unwrap());
		assert_eq!(received[1].get_array("deletes").unwrap()[0].as_document().unwrap().get_i32("limit").unwrap(), 0);
	}

	#[async_std::test]
	async fn counts_with_an_aggregation() {
		let pipeline = Arc::new(Mutex::new(Vec::new()));
		let (_server, collection) = collection({
			let pipeline = pipeline.clone();
			move |cmd| {
				*pipeline.lock().unwrap() = cmd.get_array("pipeline").unwrap().clone();
				doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.c", "firstBatch": [{ "_id": 1, "n": 5 }] } }
			}
		}).await;

		let count = collection.count_documents(Some(doc! { "a": 1 }), Some(CountOptions { limit: Some(10), ..CountOptions::default() }))
			.await
			.unwrap();
		assert_eq!(count, 5);

		let pipeline = pipeline.lock().unwrap();
		let stages = pipeline.iter()
			.map(|stage| stage.as_document().unwrap().keys().next().unwrap().clone())
			.collect::<Vec<_>>();
		assert_eq!(stages, vec!["$match", "$limit", "$group"]);
	}

	#[async_std::test]
	async fn empty_count_is_zero() {
		let (_server, collection) = collection(|_| doc! {
			"ok": 1, "cursor": { "id": 0_i64, "ns": "db.c", "firstBatch": [] }
		}).await;
		assert_eq!(collection.count_documents(None, None).await.unwrap(), 0);
	}

	#[async_std::test]
	async fn find_one_asks_for_a_single_batch() {
		let received = Arc::new(Mutex::new(Document::new()));
		let (_server, collection) = collection({
			let received = received.clone();
			move |cmd| {
				*received.lock().unwrap() = cmd.clone();
				doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.c", "firstBatch": [{ "a": 1 }] } }
			}
		}).await;

		let found = collection.find_one(Some(doc! { "a": 1 }), None).await.unwrap();
		assert_eq!(found, Some(doc! { "a": 1 }));

		let command = received.lock().unwrap().clone();
		assert_eq!(command.get_i64("limit").unwrap(), -1);
		assert_eq!(command.get_document("filter").unwrap(), &doc! { "a": 1 });
	}
}

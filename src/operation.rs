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
		common::{ReadConcern, ReadPreference, ReadPreferenceMode, ServerAddress, WriteConcern},
		select::SelectionCriteria,
		topology::{ServerDescription, ServerType, TopologyDescription, TopologyType},
		wire::DocumentSequence
	},
	bson::{doc, spec::BinarySubtype, Binary, Bson, Document},
	std::time::{Duration, Instant}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Intent {
	Read,
	Write
}

/// A logical command, executed by `Client::execute`.
#[derive(Debug, Clone)]
pub struct Operation {
	pub database:        String,
	pub command:         Document,
	pub intent:          Intent,
	/// Defaults to the client's read preference.
	pub read_preference: Option<ReadPreference>,
	pub read_concern:    Option<ReadConcern>,
	pub write_concern:   Option<WriteConcern>,
	/// Whether the command may be retried once after a network error.
	pub retryable:       bool,
	/// Overrides the client's operation timeout.
	pub timeout:         Option<Duration>,
	pub sequences:       Vec<DocumentSequence>,
	/// Cursor commands must go to the server that created the cursor.
	pub(crate) pinned:   Option<ServerAddress>
}

impl Operation {
	fn new(database: &str, command: Document, intent: Intent) -> Self {
		Self {
			database:        database.to_string(),
			command,
			intent,
			read_preference: None,
			read_concern:    None,
			write_concern:   None,
			retryable:       false,
			timeout:         None,
			sequences:       Vec::new(),
			pinned:          None
		}
	}

	pub fn read(database: &str, command: Document) -> Self {
		Self::new(database, command, Intent::Read)
	}

	pub fn write(database: &str, command: Document) -> Self {
		Self::new(database, command, Intent::Write)
	}

	pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
		self.read_preference = Some(read_preference);
		self
	}

	pub fn with_read_concern(mut self, read_concern: Option<ReadConcern>) -> Self {
		self.read_concern = read_concern;
		self
	}

	pub fn with_write_concern(mut self, write_concern: Option<WriteConcern>) -> Self {
		self.write_concern = write_concern;
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn with_sequence(mut self, identifier: &str, documents: Vec<Document>) -> Self {
		self.sequences.push(DocumentSequence { identifier: identifier.to_string(), documents });
		self
	}

	pub fn retryable(mut self, retryable: bool) -> Self {
		self.retryable = retryable;
		self
	}

	pub(crate) fn pinned_to(mut self, address: ServerAddress) -> Self {
		self.pinned = Some(address);
		self
	}

	pub fn name(&self) -> &str {
		self.command.keys().next().map_or("", String::as_str)
	}

	pub(crate) fn criteria(&self, default: &ReadPreference) -> SelectionCriteria {
		match self.intent {
			Intent::Write => SelectionCriteria::Write,
			Intent::Read => SelectionCriteria::Read(self.read_preference.clone().unwrap_or_else(|| default.clone()))
		}
	}

	/// The `$readPreference` to send, if any.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.md#passing-read-preference-to-mongos-and-load-balancers
	fn read_preference_document(&self, topology: TopologyType, server: ServerType) -> Option<Document> {
		let preference = match self.intent {
			Intent::Write => return None,
			Intent::Read => self.read_preference.as_ref()
		};
		let non_primary = preference.filter(|p| p.mode != ReadPreferenceMode::Primary);

		match (topology, server) {
			(TopologyType::Single, ServerType::Standalone) => None,
			(TopologyType::Single, ServerType::Mongos) | (TopologyType::Sharded, _) => non_primary.map(ReadPreference::to_document),
			// a directly connected member must accept the read whatever its role
			(TopologyType::Single, _) => Some(doc! { "mode": ReadPreferenceMode::PrimaryPreferred.as_str() }),
			_ => non_primary.map(ReadPreference::to_document)
		}
	}

	/// Builds the command sent to `server`.
	pub(crate) fn assemble(
		&self,
		topology: &TopologyDescription,
		server:   &ServerDescription,
		session:  Option<&Session>
	) -> Document {
		let mut command = self.command.clone();
		command.insert("$db", self.database.clone());

		if let Some(preference) = self.read_preference_document(topology.topology_type, server.server_type) {
			command.insert("$readPreference", preference);
		}

		match self.intent {
			Intent::Read => if let Some(read_concern) = &self.read_concern {
				command.insert("readConcern", read_concern.to_document());
			},
			Intent::Write => if let Some(write_concern) = &self.write_concern {
				command.insert("writeConcern", write_concern.to_document());
			}
		}

		if let Some(session) = session {
			command.insert("lsid", doc! { "id": session.lsid.clone() });
			command.insert("txnNumber", session.txn_number);
		}

		command
	}
}

/// The implicit session attached to a retryable write.
#[derive(Debug, Clone)]
pub(crate) struct Session {
	pub lsid:       Binary,
	pub txn_number: i64
}

impl Session {
	pub fn new(txn_number: i64) -> Self {
		let mut bytes = rand::random::<[u8; 16]>();
		// random (version 4) UUID
		bytes[6] = (bytes[6] & 0x0f) | 0x40;
		bytes[8] = (bytes[8] & 0x3f) | 0x80;
		Self {
			lsid: Binary { subtype: BinarySubtype::Uuid, bytes: bytes.to_vec() },
			txn_number
		}
	}
}

/// State carried across the attempts of one execution.
#[derive(Debug)]
pub(crate) struct RetryContext {
	pub attempt:     u32,
	pub first_error: Option<Error>,
	pub deadline:    Option<Instant>,
	pub excluded:    Vec<ServerAddress>
}

impl RetryContext {
	pub fn new(deadline: Option<Instant>) -> Self {
		Self { attempt: 0, first_error: None, deadline, excluded: Vec::new() }
	}

	/// Whether `error` permits another attempt. Only the first attempt is retried.
	pub fn can_retry(&self, error: &Error) -> bool {
		self.attempt == 0 && error.is_retryable()
			&& self.deadline.map_or(true, |deadline| Instant::now() < deadline)
	}

	pub fn record(&mut self, address: ServerAddress, error: Error) {
		self.attempt += 1;
		self.excluded.push(address);
		self.first_error.get_or_insert(error);
	}
}

fn is_ok(reply: &Document) -> bool {
	match reply.get("ok") {
		Some(Bson::Double(ok))  => *ok != 0.0,
		Some(Bson::Int32(ok))   => *ok != 0,
		Some(Bson::Int64(ok))   => *ok != 0,
		Some(Bson::Boolean(ok)) => *ok,
		_ => false
	}
}

fn server_error(error: &Document, labels: &Document) -> Error {
	Error::ServerCommand {
		code:      error.get_i32("code").unwrap_or(0),
		code_name: error.get_str("codeName").unwrap_or_default().to_string(),
		message:   error.get_str("errmsg").unwrap_or_default().to_string(),
		labels:    labels.get_array("errorLabels")
			.map(|labels| labels.iter().filter_map(|l| l.as_str().map(str::to_string)).collect())
			.unwrap_or_default()
	}
}

/// Turns `ok: 0` replies and write concern errors into errors.
pub(crate) fn check_reply(reply: Document) -> Result<Document> {
	if !is_ok(&reply) {
		return Err(server_error(&reply, &reply));
	}

	if let Ok(error) = reply.get_document("writeConcernError") {
		return Err(server_error(error, &reply));
	}

	Ok(reply)
}

#[cfg(test)]
mod tests {
	use {super::*, crate::common::Acknowledgment};

	fn topology(topology_type: TopologyType) -> TopologyDescription {
		let mut description = TopologyDescription::new(&[], false, None, Duration::from_secs(10));
		description.topology_type = topology_type;
		description
	}

	fn server(server_type: ServerType) -> ServerDescription {
		ServerDescription { server_type, ..ServerDescription::new(ServerAddress::new("a", 1)) }
	}

	#[test]
	fn accepts_any_truthy_ok() {
		assert!(check_reply(doc! { "ok": 1.0 }).is_ok());
		assert!(check_reply(doc! { "ok": 1 }).is_ok());
		assert!(check_reply(doc! { "ok": 1i64 }).is_ok());
		assert!(check_reply(doc! { "ok": true }).is_ok());
		assert!(check_reply(doc! {}).is_err());
	}

	#[test]
	fn surfaces_server_errors_verbatim() {
		let err = check_reply(doc! {
			"ok": 0, "code": 10107, "codeName": "NotWritablePrimary", "errmsg": "not primary",
			"errorLabels": ["RetryableWriteError"]
		}).unwrap_err();

		match &err {
			Error::ServerCommand { code, code_name, message, labels } => {
				assert_eq!(*code, 10107);
				assert_eq!(code_name, "NotWritablePrimary");
				assert_eq!(message, "not primary");
				assert_eq!(labels, &["RetryableWriteError".to_string()]);
			}
			other => panic!("unexpected error {:?}", other)
		}
		assert!(err.is_not_writable_primary());
	}

	#[test]
	fn surfaces_write_concern_errors() {
		let err = check_reply(doc! {
			"ok": 1, "n": 1, "writeConcernError": { "code": 64, "codeName": "WriteConcernFailed", "errmsg": "waiting" }
		}).unwrap_err();
		assert_eq!(err.code(), Some(64));
	}

	#[test]
	fn assembles_reads() {
		let operation = Operation::read("db", doc! { "find": "c" })
			.with_read_preference(ReadPreference::new(ReadPreferenceMode::Secondary))
			.with_read_concern(Some(ReadConcern { level: crate::common::ReadConcernLevel::Majority }));

		let command = operation.assemble(&topology(TopologyType::ReplicaSetWithPrimary), &server(ServerType::RsSecondary), None);
		assert_eq!(command.keys().next().map(String::as_str), Some("find"));
		assert_eq!(command.get_str("$db").unwrap(), "db");
		assert_eq!(command.get_document("$readPreference").unwrap().get_str("mode").unwrap(), "secondary");
		assert_eq!(command.get_document("readConcern").unwrap().get_str("level").unwrap(), "majority");
		assert!(!command.contains_key("writeConcern"));
	}

	#[test]
	fn read_preference_depends_on_deployment() {
		let primary = Operation::read("db", doc! { "find": "c" }).with_read_preference(ReadPreference::primary());
		let secondary = Operation::read("db", doc! { "find": "c" })
			.with_read_preference(ReadPreference::new(ReadPreferenceMode::Secondary));
		let has_preference = |operation: &Operation, topology_type, server_type| operation
			.assemble(&topology(topology_type), &server(server_type), None)
			.contains_key("$readPreference");

		assert!(!has_preference(&primary, TopologyType::ReplicaSetWithPrimary, ServerType::RsPrimary));
		assert!(!has_preference(&secondary, TopologyType::Single, ServerType::Standalone));
		assert!(has_preference(&primary, TopologyType::Single, ServerType::RsSecondary));
		assert!(has_preference(&secondary, TopologyType::Sharded, ServerType::Mongos));
		assert!(!has_preference(&primary, TopologyType::Sharded, ServerType::Mongos));
	}

	#[test]
	fn assembles_retryable_writes() {
		let operation = Operation::write("db", doc! { "insert": "c" })
			.with_write_concern(Some(WriteConcern { w: Some(Acknowledgment::Majority), ..WriteConcern::default() }));
		let session = Session::new(7);

		let command = operation.assemble(&topology(TopologyType::ReplicaSetWithPrimary), &server(ServerType::RsPrimary), Some(&session));
		assert_eq!(command.get_document("writeConcern").unwrap().get_str("w").unwrap(), "majority");
		assert_eq!(command.get_i64("txnNumber").unwrap(), 7);
		let lsid = command.get_document("lsid").unwrap().get_binary_generic("id").unwrap();
		assert_eq!(lsid.len(), 16);
		assert_eq!(lsid[6] >> 4, 4);
		assert!(!command.contains_key("$readPreference"));
	}

	#[test]
	fn retries_only_once() {
		let network = || Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
		let mut retry = RetryContext::new(None);
		assert!(retry.can_retry(&network()));
		assert!(!retry.can_retry(&Error::Timeout("find".into())));

		retry.record(ServerAddress::new("a", 1), network());
		assert!(!retry.can_retry(&network()));
		assert_eq!(retry.excluded, vec![ServerAddress::new("a", 1)]);
	}
}

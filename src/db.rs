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
	bson::Document,
	std::sync::Arc
};

#[derive(Debug, Clone)]
pub struct Database(pub(crate) Arc<DatabaseInner>);

#[derive(Debug, Clone)]
pub struct DatabaseInner {
	pub client:          Client,
	pub name:            String,
	pub read_preference: ReadPreference,
	pub read_concern:    Option<ReadConcern>,
	pub write_concern:   Option<WriteConcern>
}

impl std::ops::Deref for Database {
	type Target = DatabaseInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Database {
	pub fn collection(&self, name: &str) -> Collection {
		self.collection_with(name, None, None, None)
	}

	pub fn collection_with(
		&self,
		name:            &str,
		read_preference: Option<ReadPreference>,
		read_concern:    Option<ReadConcern>,
		write_concern:   Option<WriteConcern>
	) -> Collection {
		Collection {
			db:              self.clone(),
			name:            name.to_string(),
			read_preference: read_preference.unwrap_or_else(|| self.read_preference.clone()),
			read_concern:    read_concern.or(self.read_concern),
			write_concern:   write_concern.or_else(|| self.write_concern.clone())
		}
	}

	/// Runs a command against the primary. Commands are opaque to the client, so they are
	/// never retried.
	pub async fn run_command(&self, command: Document) -> Result<Document> {
		self.run_command_with(command, ReadPreference::primary()).await
	}

	pub async fn run_command_with(&self, command: Document, read_preference: ReadPreference) -> Result<Document> {
		self.client.execute(Operation::read(&self.name, command).with_read_preference(read_preference)).await
	}

	/// Runs a command that replies with a cursor and keeps iterating on the server that
	/// created it.
	pub(crate) async fn run_cursor_command(&self, operation: Operation, options: CursorOptions) -> Result<Cursor> {
		let read_preference = operation.read_preference.clone();
		let (reply, address) = self.client.execute_with_address(operation).await?;
		Cursor::new(self.client.clone(), address, &self.name, reply, read_preference, options)
	}

	/// see https://docs.mongodb.com/manual/reference/command/dropDatabase/
	pub async fn drop(&self) -> Result<()> {
		let operation = Operation::write(&self.name, bson::doc! { "dropDatabase": 1 })
			.with_write_concern(self.write_concern.clone());
		self.client.execute(operation).await.map(|_| ())
	}
}

/// Options applied to every `getMore` issued by a cursor.
#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
	pub batch_size:  Option<i64>,
	pub max_time_ms: Option<i64>
}

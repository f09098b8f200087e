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
	crate::{auth::AuthError, common::ServerAddress},
	std::io
};

pub type Result<T> = std::result::Result<T, Error>;

/// Codes the server uses to signal that it is no longer (or not yet) the primary.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.md#not-writable-primary-and-node-is-recovering
const NOT_WRITABLE_PRIMARY_CODES: [i32; 3] = [
	10107, // NotWritablePrimary
	13435, // NotPrimaryNoSecondaryOk
	10058  // LegacyNotPrimary
];

const NODE_IS_RECOVERING_CODES: [i32; 5] = [
	11600, // InterruptedAtShutdown
	11602, // InterruptedDueToReplStateChange
	13436, // NotPrimaryOrSecondary
	189,   // PrimarySteppedDown
	91     // ShutdownInProgress
];

const SHUTDOWN_CODES: [i32; 2] = [11600, 91];

#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Malformed wire data. Fatal to the connection that produced it.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// Transport failure. Fatal to the connection.
	#[error("network error: {0}")]
	Network(#[from] io::Error),
	/// A deadline elapsed at one of the suspension points.
	#[error("timed out: {0}")]
	Timeout(String),
	#[error("authentication failed: {0}")]
	Auth(#[from] AuthError),
	/// No eligible server was found before the selection deadline.
	#[error("server selection timed out: {0}")]
	ServerSelection(String),
	/// The server executed the command and reported a failure.
	#[error("command failed with code {code} ({code_name}): {message}")]
	ServerCommand {
		code:      i32,
		code_name: String,
		message:   String,
		labels:    Vec<String>
	},
	/// The checkout deadline elapsed while waiting for a free connection.
	#[error("connection pool for {0} exhausted")]
	PoolExhausted(ServerAddress),
	#[error("connection pool for {0} closed")]
	PoolClosed(ServerAddress),
	#[error("client has been closed")]
	ClientClosed,
	#[error("invalid client options: {0}")]
	InvalidOptions(String),
	#[error("tls error: {0}")]
	Tls(String),
	#[error("failed to encode document: {0}")]
	BsonEncode(#[from] bson::ser::Error),
	#[error("failed to decode document: {0}")]
	BsonDecode(#[from] bson::de::Error)
}

impl Error {
	pub(crate) fn protocol(message: impl Into<String>) -> Self {
		Self::Protocol(message.into())
	}

	pub(crate) fn invalid_options(message: impl Into<String>) -> Self {
		Self::InvalidOptions(message.into())
	}

	pub fn is_network(&self) -> bool {
		matches!(self, Self::Network(_))
	}

	pub fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout(_))
	}

	/// The server code, if the server reported this error.
	pub fn code(&self) -> Option<i32> {
		match self {
			Self::ServerCommand { code, .. } => Some(*code),
			_ => None
		}
	}

	/// "not writable primary" errors, falling back to the legacy message check
	/// for servers that do not report a code.
	pub fn is_not_writable_primary(&self) -> bool {
		match self {
			Self::ServerCommand { code, message, .. } => NOT_WRITABLE_PRIMARY_CODES.contains(code)
				|| (*code == 0 && message.contains("not master")),
			_ => false
		}
	}

	pub fn is_node_recovering(&self) -> bool {
		match self {
			Self::ServerCommand { code, message, .. } => NODE_IS_RECOVERING_CODES.contains(code)
				|| (*code == 0 && (message.contains("node is recovering")
					|| message.contains("not master or secondary"))),
			_ => false
		}
	}

	/// The node changed its role; the topology must be rechecked.
	pub fn is_state_change(&self) -> bool {
		self.is_not_writable_primary() || self.is_node_recovering()
	}

	/// The node is shutting down; pooled connections to it are useless.
	pub fn is_shutdown(&self) -> bool {
		matches!(self, Self::ServerCommand { code, .. } if SHUTDOWN_CODES.contains(code))
	}

	/// Errors after which an operation may be attempted once more on another server.
	pub fn is_retryable(&self) -> bool {
		self.is_network()
	}
}

impl From<rustls::Error> for Error {
	fn from(e: rustls::Error) -> Self {
		Self::Tls(e.to_string())
	}
}

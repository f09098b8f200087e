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

//! see https://github.com/mongodb/specifications/blob/master/source/auth/auth.md

use {
	crate::{Error, Result, common::{AuthMech, Credential}, operation::check_reply},
	async_trait::async_trait,
	base64::{Engine, engine::general_purpose::STANDARD as BASE64},
	bson::{doc, Document},
	hmac::{Hmac, Mac},
	rand::Rng,
	serde::{Serialize, Deserialize},
	sha1::Sha1,
	sha2::{Digest, Sha256}
};

const MIN_ITERATION_COUNT: u32 = 4096;

/// A channel that executes one command at a time. Authentication runs on top of it
/// before the connection is handed out.
#[async_trait]
pub trait CommandStream: Send {
	/// Sends `command`, which carries its own `$db`, and returns the raw reply.
	async fn command(&mut self, command: Document) -> Result<Document>;
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AuthError {
	#[error("invalid reply: {0}")]
	InvalidReply(String),
	#[error("server nonce does not extend the client nonce")]
	InvalidServerNonce,
	#[error("server signature mismatch")]
	InvalidServerSignature,
	#[error("iteration count {0} is below 4096")]
	InvalidIterationCount(u32),
	#[error("server error: {0}")]
	ServerError(String),
	#[error("unsupported mechanism {0}")]
	UnsupportedMechanism(&'static str),
	#[error("invalid credential: {0}")]
	InvalidOptions(String)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaslStartCommand<'a> {
	sasl_start:     i32,
	mechanism:      &'a str,
	#[serde(with = "serde_bytes")]
	payload:        &'a [u8],
	auto_authorize: i32,
	options:        SaslStartOptions,
	#[serde(rename = "$db")]
	db:             &'a str
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaslStartOptions {
	skip_empty_exchange: bool
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaslContinueCommand<'a> {
	sasl_continue:   i32,
	conversation_id: i32,
	#[serde(with = "serde_bytes")]
	payload:         &'a [u8],
	#[serde(rename = "$db")]
	db:              &'a str
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaslResponse {
	conversation_id: i32,
	done:            bool,
	#[serde(with = "serde_bytes")]
	payload:         Vec<u8>
}

/// The mechanism used when the credential names none.
pub fn default_mechanism(sasl_supported_mechs: Option<&[String]>) -> AuthMech {
	match sasl_supported_mechs {
		Some(mechs) if mechs.iter().any(|m| m == AuthMech::ScramSha256.as_str()) => AuthMech::ScramSha256,
		_ => AuthMech::ScramSha1
	}
}

pub(crate) async fn authenticate(
	stream:               &mut (impl CommandStream + ?Sized),
	credential:           &Credential,
	sasl_supported_mechs: Option<&[String]>
) -> Result<()> {
	let mechanism = credential.mechanism.unwrap_or_else(|| default_mechanism(sasl_supported_mechs));
	let source = credential.resolved_source();
	tracing::debug!(mechanism = mechanism.as_str(), source, "authenticating");

	match mechanism {
		AuthMech::MongoDbX509 => auth_x509(stream, credential.username.as_deref()).await,
		AuthMech::Plain => auth_plain(
			stream,
			source,
			required(&credential.username, "username")?,
			required(&credential.password, "password")?
		).await,
		AuthMech::ScramSha1 | AuthMech::ScramSha256 => {
			let version = if mechanism == AuthMech::ScramSha1 { ScramVersion::Sha1 } else { ScramVersion::Sha256 };
			let username = required(&credential.username, "username")?;
			let password = version.prepare_password(username, required(&credential.password, "password")?)?;
			auth_scram(stream, source, ScramConversation::new(version, username, &password, &client_nonce())).await
		}
		mechanism => Err(AuthError::UnsupportedMechanism(mechanism.as_str()).into())
	}
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
	value.as_deref().ok_or_else(|| AuthError::InvalidOptions(format!("{} is required", name)).into())
}

/// Runs `command` and maps a server-side failure to an authentication error.
async fn run(stream: &mut (impl CommandStream + ?Sized), command: Document) -> Result<Document> {
	let reply = stream.command(command).await?;
	check_reply(reply).map_err(|e| match e {
		Error::ServerCommand { message, .. } => AuthError::ServerError(message).into(),
		e => e
	})
}

fn sasl_response(reply: Document) -> Result<SaslResponse> {
	bson::from_document(reply).map_err(|e| AuthError::InvalidReply(e.to_string()).into())
}

async fn auth_x509(stream: &mut (impl CommandStream + ?Sized), username: Option<&str>) -> Result<()> {
	let mut command = doc! { "authenticate": 1, "mechanism": AuthMech::MongoDbX509.as_str() };
	if let Some(username) = username {
		command.insert("user", username);
	}
	command.insert("$db", "$external");
	run(stream, command).await?;
	Ok(())
}

async fn auth_plain(
	stream:   &mut (impl CommandStream + ?Sized),
	source:   &str,
	username: &str,
	password: &str
) -> Result<()> {
	let payload = format!("\0{}\0{}", username, password);
	let reply = run(stream, bson::to_document(&SaslStartCommand {
		sasl_start:     1,
		mechanism:      AuthMech::Plain.as_str(),
		payload:        payload.as_bytes(),
		auto_authorize: 1,
		options:        SaslStartOptions { skip_empty_exchange: true },
		db:             source
	})?).await?;

	if !sasl_response(reply)?.done {
		return Err(AuthError::InvalidReply("PLAIN conversation did not complete".into()).into());
	}

	Ok(())
}

async fn auth_scram(
	stream:       &mut (impl CommandStream + ?Sized),
	source:       &str,
	mut scram:    ScramConversation
) -> Result<()> {
	// client first message

	let payload = scram.client_first();
	let reply = run(stream, bson::to_document(&SaslStartCommand {
		sasl_start:     1,
		mechanism:      scram.version.mechanism().as_str(),
		payload:        payload.as_bytes(),
		auto_authorize: 1,
		options:        SaslStartOptions { skip_empty_exchange: true },
		db:             source
	})?).await?;

	// server first message

	let response = sasl_response(reply)?;
	let conversation_id = response.conversation_id;
	let payload = scram.client_final(utf8(&response.payload)?)?;

	let reply = run(stream, bson::to_document(&SaslContinueCommand {
		sasl_continue:   1,
		conversation_id,
		payload:         payload.as_bytes(),
		db:              source
	})?).await?;

	// server final message

	let mut response = sasl_response(reply)?;
	scram.verify_server_final(utf8(&response.payload)?)?;

	// servers that ignore skipEmptyExchange expect one more round
	while !response.done {
		response = sasl_response(run(stream, bson::to_document(&SaslContinueCommand {
			sasl_continue:   1,
			conversation_id,
			payload:         &[],
			db:              source
		})?).await?)?;
	}

	Ok(())
}

fn utf8(payload: &[u8]) -> Result<&str> {
	std::str::from_utf8(payload).map_err(|_| AuthError::InvalidReply("SASL payload is not UTF-8".into()).into())
}

fn client_nonce() -> String {
	BASE64.encode(rand::thread_rng().gen::<[u8; 24]>())
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ScramVersion {
	Sha1,
	Sha256
}

impl ScramVersion {
	fn mechanism(self) -> AuthMech {
		match self {
			Self::Sha1   => AuthMech::ScramSha1,
			Self::Sha256 => AuthMech::ScramSha256
		}
	}

	/// SCRAM-SHA-1 hashes the password the way the legacy MONGODB-CR mechanism did,
	/// SCRAM-SHA-256 normalizes it with SASLprep.
	fn prepare_password(self, username: &str, password: &str) -> Result<String> {
		match self {
			Self::Sha1   => Ok(format!("{:x}", md5::compute(format!("{}:mongo:{}", username, password)))),
			Self::Sha256 => stringprep::saslprep(password)
				.map(|p| p.into_owned())
				.map_err(|e| AuthError::InvalidOptions(format!("password rejected by SASLprep: {}", e)).into())
		}
	}

	fn hi(self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
		match self {
			Self::Sha1 => {
				let mut out = [0u8; 20];
				pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out);
				out.to_vec()
			}
			Self::Sha256 => {
				let mut out = [0u8; 32];
				pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
				out.to_vec()
			}
		}
	}

	fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
		let invalid_key = |_| Error::from(AuthError::InvalidReply("invalid HMAC key".into()));
		Ok(match self {
			Self::Sha1 => {
				let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(invalid_key)?;
				mac.update(data);
				mac.finalize().into_bytes().to_vec()
			}
			Self::Sha256 => {
				let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(invalid_key)?;
				mac.update(data);
				mac.finalize().into_bytes().to_vec()
			}
		})
	}

	fn h(self, data: &[u8]) -> Vec<u8> {
		match self {
			Self::Sha1   => Sha1::digest(data).to_vec(),
			Self::Sha256 => Sha256::digest(data).to_vec()
		}
	}
}

/// Client side of a SCRAM exchange.
///
/// see https://tools.ietf.org/html/rfc5802
#[derive(Debug)]
struct ScramConversation {
	version:           ScramVersion,
	password:          String,
	client_nonce:      String,
	client_first_bare: String,
	salted_password:   Vec<u8>,
	auth_message:      String
}

impl ScramConversation {
	/// `password` must already be prepared for `version`.
	fn new(version: ScramVersion, username: &str, password: &str, client_nonce: &str) -> Self {
		let username = username.replace('=', "=3D").replace(',', "=2C");
		Self {
			version,
			password:          password.to_string(),
			client_nonce:      client_nonce.to_string(),
			client_first_bare: format!("n={},r={}", username, client_nonce),
			salted_password:   Vec::new(),
			auth_message:      String::new()
		}
	}

	fn client_first(&self) -> String {
		format!("n,,{}", self.client_first_bare)
	}

	fn client_final(&mut self, server_first: &str) -> Result<String> {
		let nonce = attribute(server_first, 'r')?;
		let salt = BASE64.decode(attribute(server_first, 's')?)
			.map_err(|_| AuthError::InvalidReply("salt is not base64".into()))?;
		let iterations = attribute(server_first, 'i')?.parse::<u32>()
			.map_err(|_| AuthError::InvalidReply("invalid iteration count".into()))?;

		if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
			return Err(AuthError::InvalidServerNonce.into());
		} else if iterations < MIN_ITERATION_COUNT {
			return Err(AuthError::InvalidIterationCount(iterations).into());
		}

		self.salted_password = self.version.hi(self.password.as_bytes(), &salt, iterations);
		let client_key = self.version.hmac(&self.salted_password, b"Client Key")?;
		let stored_key = self.version.h(&client_key);

		let without_proof = format!("c=biws,r={}", nonce);
		self.auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);
		let client_signature = self.version.hmac(&stored_key, self.auth_message.as_bytes())?;

		let proof = client_key.iter()
			.zip(&client_signature)
			.map(|(k, s)| k ^ s)
			.collect::<Vec<_>>();

		Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
	}

	fn verify_server_final(&self, server_final: &str) -> Result<()> {
		if let Ok(e) = attribute(server_final, 'e') {
			return Err(AuthError::ServerError(e.to_string()).into());
		}

		let verifier = BASE64.decode(attribute(server_final, 'v')?)
			.map_err(|_| AuthError::InvalidReply("server signature is not base64".into()))?;

		let server_key = self.version.hmac(&self.salted_password, b"Server Key")?;
		let server_signature = self.version.hmac(&server_key, self.auth_message.as_bytes())?;

		if verifier != server_signature {
			return Err(AuthError::InvalidServerSignature.into());
		}

		Ok(())
	}
}

/// Value of the `name=` attribute of a SCRAM message.
fn attribute(message: &str, name: char) -> Result<&str> {
	message.split(',')
		.find_map(|part| part.strip_prefix(name).and_then(|p| p.strip_prefix('=')))
		.ok_or_else(|| AuthError::InvalidReply(format!("missing attribute `{}`", name)).into())
}

#[cfg(test)]
mod tests {
	use {super::*, std::collections::VecDeque};

	#[derive(Default)]
	struct Script {
		replies: VecDeque<Document>,
		sent:    Vec<Document>
	}

	#[async_trait]
	impl CommandStream for Script {
		async fn command(&mut self, command: Document) -> Result<Document> {
			self.sent.push(command);
			self.replies.pop_front()
				.ok_or_else(|| Error::protocol("script exhausted"))
		}
	}

	fn sasl_reply(payload: &str, done: bool) -> Document {
		doc! {
			"conversationId": 1,
			"done": done,
			"payload": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: payload.as_bytes().to_vec() },
			"ok": 1.0
		}
	}

	// https://tools.ietf.org/html/rfc7677#section-3
	#[test]
	fn scram_sha256_conversation() {
		let mut scram = ScramConversation::new(ScramVersion::Sha256, "user", "pencil", "rOprNGfwEbeRWgbNEkqO");
		assert_eq!(scram.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

		let client_final = scram.client_final(
			"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096").unwrap();
		assert_eq!(client_final, "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
			p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=");

		scram.verify_server_final("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=").unwrap();
		assert!(matches!(
			scram.verify_server_final("v=AAAATRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4="),
			Err(Error::Auth(AuthError::InvalidServerSignature))));
	}

	// https://tools.ietf.org/html/rfc5802#section-5
	#[test]
	fn scram_sha1_conversation() {
		let mut scram = ScramConversation::new(ScramVersion::Sha1, "user", "pencil", "fyko+d2lbbFgONRv9qkxdawL");
		let client_final = scram.client_final(
			"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096").unwrap();
		assert_eq!(client_final, "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=");
		scram.verify_server_final("v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap();
	}

	#[test]
	fn rejects_bad_server_first() {
		let mut scram = ScramConversation::new(ScramVersion::Sha256, "user", "pencil", "abc");
		assert!(matches!(scram.client_final("r=xyz123,s=QSXCR+Q6sek8bf92,i=4096"),
			Err(Error::Auth(AuthError::InvalidServerNonce))));
		assert!(matches!(scram.client_final("r=abc,s=QSXCR+Q6sek8bf92,i=4096"),
			Err(Error::Auth(AuthError::InvalidServerNonce))));
		assert!(matches!(scram.client_final("r=abcdef,s=QSXCR+Q6sek8bf92,i=1000"),
			Err(Error::Auth(AuthError::InvalidIterationCount(1000)))));
		assert!(matches!(scram.client_final("r=abcdef,i=4096"),
			Err(Error::Auth(AuthError::InvalidReply(_)))));
	}

	#[test]
	fn escapes_username() {
		let scram = ScramConversation::new(ScramVersion::Sha256, "a=b,c", "p", "n");
		assert_eq!(scram.client_first(), "n,,n=a=3Db=2Cc,r=n");
	}

	#[test]
	fn prepares_passwords() {
		let hashed = ScramVersion::Sha1.prepare_password("user", "pencil").unwrap();
		assert_eq!(hashed.len(), 32);
		assert!(hashed.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
		assert_eq!(ScramVersion::Sha256.prepare_password("user", "I\u{00AD}X").unwrap(), "IX");
	}

	#[test]
	fn picks_default_mechanism() {
		let mechs = vec!["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()];
		assert_eq!(default_mechanism(Some(mechs.as_slice())), AuthMech::ScramSha256);
		assert_eq!(default_mechanism(Some(&mechs[..1])), AuthMech::ScramSha1);
		assert_eq!(default_mechanism(None), AuthMech::ScramSha1);
	}

	#[async_std::test]
	async fn plain_sends_sasl_start() {
		let mut script = Script::default();
		script.replies.push_back(sasl_reply("", true));
		let credential = Credential {
			username:  Some("u".into()),
			password:  Some("p".into()),
			mechanism: Some(AuthMech::Plain),
			..Credential::default()
		};

		authenticate(&mut script, &credential, None).await.unwrap();
		let sent = &script.sent[0];
		assert_eq!(sent.get_str("mechanism").unwrap(), "PLAIN");
		assert_eq!(sent.get_str("$db").unwrap(), "$external");
		assert_eq!(sent.get_binary_generic("payload").unwrap(), b"\0u\0p");
	}

	#[async_std::test]
	async fn x509_uses_external_source() {
		let mut script = Script::default();
		script.replies.push_back(doc! { "ok": 1 });
		let credential = Credential { mechanism: Some(AuthMech::MongoDbX509), ..Credential::default() };

		authenticate(&mut script, &credential, None).await.unwrap();
		assert_eq!(script.sent[0], doc! { "authenticate": 1, "mechanism": "MONGODB-X509", "$db": "$external" });
	}

	#[async_std::test]
	async fn server_rejection_is_auth_error() {
		let mut script = Script::default();
		script.replies.push_back(doc! { "ok": 0, "code": 18, "codeName": "AuthenticationFailed", "errmsg": "bad auth" });
		let credential = Credential {
			username: Some("u".into()),
			password: Some("p".into()),
			..Credential::default()
		};

		let err = authenticate(&mut script, &credential, Some(&["SCRAM-SHA-256".to_string()][..])).await.unwrap_err();
		assert!(matches!(err, Error::Auth(AuthError::ServerError(ref m)) if m == "bad auth"));
		assert_eq!(script.sent[0].get_str("mechanism").unwrap(), "SCRAM-SHA-256");
		assert_eq!(script.sent[0].get_str("$db").unwrap(), "admin");
	}
}

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

//! OP_MSG and OP_COMPRESSED framing.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/message/OP_MSG.md
//! https://github.com/mongodb/specifications/blob/master/source/compression/OP_COMPRESSED.md

use {
	crate::{Error, Result},
	async_std::io::{ReadExt, WriteExt},
	bitflags::bitflags,
	bson::Document,
	futures_io::{AsyncRead, AsyncWrite},
	serde::{Serialize, Serializer},
	std::{fmt, str::FromStr}
};

pub const HEADER_LEN:               usize = 16;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;
pub const MIN_WIRE_VERSION:         i32   = 6;
pub const MAX_WIRE_VERSION:         i32   = 21;

/// Length of the OP_COMPRESSED prefix following the header:
/// original op code, uncompressed size, compressor id.
const COMPRESSION_PREFIX_LEN: usize = 9;
/// Flag bits 0-15 must be understood by the receiver.
const REQUIRED_FLAG_MASK: u32 = 0xffff;

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Compressed = 2012,
	Msg        = 2013
}

impl OpCode {
	fn from_i32(v: i32) -> Result<Self> {
		match v {
			2012 => Ok(Self::Compressed),
			2013 => Ok(Self::Msg),
			_    => Err(Error::protocol(format!("unknown op code {}", v)))
		}
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
	pub struct MessageFlags: u32 {
		const CHECKSUM_PRESENT = 1;
		const MORE_TO_COME     = 1 << 1;
		const EXHAUST_ALLOWED  = 1 << 16;
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Header {
	message_length: i32,
	request_id:     i32,
	response_to:    i32,
	op_code:        OpCode
}

impl Header {
	fn write_to(self, buf: &mut Vec<u8>) {
		buf.extend_from_slice(&self.message_length.to_le_bytes());
		buf.extend_from_slice(&self.request_id.to_le_bytes());
		buf.extend_from_slice(&self.response_to.to_le_bytes());
		buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
	}

	fn read_from(buf: &[u8]) -> Result<Self> {
		Ok(Self {
			message_length: read_i32(buf, 0),
			request_id:     read_i32(buf, 4),
			response_to:    read_i32(buf, 8),
			op_code:        OpCode::from_i32(read_i32(buf, 12))?
		})
	}
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
	i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Compressor {
	Noop   = 0,
	Snappy = 1,
	Zlib   = 2,
	Zstd   = 3
}

impl Compressor {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Noop   => "noop",
			Self::Snappy => "snappy",
			Self::Zlib   => "zlib",
			Self::Zstd   => "zstd"
		}
	}

	fn from_id(id: u8) -> Result<Self> {
		Ok(match id {
			0 => Self::Noop,
			1 => Self::Snappy,
			2 => Self::Zlib,
			3 => Self::Zstd,
			_ => return Err(Error::protocol(format!("unknown compressor id {}", id)))
		})
	}

	/// Compressors this build can encode and decode.
	pub fn supported() -> &'static [Self] {
		#[cfg(feature = "compress")]
		return &[Self::Noop, Self::Snappy, Self::Zlib, Self::Zstd];
		#[cfg(not(feature = "compress"))]
		return &[Self::Noop];
	}

	fn compress(self, data: &[u8], zlib_level: i32) -> Result<Vec<u8>> {
		match self {
			Self::Noop => Ok(data.to_vec()),
			#[cfg(feature = "compress")]
			Self::Snappy => snap::raw::Encoder::new().compress_vec(data)
				.map_err(|e| Error::protocol(format!("snappy compression failed: {}", e))),
			#[cfg(feature = "compress")]
			Self::Zlib => {
				use std::io::Write;
				let level = match u32::try_from(zlib_level) {
					Ok(level) => flate2::Compression::new(level),
					Err(_)    => flate2::Compression::default()
				};
				let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
				encoder.write_all(data)?;
				Ok(encoder.finish()?)
			}
			#[cfg(feature = "compress")]
			Self::Zstd => Ok(zstd::stream::encode_all(data, 0)?),
			#[cfg(not(feature = "compress"))]
			compressor => Err(Error::protocol(format!("compressor {} is not supported", compressor)))
		}
	}

	fn decompress(self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
		let out = match self {
			Self::Noop => data.to_vec(),
			#[cfg(feature = "compress")]
			Self::Snappy => snap::raw::Decoder::new().decompress_vec(data)
				.map_err(|e| Error::protocol(format!("invalid snappy payload: {}", e)))?,
			#[cfg(feature = "compress")]
			Self::Zlib => {
				use std::io::Read;
				let mut out = Vec::with_capacity(uncompressed_size);
				flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)
					.map_err(|e| Error::protocol(format!("invalid zlib payload: {}", e)))?;
				out
			}
			#[cfg(feature = "compress")]
			Self::Zstd => zstd::stream::decode_all(data)
				.map_err(|e| Error::protocol(format!("invalid zstd payload: {}", e)))?,
			#[cfg(not(feature = "compress"))]
			compressor => return Err(Error::protocol(format!("compressor {} is not supported", compressor)))
		};

		if out.len() != uncompressed_size {
			return Err(Error::protocol(format!(
				"decompressed {} bytes, expected {}", out.len(), uncompressed_size)));
		}

		Ok(out)
	}
}

impl fmt::Display for Compressor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Compressor {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Ok(match s {
			"noop"   => Self::Noop,
			"snappy" => Self::Snappy,
			"zlib"   => Self::Zlib,
			"zstd"   => Self::Zstd,
			_ => return Err(Error::invalid_options(format!("unknown compressor `{}`", s)))
		})
	}
}

impl Serialize for Compressor {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

/// Commands whose payload must never be compressed.
pub fn is_compressible(command_name: &str) -> bool {
	!matches!(command_name,
		"hello" | "isMaster" | "ismaster" | "saslStart" | "saslContinue" | "getnonce"
		| "authenticate" | "createUser" | "updateUser" | "copydbSaslStart"
		| "copydbgetnonce" | "copydb")
}

/// A kind 1 section.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
	pub identifier: String,
	pub documents:  Vec<Document>
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	pub request_id:  i32,
	pub response_to: i32,
	pub flags:       MessageFlags,
	/// The kind 0 section.
	pub document:    Document,
	pub sequences:   Vec<DocumentSequence>,
	/// Carried through unverified when `CHECKSUM_PRESENT` is set.
	pub checksum:    Option<u32>
}

impl Message {
	pub fn new(request_id: i32, document: Document) -> Self {
		Self {
			request_id,
			response_to: 0,
			flags:       MessageFlags::empty(),
			document,
			sequences:   Vec::new(),
			checksum:    None
		}
	}

	pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
		self.sequences.push(DocumentSequence { identifier: identifier.into(), documents });
		self
	}

	/// Flag bits, sections and checksum: everything after the header.
	fn encode_body(&self) -> Result<Vec<u8>> {
		let mut buf = Vec::with_capacity(256);
		buf.extend_from_slice(&self.flags.bits().to_le_bytes());
		buf.push(0);
		self.document.to_writer(&mut buf)?;

		for sequence in &self.sequences {
			buf.push(1);
			let start = buf.len();
			buf.extend_from_slice(&[0; 4]);
			if sequence.identifier.as_bytes().contains(&0) {
				return Err(Error::protocol("sequence identifier contains a nul byte"));
			}
			buf.extend_from_slice(sequence.identifier.as_bytes());
			buf.push(0);
			for doc in &sequence.documents {
				doc.to_writer(&mut buf)?;
			}
			let size = (buf.len() - start) as i32;
			buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
		}

		if self.flags.contains(MessageFlags::CHECKSUM_PRESENT) {
			buf.extend_from_slice(&self.checksum.unwrap_or(0).to_le_bytes());
		}

		Ok(buf)
	}

	/// Encodes the message as a plain OP_MSG.
	pub fn encode(&self) -> Result<Vec<u8>> {
		let body = self.encode_body()?;
		let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
		Header {
			message_length: (HEADER_LEN + body.len()) as i32,
			request_id:     self.request_id,
			response_to:    self.response_to,
			op_code:        OpCode::Msg
		}.write_to(&mut buf);
		buf.extend_from_slice(&body);
		Ok(buf)
	}

	/// Encodes the message as an OP_COMPRESSED wrapping an OP_MSG.
	pub fn encode_compressed(&self, compressor: Compressor, zlib_level: i32) -> Result<Vec<u8>> {
		let body = self.encode_body()?;
		let compressed = compressor.compress(&body, zlib_level)?;
		let mut buf = Vec::with_capacity(HEADER_LEN + COMPRESSION_PREFIX_LEN + compressed.len());
		Header {
			message_length: (HEADER_LEN + COMPRESSION_PREFIX_LEN + compressed.len()) as i32,
			request_id:     self.request_id,
			response_to:    self.response_to,
			op_code:        OpCode::Compressed
		}.write_to(&mut buf);
		buf.extend_from_slice(&(OpCode::Msg as i32).to_le_bytes());
		buf.extend_from_slice(&(body.len() as i32).to_le_bytes());
		buf.push(compressor as u8);
		buf.extend_from_slice(&compressed);
		Ok(buf)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
	Message {
		message:  Message,
		/// Bytes taken from the front of the input.
		consumed: usize
	},
	/// At least `needed` more bytes are required before a frame can be parsed.
	Incomplete {
		needed: usize
	}
}

/// Decodes the first frame in `buf`. Partial input is never an error.
pub fn decode(buf: &[u8], max_message_size: usize) -> Result<Decoded> {
	if buf.len() < 4 {
		return Ok(Decoded::Incomplete { needed: HEADER_LEN - buf.len() });
	}

	let length = read_i32(buf, 0);
	if length < HEADER_LEN as i32 || length as usize > max_message_size {
		return Err(Error::protocol(format!("invalid message length {}", length)));
	}

	let length = length as usize;
	if buf.len() < length {
		return Ok(Decoded::Incomplete { needed: length - buf.len() });
	}

	let header = Header::read_from(buf)?;
	let frame = &buf[HEADER_LEN..length];
	let decompressed;
	let body = match header.op_code {
		OpCode::Msg => frame,
		OpCode::Compressed => {
			if frame.len() < COMPRESSION_PREFIX_LEN {
				return Err(Error::protocol("truncated OP_COMPRESSED prefix"));
			}
			let original = OpCode::from_i32(read_i32(frame, 0))?;
			if original != OpCode::Msg {
				return Err(Error::protocol(format!("cannot decode compressed op code {:?}", original)));
			}
			let size = read_i32(frame, 4);
			if size < 0 || size as usize > max_message_size {
				return Err(Error::protocol(format!("invalid uncompressed size {}", size)));
			}
			decompressed = Compressor::from_id(frame[8])?
				.decompress(&frame[COMPRESSION_PREFIX_LEN..], size as usize)?;
			&decompressed[..]
		}
	};

	let message = decode_body(header, body)?;
	Ok(Decoded::Message { message, consumed: length })
}

fn decode_body(header: Header, body: &[u8]) -> Result<Message> {
	if body.len() < 5 {
		return Err(Error::protocol("OP_MSG body too short"));
	}

	let bits = read_i32(body, 0) as u32;
	let flags = MessageFlags::from_bits_retain(bits);
	let unknown = bits & REQUIRED_FLAG_MASK & !MessageFlags::all().bits();
	if unknown != 0 {
		return Err(Error::protocol(format!("unknown required flag bits {:#x}", unknown)));
	}

	let (mut sections, checksum) = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
		if body.len() < 4 + 4 + 1 {
			return Err(Error::protocol("checksum flag set but no room for the checksum"));
		}
		let end = body.len() - 4;
		(&body[4..end], Some(read_i32(body, end) as u32))
	} else {
		(&body[4..], None)
	};

	let mut document = None;
	let mut sequences = Vec::new();

	while let Some((&kind, rest)) = sections.split_first() {
		sections = rest;
		match kind {
			0 => {
				if document.is_some() {
					return Err(Error::protocol("more than one body section"));
				}
				let (doc, rest) = split_document(sections)?;
				document = Some(doc);
				sections = rest;
			}
			1 => {
				if sections.len() < 4 {
					return Err(Error::protocol("truncated document sequence"));
				}
				let size = read_i32(sections, 0);
				if size < 5 || size as usize > sections.len() {
					return Err(Error::protocol(format!("invalid document sequence size {}", size)));
				}
				let (mut section, rest) = sections[4..].split_at(size as usize - 4);
				sections = rest;

				let nul = section.iter().position(|b| *b == 0)
					.ok_or_else(|| Error::protocol("unterminated sequence identifier"))?;
				let identifier = std::str::from_utf8(&section[..nul])
					.map_err(|_| Error::protocol("sequence identifier is not UTF-8"))?
					.to_string();
				section = &section[nul + 1..];

				let mut documents = Vec::new();
				while !section.is_empty() {
					let (doc, rest) = split_document(section)?;
					documents.push(doc);
					section = rest;
				}
				sequences.push(DocumentSequence { identifier, documents });
			}
			kind => return Err(Error::protocol(format!("unknown section kind {}", kind)))
		}
	}

	Ok(Message {
		request_id:  header.request_id,
		response_to: header.response_to,
		flags,
		document:    document.ok_or_else(|| Error::protocol("message has no body section"))?,
		sequences,
		checksum
	})
}

/// Splits one length-prefixed document off the front of `buf`.
fn split_document(buf: &[u8]) -> Result<(Document, &[u8])> {
	if buf.len() < 5 {
		return Err(Error::protocol("truncated document"));
	}
	let len = read_i32(buf, 0);
	if len < 5 || len as usize > buf.len() {
		return Err(Error::protocol(format!("invalid document length {}", len)));
	}
	let (doc, rest) = buf.split_at(len as usize);
	let doc = Document::from_reader(doc)
		.map_err(|e| Error::protocol(format!("malformed document: {}", e)))?;
	Ok((doc, rest))
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Debug)]
pub struct FrameDecoder {
	buf:              Vec<u8>,
	max_message_size: usize
}

impl FrameDecoder {
	pub fn new(max_message_size: usize) -> Self {
		Self { buf: Vec::new(), max_message_size }
	}

	pub fn extend(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Returns the next complete message, or `None` until more bytes arrive.
	pub fn next_message(&mut self) -> Result<Option<Message>> {
		match decode(&self.buf, self.max_message_size)? {
			Decoded::Message { message, consumed } => {
				self.buf.drain(..consumed);
				Ok(Some(message))
			}
			Decoded::Incomplete { .. } => Ok(None)
		}
	}
}

/// Reads exactly one frame. The length prefix is validated before the rest is read.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, max_message_size: usize) -> Result<Message> {
	let mut prefix = [0u8; 4];
	reader.read_exact(&mut prefix).await?;
	let length = i32::from_le_bytes(prefix);
	if length < HEADER_LEN as i32 || length as usize > max_message_size {
		return Err(Error::protocol(format!("invalid message length {}", length)));
	}

	let mut buf = vec![0u8; length as usize];
	buf[..4].copy_from_slice(&prefix);
	reader.read_exact(&mut buf[4..]).await?;

	match decode(&buf, max_message_size)? {
		Decoded::Message { message, .. } => Ok(message),
		Decoded::Incomplete { .. } => Err(Error::protocol("frame shorter than its length prefix"))
	}
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
	writer.write_all(bytes).await?;
	writer.flush().await?;
	Ok(())
}

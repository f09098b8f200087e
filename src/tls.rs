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
	crate::{Error, Result, common::TlsOptions},
	rustls::{
		Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerName,
		client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier}
	},
	std::{path::Path, sync::Arc, time::SystemTime}
};

const ENCRYPTED_KEY_TAG: &str = "ENCRYPTED PRIVATE KEY";

/// Builds the client configuration shared by every connection of a client.
pub(crate) fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>> {
	if options.crl_file.is_some() {
		return Err(Error::invalid_options("tlsCRLFile is not supported by the rustls backend"));
	}

	let mut roots = RootCertStore::empty();
	match &options.ca_file {
		Some(path) => {
			let certs = rustls_pemfile::certs(&mut read_file(path)?.as_slice())
				.map_err(|e| Error::Tls(format!("invalid CA file {}: {}", path.display(), e)))?;
			let (added, _) = roots.add_parsable_certificates(&certs);
			if added == 0 {
				return Err(Error::Tls(format!("no usable certificates in {}", path.display())));
			}
		}
		None => roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta|
			OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)))
	}

	let builder = ClientConfig::builder()
		.with_safe_defaults()
		.with_root_certificates(roots.clone());

	let mut config = match &options.certificate_key_file {
		Some(path) => {
			let (certs, key) = load_identity(path, options.certificate_key_file_password.as_deref())?;
			builder.with_single_cert(certs, key)?
		}
		None => builder.with_no_client_auth()
	};

	if options.allow_invalid_certificates {
		tracing::warn!("server certificate verification is disabled");
		config.dangerous().set_certificate_verifier(Arc::new(NoCertVerifier));
	} else if options.allow_invalid_hostnames {
		tracing::warn!("server host name verification is disabled");
		config.dangerous().set_certificate_verifier(Arc::new(NoHostnameVerifier(WebPkiVerifier::new(roots, None))));
	}

	Ok(Arc::new(config))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
	std::fs::read(path).map_err(|e| Error::Tls(format!("cannot read {}: {}", path.display(), e)))
}

/// Loads the client certificate chain and private key from one PEM file.
fn load_identity(path: &Path, password: Option<&str>) -> Result<(Vec<Certificate>, PrivateKey)> {
	let bytes = read_file(path)?;
	let certs = rustls_pemfile::certs(&mut bytes.as_slice())
		.map_err(|e| Error::Tls(format!("invalid certificate file {}: {}", path.display(), e)))?
		.into_iter()
		.map(Certificate)
		.collect::<Vec<_>>();

	if certs.is_empty() {
		return Err(Error::Tls(format!("no certificate in {}", path.display())));
	}

	let key = match password {
		Some(password) => decrypt_key(&bytes, password)?,
		None => plain_key(&bytes)?
	};

	key.map(|key| (certs, PrivateKey(key)))
		.ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

fn plain_key(bytes: &[u8]) -> Result<Option<Vec<u8>>> {
	let mut reader = bytes;
	loop {
		match rustls_pemfile::read_one(&mut reader)
			.map_err(|e| Error::Tls(format!("invalid PEM: {}", e)))? {
			Some(rustls_pemfile::Item::PKCS8Key(key) | rustls_pemfile::Item::RSAKey(key)
				| rustls_pemfile::Item::ECKey(key)) => return Ok(Some(key)),
			Some(_) => continue,
			None => return Ok(None)
		}
	}
}

fn decrypt_key(bytes: &[u8], password: &str) -> Result<Option<Vec<u8>>> {
	let blocks = pem::parse_many(bytes).map_err(|e| Error::Tls(format!("invalid PEM: {}", e)))?;
	let Some(block) = blocks.iter().find(|block| block.tag() == ENCRYPTED_KEY_TAG) else {
		return Ok(None);
	};

	let info = pkcs8::EncryptedPrivateKeyInfo::try_from(block.contents())
		.map_err(|e| Error::Tls(format!("invalid encrypted key: {}", e)))?;
	let key = info.decrypt(password)
		.map_err(|e| Error::Tls(format!("cannot decrypt private key: {}", e)))?;
	Ok(Some(key.as_bytes().to_vec()))
}

/// Accepts any server certificate.
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
	fn verify_server_cert(
		&self,
		_end_entity:    &Certificate,
		_intermediates: &[Certificate],
		_server_name:   &ServerName,
		_scts:          &mut dyn Iterator<Item = &[u8]>,
		_ocsp_response: &[u8],
		_now:           SystemTime
	) -> std::result::Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}
}

/// Verifies the chain against the trust store but accepts any server name.
struct NoHostnameVerifier(WebPkiVerifier);

impl ServerCertVerifier for NoHostnameVerifier {
	fn verify_server_cert(
		&self,
		end_entity:    &Certificate,
		intermediates: &[Certificate],
		server_name:   &ServerName,
		scts:          &mut dyn Iterator<Item = &[u8]>,
		ocsp_response: &[u8],
		now:           SystemTime
	) -> std::result::Result<ServerCertVerified, rustls::Error> {
		// the name is only checked after the chain was accepted
		match self.0.verify_server_cert(end_entity, intermediates, server_name, scts, ocsp_response, now) {
			Err(e) if is_name_mismatch(&e) => Ok(ServerCertVerified::assertion()),
			result => result
		}
	}
}

fn is_name_mismatch(error: &rustls::Error) -> bool {
	match error {
		rustls::Error::UnsupportedNameType => true,
		rustls::Error::InvalidCertificateData(message) => message.contains("CertNotValidForName"),
		_ => false
	}
}

#[cfg(test)]
mod tests {
	use {super::*, std::path::PathBuf};

	#[test]
	fn builds_default_config() {
		assert!(client_config(&TlsOptions::default()).is_ok());
		assert!(client_config(&TlsOptions { allow_invalid_certificates: true, ..TlsOptions::default() }).is_ok());
		assert!(client_config(&TlsOptions { allow_invalid_hostnames: true, ..TlsOptions::default() }).is_ok());
	}

	#[test]
	fn ignoring_hostnames_still_checks_the_chain() {
		let verifier = NoHostnameVerifier(WebPkiVerifier::new(RootCertStore::empty(), None));
		let name = ServerName::try_from("db.example.com").unwrap();
		let result = verifier.verify_server_cert(
			&Certificate(vec![0x30, 0x03, 0x02, 0x01, 0x00]),
			&[],
			&name,
			&mut std::iter::empty(),
			&[],
			SystemTime::now()
		);
		assert!(result.is_err());

		assert!(is_name_mismatch(&rustls::Error::InvalidCertificateData(
			"invalid peer certificate: CertNotValidForName".into())));
		assert!(!is_name_mismatch(&rustls::Error::InvalidCertificateData(
			"invalid peer certificate: UnknownIssuer".into())));
		assert!(!is_name_mismatch(&rustls::Error::InvalidCertificateEncoding));
	}

	#[test]
	fn rejects_crl_file() {
		let options = TlsOptions { crl_file: Some(PathBuf::from("crl.pem")), ..TlsOptions::default() };
		assert!(matches!(client_config(&options), Err(Error::InvalidOptions(_))));
	}

	#[test]
	fn reports_missing_files() {
		let options = TlsOptions { ca_file: Some(PathBuf::from("/nonexistent/ca.pem")), ..TlsOptions::default() };
		assert!(matches!(client_config(&options), Err(Error::Tls(_))));
	}

	#[test]
	fn finds_no_key_in_certificate_only_pem() {
		assert_eq!(plain_key(b"").unwrap(), None);
		assert_eq!(decrypt_key(b"", "pw").unwrap(), None);
	}
}

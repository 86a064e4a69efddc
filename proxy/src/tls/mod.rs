//! Certificate loading, key-pair validation, and `rustls::ServerConfig` construction with
//! file-watch based hot reload. `verify_key_pair` is also called synchronously from
//! `config::validate` so a mismatched pair fails config validation, not just TLS startup.

mod reload;

pub use reload::TlsManager;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

use crate::config::TlsRef;

#[derive(Debug, Error)]
pub enum Error {
	#[error("failed to read {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("no certificate found in {0}")]
	NoCertificate(String),
	#[error("no private key found in {0}")]
	NoPrivateKey(String),
	#[error("certificate and key do not form a matching pair: {0}")]
	KeyMismatch(String),
	#[error("tls config error: {0}")]
	Rustls(#[from] rustls::Error),
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
	let file = File::open(path).map_err(|source| Error::Read {
		path: path.display().to_string(),
		source,
	})?;
	let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
		.filter_map(Result::ok)
		.collect();
	if certs.is_empty() {
		return Err(Error::NoCertificate(path.display().to_string()));
	}
	Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
	let file = File::open(path).map_err(|source| Error::Read {
		path: path.display().to_string(),
		source,
	})?;
	rustls_pemfile::private_key(&mut BufReader::new(file))
		.map_err(|source| Error::Read {
			path: path.display().to_string(),
			source,
		})?
		.ok_or_else(|| Error::NoPrivateKey(path.display().to_string()))
}

/// Confirms the certificate and private key form a matching pair (key-pair
/// validation": sign a test payload with the private key, verify with the certificate's public
/// key). Independent of `build_server_config` so it can run during plain config validation,
/// before any socket is bound. `x509-parser` is used only to surface a readable leaf-certificate
/// parse error up front; the match check itself is `rustls::sign::CertifiedKey::keys_match`.
pub fn verify_key_pair(cert_path: &Path, key_path: &Path) -> Result<(), Error> {
	let certs = load_certs(cert_path)?;
	let key = load_key(key_path)?;

	x509_parser::parse_x509_certificate(&certs[0])
		.map_err(|e| Error::KeyMismatch(format!("could not parse leaf certificate: {e}")))?;

	let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
		.map_err(|e| Error::KeyMismatch(e.to_string()))?;
	let certified = rustls::sign::CertifiedKey::new(certs, signing_key);
	certified.keys_match().map_err(|e| {
		Error::KeyMismatch(format!(
			"{} does not match the public key in {}: {e}",
			key_path.display(),
			cert_path.display()
		))
	})
}

pub fn build_server_config(tls: &TlsRef) -> Result<rustls::ServerConfig, Error> {
	let certs = load_certs(&tls.cert)?;
	let key = load_key(&tls.key)?;

	let versions = protocol_versions(&tls.protocols);
	let provider = Arc::new(filtered_provider(tls.ciphers.as_deref()));
	let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
		.with_protocol_versions(versions)
		.map_err(Error::Rustls)?;

	let mut config = if let Some(ca_path) = &tls.client_certificate {
		let roots = load_root_store(ca_path)?;
		let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
			.build()
			.map_err(|e| Error::KeyMismatch(e.to_string()))?;
		builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
	} else {
		builder.with_no_client_auth().with_single_cert(certs, key)?
	};

	if tls.session_tickets {
		if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
			config.ticketer = ticketer;
		}
	}
	if tls.http2 {
		config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	} else {
		config.alpn_protocols = vec![b"http/1.1".to_vec()];
	}
	if tls.dhparam.is_some() {
		tracing::warn!("dhparam is configured but rustls does not support classical DH groups; ignoring");
	}

	Ok(config)
}

/// Restricts the cipher suite list to the colon-joined names in `ciphers`, matched against ring's
/// suite constant names case-insensitively (e.g. `TLS13_AES_256_GCM_SHA384`). Unknown names are
/// logged and skipped; an empty or all-unknown list falls back to the provider's full default set
/// rather than producing a provider with no usable suites.
fn filtered_provider(ciphers: Option<&str>) -> rustls::crypto::CryptoProvider {
	let default = rustls::crypto::ring::default_provider();
	let Some(list) = ciphers else {
		return default;
	};
	let wanted: Vec<&str> = list.split(':').map(str::trim).filter(|s| !s.is_empty()).collect();
	if wanted.is_empty() {
		return default;
	}
	let selected: Vec<_> = default
		.cipher_suites
		.iter()
		.filter(|suite| {
			let name = format!("{:?}", suite.suite());
			wanted.iter().any(|w| w.eq_ignore_ascii_case(&name))
		})
		.cloned()
		.collect();
	if selected.is_empty() {
		tracing::warn!(ciphers = list, "no configured cipher names matched a known suite, using defaults");
		return default;
	}
	rustls::crypto::CryptoProvider {
		cipher_suites: selected,
		..default
	}
}

fn protocol_versions(protocols: &[String]) -> &'static [&'static rustls::SupportedProtocolVersion] {
	let wants_12 = protocols.iter().any(|p| p == "TLSv1.2");
	let wants_13 = protocols.iter().any(|p| p == "TLSv1.3");
	match (wants_12, wants_13, protocols.is_empty()) {
		(true, false, false) => &[&rustls::version::TLS12],
		(false, true, false) => &[&rustls::version::TLS13],
		_ => rustls::ALL_VERSIONS,
	}
}

/// Accepts any server certificate. Used for outbound connections where verification is skipped by
/// policy: health probes and the proxy engine's upstream leg, which must tolerate self-signed
/// internal origins.
#[derive(Debug)]
pub(crate) struct NoVerifier(rustls::crypto::CryptoProvider);

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls::pki_types::CertificateDer<'_>,
		_intermediates: &[rustls::pki_types::CertificateDer<'_>],
		_server_name: &rustls::pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &rustls::pki_types::CertificateDer<'_>,
		dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &rustls::pki_types::CertificateDer<'_>,
		dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		self.0.signature_verification_algorithms.supported_schemes()
	}
}

/// Builds a `ClientConfig` that never verifies the peer certificate, with ALPN restricted to
/// HTTP/1.1 (both call sites only ever speak HTTP/1.1 to the far end).
pub(crate) fn insecure_client_config() -> rustls::ClientConfig {
	let provider = rustls::crypto::ring::default_provider();
	let mut config = rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
		.with_no_client_auth();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	config
}

fn load_root_store(path: &Path) -> Result<rustls::RootCertStore, Error> {
	let file = File::open(path).map_err(|source| Error::Read {
		path: path.display().to_string(),
		source,
	})?;
	let mut store = rustls::RootCertStore::empty();
	for cert in rustls_pemfile::certs(&mut BufReader::new(file)).filter_map(Result::ok) {
		let _ = store.add(cert);
	}
	Ok(store)
}

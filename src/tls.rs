//! TLS material loading for the client-facing server and for peer links.
//!
//! Server configs require and verify client certificates whenever a CA file
//! is given. Peer and client configs trust only the given CA.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{TransportError, TransportResult};

/// Paths to PEM files for one TLS endpoint.
#[derive(Debug, Clone, Default)]
pub struct TlsArgs {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// Name the remote certificate must be issued for (client side only).
    pub server_address: String,
}

pub fn server_config(args: &TlsArgs) -> TransportResult<Arc<ServerConfig>> {
    let (certs, key) = identity(args)?
        .ok_or_else(|| TransportError::Tls("server TLS requires cert and key files".to_string()))?;

    let builder = match &args.ca_file {
        Some(ca) => {
            let roots = Arc::new(load_roots(ca)?);
            let verifier = WebPkiClientVerifier::builder(roots)
                .build()
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

pub fn client_config(args: &TlsArgs) -> TransportResult<Arc<ClientConfig>> {
    let ca = args
        .ca_file
        .as_ref()
        .ok_or_else(|| TransportError::Tls("client TLS requires a CA file".to_string()))?;
    let builder = ClientConfig::builder().with_root_certificates(load_roots(ca)?);

    let config = match identity(args)? {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

pub fn acceptor(args: &TlsArgs) -> TransportResult<TlsAcceptor> {
    Ok(TlsAcceptor::from(server_config(args)?))
}

pub fn connector(args: &TlsArgs) -> TransportResult<TlsConnector> {
    Ok(TlsConnector::from(client_config(args)?))
}

/// Parses the host part of `addr` (or `addr` itself) as a TLS server name.
pub fn server_name(addr: &str) -> TransportResult<ServerName<'static>> {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    };
    ServerName::try_from(host.trim_matches(|c| c == '[' || c == ']').to_string())
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Common name of the first certificate a peer presented.
pub fn peer_common_name(certs: Option<&[CertificateDer<'static>]>) -> Option<String> {
    let cert = certs?.first()?;
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let cn = parsed.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

fn identity(
    args: &TlsArgs,
) -> TransportResult<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    let (Some(cert), Some(key)) = (&args.cert_file, &args.key_file) else {
        return Ok(None);
    };
    Ok(Some((load_certs(cert)?, load_key(key)?)))
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path.display())))
}

fn load_roots(path: &Path) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
    }
    Ok(roots)
}

//! TLS contexts and the sans-io session pump used by `start_tls`.
//!
//! The reactor drives sockets directly, so TLS runs sans-io: raw bytes
//! from the wire are fed into a rustls [`Connection`], plaintext comes
//! out of its reader, and queued records are drained back into the
//! transport's outbound buffer.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::{KairoError, Result};

/// Everything needed to start TLS on one side of a connection.
///
/// Build one with [`TlsContext::client`] /
/// [`TlsContext::client_with_config`] / [`TlsContext::server`] and hand
/// it to the transport's `start_tls`.
#[derive(Clone)]
pub enum TlsContext {
    Client { config: Arc<ClientConfig>, server_name: String },
    Server { config: Arc<ServerConfig> },
}

impl TlsContext {
    /// Client context trusting the bundled webpki roots.
    pub fn client(server_name: impl Into<String>) -> TlsContext {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsContext::Client { config: Arc::new(config), server_name: server_name.into() }
    }

    /// Client context with a caller-provided rustls config, e.g. for
    /// custom roots loaded with [`load_certs_pem`].
    pub fn client_with_config(config: Arc<ClientConfig>, server_name: impl Into<String>) -> TlsContext {
        TlsContext::Client { config, server_name: server_name.into() }
    }

    /// Server context from a certificate chain and private key.
    pub fn server(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<TlsContext> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| KairoError::Other(format!("TLS server config: {}", e)))?;
        Ok(TlsContext::Server { config: Arc::new(config) })
    }

    pub fn server_with_config(config: Arc<ServerConfig>) -> TlsContext {
        TlsContext::Server { config }
    }

    pub(crate) fn into_connection(self) -> Result<Connection> {
        match self {
            TlsContext::Client { config, server_name } => {
                let name = ServerName::try_from(server_name.clone())
                    .map_err(|_| KairoError::Other(format!("invalid TLS server name: {}", server_name)))?;
                let conn = ClientConnection::new(config, name)
                    .map_err(|e| KairoError::Other(format!("TLS client setup: {}", e)))?;
                Ok(Connection::Client(conn))
            }
            TlsContext::Server { config } => {
                let conn = ServerConnection::new(config)
                    .map_err(|e| KairoError::Other(format!("TLS server setup: {}", e)))?;
                Ok(Connection::Server(conn))
            }
        }
    }
}

/// Live TLS state attached to a transport after `start_tls`.
pub(crate) struct TlsSession {
    pub(crate) conn: Connection,
}

impl TlsSession {
    pub(crate) fn new(context: TlsContext) -> Result<TlsSession> {
        Ok(TlsSession { conn: context.into_connection()? })
    }
}

/// Load a PEM certificate chain from disk.
pub fn load_certs_pem(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    certs.map_err(|e| KairoError::Other(format!("failed to read certificates: {}", e)))
}

/// Load the first PEM private key from disk.
pub fn load_private_key_pem(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| KairoError::Other(format!("failed to read private key: {}", e)))?
        .ok_or_else(|| KairoError::Other("no private key found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_context_builds_a_connection() {
        let ctx = TlsContext::client("example.com");
        assert!(ctx.into_connection().is_ok());
    }

    #[test]
    fn bad_server_name_is_rejected() {
        let ctx = TlsContext::client("not a hostname");
        assert!(ctx.into_connection().is_err());
    }
}

//! TLS client connector used when an adapted request's upstream is `wss`/`tls` (§4.8). Root
//! trust comes from the platform store via `rustls-native-certs`, the same source the teacher
//! uses rather than bundling a CA list.

use std::io;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{client::TlsStream, TlsConnector};

/// The native root store only needs loading once per process; every dial after the first
/// reuses it instead of re-reading the platform trust store.
static CLIENT_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();

fn build_client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in loaded.errors {
        tracing::warn!(%err, "skipping unreadable native certificate");
    }
    for cert in loaded.certs {
        if let Err(err) = roots.add(cert) {
            tracing::warn!(%err, "rejecting malformed native certificate");
        }
    }
    let config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Arc::new(config)
}

pub fn client_config() -> Arc<ClientConfig> {
    CLIENT_CONFIG.get_or_init(build_client_config).clone()
}

pub async fn connect(host: &str, port: u16) -> io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect((host, port)).await?;
    let connector = TlsConnector::from(client_config());
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    connector.connect(server_name, tcp).await
}

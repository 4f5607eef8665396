//! A minimal TLS-connecting client, demonstrating the "external collaborator"
//! split spec.md's PURPOSE & SCOPE draws around this crate: TLS handshake and
//! ALPN negotiation happen here, outside the core, which is handed an
//! already-established `h2`-negotiated stream and knows nothing about
//! certificates. Kept from the teacher's `client.rs`, generalized from a
//! single blocking `get` into a `Connection`-returning `connect`.

use crate::config::Config;
use crate::connection::{ClientRequest, ClientResponse, Connection};
use crate::types::HeaderField;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use log::trace;
use rustls::{OwnedTrustAnchor, RootCertStore};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

/// Negotiates TLS + ALPN "h2" over a TCP connection, then drives an HTTP/2
/// [`Connection`] on top of it. One `Client` can open many connections; it
/// owns nothing but the shared `rustls::ClientConfig`.
pub struct Client {
    tls_config: Arc<rustls::ClientConfig>,
}

impl Client {
    /// Connect to `url`'s host:port, completing the TLS handshake (ALPN
    /// "h2") and this crate's own HTTP/2 preface/SETTINGS exchange before
    /// returning. The client entry point described by spec.md's EXTERNAL
    /// INTERFACES section: `:scheme` is defaulted from the transport kind,
    /// here always `https` since cleartext h2c negotiation is out of scope
    /// for this demonstration client.
    pub async fn connect(&self, url: &Url) -> anyhow::Result<Connection> {
        let host = url.host_str().ok_or_else(|| anyhow!("URL has no host"))?;
        let port = url.port_or_known_default().ok_or_else(|| anyhow!("URL has no known port"))?;

        let tcp = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?;
        tcp.set_nodelay(true).context("setting TCP_NODELAY")?;

        let server_name = rustls::ServerName::try_from(host).map_err(|_| anyhow!("invalid DNS name {host}"))?;
        let connector = TlsConnector::from(self.tls_config.clone());
        let tls = connector.connect(server_name, tcp).await.context("TLS handshake")?;

        let negotiated = tls.get_ref().1.alpn_protocol();
        if negotiated != Some(b"h2") {
            return Err(anyhow!("peer did not negotiate HTTP/2 via ALPN"));
        }

        Connection::open_client(tls, Config::client())
            .await
            .map_err(|e| anyhow!("HTTP/2 handshake failed: {e}"))
    }

    /// Convenience one-shot GET, opening a fresh connection per call. A
    /// real caller issuing many requests per origin should reuse the
    /// [`Connection`] returned by [`Client::connect`] instead.
    pub async fn get(&self, url: &Url) -> anyhow::Result<ClientResponse> {
        let connection = self.connect(url).await?;
        let path = if url.path().is_empty() { "/" } else { url.path() };
        let headers = vec![
            HeaderField::new(Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            HeaderField::new(Bytes::from_static(b":scheme"), Bytes::from(url.scheme().to_owned())),
            HeaderField::new(Bytes::from_static(b":authority"), Bytes::from(authority(url)?)),
            HeaderField::new(Bytes::from_static(b":path"), Bytes::from(path.to_owned())),
        ];
        trace!("GET {url} {headers:?}");
        let response = connection
            .request(ClientRequest {
                headers,
                body: None,
                end_stream_after_headers: true,
            })
            .await
            .map_err(|e| anyhow!("request failed: {e}"))?;
        trace!("response headers: {:?}", response.headers);
        Ok(response)
    }
}

fn authority(url: &Url) -> anyhow::Result<String> {
    let host = url.host_str().ok_or_else(|| anyhow!("URL has no host"))?;
    let port = url.port_or_known_default().ok_or_else(|| anyhow!("URL has no known port"))?;
    Ok(format!("{host}:{port}"))
}

impl Default for Client {
    fn default() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
        }));
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            tls_config: Arc::new(config),
        }
    }
}

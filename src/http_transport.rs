use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
#[cfg(test)] use mockall::automock;
use anyhow::bail;
use tracing::trace;

use crate::packet::{ConnectionId, Packet};

/// The client's way of reaching the relay. Each call is one request / response exchange; the
///  service name selects the relay's link (an empty name means the relay's default service).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelTransport: Send + Sync + 'static {
    /// Sends a handshake, returning the relay's answer: the echoed `ConnInit` with the allocated
    ///  connection id, or `ConnRejected`
    async fn connect(&self, service_name: &str, init: Packet) -> anyhow::Result<Vec<Packet>>;

    /// Sends packets for one connection in a single request
    async fn push(&self, service_name: &str, packets: Vec<Packet>) -> anyhow::Result<()>;

    /// Fetches the packets queued for a connection. This may block on the relay's side for up to
    ///  its maximum pull block period.
    async fn pull(&self, service_name: &str, connection_id: ConnectionId) -> anyhow::Result<Vec<Packet>>;
}

/// [TunnelTransport] over HTTP/1, posting frames to the relay's tunnel URL
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    url: String,
}

impl HttpTransport {
    /// `url` is the relay's tunnel endpoint, e.g. `http://relay.example.com:7675/tunnel`
    pub fn new(url: impl Into<String>) -> HttpTransport {
        HttpTransport {
            client: Client::builder(TokioExecutor::new()).build_http(),
            url: url.into(),
        }
    }

    fn uri(&self, request_type: &str, service_name: &str, connection_id: Option<ConnectionId>) -> anyhow::Result<Uri> {
        if service_name.contains(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')) {
            bail!("invalid service name {:?}", service_name);
        }

        let mut uri = format!("{}?Type={}", self.url, request_type);
        if !service_name.is_empty() {
            uri.push_str("&ServerName=");
            uri.push_str(service_name);
        }
        if let Some(id) = connection_id {
            uri.push_str(&format!("&ConnId={}", id));
        }
        Ok(uri.parse()?)
    }

    async fn exchange(&self, uri: Uri, body: Bytes) -> anyhow::Result<Vec<Packet>> {
        trace!("POST {}", uri);
        let mut request = Request::post(uri).body(Full::new(body))?;
        request.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            bail!("relay answered {}: {}", status, String::from_utf8_lossy(&body));
        }
        Ok(Packet::decode_all(body))
    }
}

#[async_trait]
impl TunnelTransport for HttpTransport {
    async fn connect(&self, service_name: &str, init: Packet) -> anyhow::Result<Vec<Packet>> {
        let uri = self.uri("connect", service_name, None)?;
        self.exchange(uri, init.encode()).await
    }

    async fn push(&self, service_name: &str, packets: Vec<Packet>) -> anyhow::Result<()> {
        let uri = self.uri("push", service_name, None)?;
        self.exchange(uri, Packet::encode_all(&packets)).await?;
        Ok(())
    }

    async fn pull(&self, service_name: &str, connection_id: ConnectionId) -> anyhow::Result<Vec<Packet>> {
        let uri = self.uri("pull", service_name, Some(connection_id))?;
        self.exchange(uri, Bytes::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::connect_default("connect", "", None, Some("http://relay:7675/tunnel?Type=connect"))]
    #[case::pull_named("pull", "broker-1", Some(42), Some("http://relay:7675/tunnel?Type=pull&ServerName=broker-1&ConnId=42"))]
    #[case::invalid_name("push", "a&b", None, None)]
    fn test_uri(#[case] request_type: &str, #[case] service: &str, #[case] id: Option<u32>, #[case] expected: Option<&str>) {
        let transport = HttpTransport::new("http://relay:7675/tunnel");
        let uri = transport.uri(request_type, service, id.map(ConnectionId::from_raw));
        assert_eq!(uri.ok().map(|u| u.to_string()), expected.map(str::to_string));
    }
}

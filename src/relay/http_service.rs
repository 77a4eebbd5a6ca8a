//! Maps HTTP requests onto relay operations. The request type and routing information are
//!  query parameters (`?Type=connect|push|pull&ServerName=..&ConnId=..`), request and response
//!  bodies carry concatenated frames.

use std::convert::Infallible;
use std::fmt::{Display, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tracing::{debug, info, trace};

use crate::packet::{ConnectionId, Packet};
use crate::relay::{PulledPackets, Relay};

pub type ResponseBody = BoxBody<Bytes, Infallible>;

const FRAMES_CONTENT_TYPE: &str = "application/octet-stream";

/// The body of a pull response. If it is dropped before its data was handed to the connection,
///  the pulled packets go back into the pull queue.
pub struct PullBody {
    data: Option<Bytes>,
    len: u64,
    pulled: Option<PulledPackets>,
    finished: bool,
}

impl PullBody {
    pub fn new(pulled: PulledPackets) -> PullBody {
        let data = Packet::encode_all(&pulled.packets);
        PullBody {
            len: data.len() as u64,
            data: Some(data),
            pulled: Some(pulled),
            finished: false,
        }
    }
}

impl Body for PullBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        if let Some(data) = self.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        // asked for more after the data was taken, so the data was written
        self.finished = true;
        self.pulled = None;
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.len)
    }
}

impl Drop for PullBody {
    fn drop(&mut self) {
        if let Some(pulled) = self.pulled.take() {
            pulled.requeue();
        }
    }
}

fn parse_query(query: &str) -> FxHashMap<String, String> {
    query.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn frames_response(packets: &[Packet]) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Packet::encode_all(packets)).boxed());
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(FRAMES_CONTENT_TYPE));
    response
}

fn text_response(status: StatusCode, text: String) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(text)).boxed());
    *response.status_mut() = status;
    response
}

async fn read_frames<B>(body: B) -> Result<Vec<Packet>, String>
where B: Body, B::Error: Display
{
    match body.collect().await {
        Ok(collected) => Ok(Packet::decode_all(collected.to_bytes())),
        Err(e) => Err(format!("error reading request body: {}", e)),
    }
}

/// Handles one HTTP request from a client at `remote_address`
pub async fn handle_request<B>(relay: Arc<Relay>, request: Request<B>, remote_address: String) -> Response<ResponseBody>
where B: Body, B::Error: Display
{
    let query = parse_query(request.uri().query().unwrap_or(""));
    let service = query.get("ServerName").map(String::as_str);
    trace!("{} {:?} from {}", request.method(), query, remote_address);

    match query.get("Type").map(String::as_str) {
        Some("connect") => match read_frames(request.into_body()).await {
            Ok(packets) => frames_response(&relay.connect(service, packets, &remote_address).await),
            Err(msg) => text_response(StatusCode::BAD_REQUEST, msg),
        },
        Some("push") => {
            let packets = match read_frames(request.into_body()).await {
                Ok(packets) => packets,
                Err(msg) => return text_response(StatusCode::BAD_REQUEST, msg),
            };
            match relay.push(service, packets).await {
                Ok(()) => frames_response(&[Packet::no_op()]),
                Err(e) => text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            }
        }
        Some("pull") => {
            let Some(id) = query.get("ConnId").and_then(|s| s.parse::<u32>().ok()) else {
                return text_response(StatusCode::BAD_REQUEST, "missing or invalid ConnId".to_string());
            };
            match relay.pull(service, ConnectionId::from_raw(id)).await {
                Ok(pulled) => {
                    let mut response = Response::new(PullBody::new(pulled).boxed());
                    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(FRAMES_CONTENT_TYPE));
                    response
                }
                Err(e) => text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            }
        }
        _ => text_response(StatusCode::OK, status_page(&relay).await),
    }
}

async fn status_page(relay: &Relay) -> String {
    let mut result = String::from("HTTP tunnel relay\n\n");
    let state = relay.debug_state().await;
    if state.is_empty() {
        result.push_str("no linked services\n");
    }
    for (key, value) in state {
        let _ = writeln!(result, "{} = {}", key, value);
    }
    result
}

/// Serves HTTP/1 on `listener` until accepting a connection fails or the relay is shut down
pub async fn serve_http(relay: Arc<Relay>, listener: TcpListener) -> anyhow::Result<()> {
    info!("relay accepting HTTP requests on {:?}", listener.local_addr()?);
    let mut shutdown = relay.shutdown_signal();
    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => return Ok(()),
        };
        let io = TokioIo::new(stream);
        let relay = relay.clone();

        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let relay = relay.clone();
                async move {
                    Ok::<_, Infallible>(handle_request(relay, request, addr.ip().to_string()).await)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("HTTP connection from {} failed: {}", addr, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::packet::{FrameHeader, PacketKind};
    use crate::relay::relay_entry::RelayEntry;
    use crate::seq_no::SeqNo;
    use std::time::Duration;

    fn request(query: &str, body: Bytes) -> Request<Full<Bytes>> {
        Request::post(format!("http://relay/tunnel?{}", query))
            .body(Full::new(body))
            .unwrap()
    }

    async fn body_bytes(response: Response<ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_parse_query() {
        let query = parse_query("Type=pull&ConnId=17&ServerName=broker&junk");
        assert_eq!(query.get("Type").map(String::as_str), Some("pull"));
        assert_eq!(query.get("ConnId").map(String::as_str), Some("17"));
        assert_eq!(query.get("ServerName").map(String::as_str), Some("broker"));
        assert_eq!(query.len(), 3);
    }

    #[tokio::test]
    async fn test_status_page() {
        let relay = Relay::new(TunnelConfig::default()).unwrap();
        let response = handle_request(relay, request("", Bytes::new()), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_bytes(response).await;
        assert!(std::str::from_utf8(&text).unwrap().contains("no linked services"));
    }

    #[tokio::test]
    async fn test_pull_without_connection_id() {
        let relay = Relay::new(TunnelConfig::default()).unwrap();
        let response = handle_request(relay, request("Type=pull", Bytes::new()), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unlinked_service_is_unavailable() {
        let relay = Relay::new(TunnelConfig::default()).unwrap();
        let response = handle_request(relay.clone(), request("Type=pull&ConnId=5&ServerName=broker", Bytes::new()), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = handle_request(relay, request("Type=connect", Packet::no_op().encode()), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let packets = Packet::decode_all(body_bytes(response).await);
        assert_eq!(packets[0].kind, PacketKind::ConnRejected);
    }

    fn pulled_from_entry() -> (Arc<RelayEntry>, PulledPackets) {
        let entry = Arc::new(RelayEntry::new(ConnectionId::from_raw(8), "x".to_string(), None, Duration::from_secs(60), 16));
        for seq in 1..=2 {
            entry.enqueue(Packet::sequenced(PacketKind::Data, entry.id(), SeqNo::from_raw(seq), Bytes::from_static(b"abc")), tokio::time::Instant::now());
        }
        let (packets, _) = entry.take_for_pull(false);
        let pulled = PulledPackets {
            packets,
            entry: Some(entry.clone()),
            _in_use: None,
        };
        (entry, pulled)
    }

    #[tokio::test]
    async fn test_delivered_pull_body_is_not_requeued() {
        let (entry, pulled) = pulled_from_entry();
        let body = PullBody::new(pulled);
        assert_eq!(body.size_hint().exact(), Some(2 * (FrameHeader::SERIALIZED_LEN as u64 + 3)));

        let data = body.collect().await.unwrap().to_bytes();
        assert_eq!(Packet::decode_all(data).len(), 2);
        assert_eq!(entry.queue_len(), 0);
    }

    #[test]
    fn test_dropped_pull_body_is_requeued() {
        let (entry, pulled) = pulled_from_entry();
        assert_eq!(entry.queue_len(), 0);
        drop(PullBody::new(pulled));
        assert_eq!(entry.queue_len(), 2);
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use httptunnel::client_driver::ClientDriver;
use httptunnel::config::TunnelConfig;
use httptunnel::error::TunnelError;
use httptunnel::http_transport::{HttpTransport, TunnelTransport};
use httptunnel::relay::http_service::serve_http;
use httptunnel::relay::Relay;
use httptunnel::server_driver::ServerDriver;
use httptunnel::test_util::in_process::{InProcessTransport, LossyTransport};
use httptunnel::tunnel_handle::TunnelHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const SERVICE: &str = "broker";

/// timings scaled down so that loss recovery and reconnects happen within a test run
fn fast_config() -> TunnelConfig {
    let mut config = TunnelConfig::default();
    config.sweep_interval = Duration::from_millis(10);
    config.retransmit.min_timeout = Duration::from_millis(50);
    config.retransmit.initial_timeout = Duration::from_millis(200);
    config.retransmit.max_timeout = Duration::from_millis(1_000);
    config.link.retry_interval = Duration::from_millis(50);
    config.poll.poll_error_backoff = Duration::from_millis(50);
    config.poll.connect_timeout = Duration::from_secs(10);
    config.relay.max_pull_block = Duration::from_secs(1);
    config
}

async fn start_relay(config: TunnelConfig, link_addr: &str) -> (Arc<Relay>, SocketAddr, JoinHandle<anyhow::Result<()>>) {
    let relay = Relay::new(config).unwrap();
    let listener = TcpListener::bind(link_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_task = tokio::spawn(relay.clone().accept_links(listener));
    tokio::spawn(relay.clone().timeout_loop());
    (relay, addr, accept_task)
}

async fn start_driver(config: TunnelConfig, link_addr: SocketAddr) -> Arc<ServerDriver> {
    let driver = ServerDriver::new(config, SERVICE).unwrap();
    tokio::spawn(driver.clone().run_link(link_addr.to_string()));
    tokio::spawn(driver.clone().sweep_loop());
    driver
}

async fn wait_until_linked(relay: &Relay) {
    loop {
        if let Some(service) = relay.service(SERVICE).await {
            if service.is_up() && service.is_listening() {
                return;
            }
        }
        time::sleep(Duration::from_millis(10)).await;
    }
}

fn start_client(config: TunnelConfig, transport: Arc<dyn TunnelTransport>) -> Arc<ClientDriver> {
    let client = ClientDriver::new(config, transport).unwrap();
    tokio::spawn(client.clone().sweep_loop());
    client
}

async fn read_exactly(handle: &TunnelHandle, len: usize) -> Vec<u8> {
    let mut result = Vec::new();
    while result.len() < len {
        let data = handle.read(len - result.len()).await.unwrap().expect("unexpected end of stream");
        result.extend_from_slice(&data);
    }
    result
}

async fn read_to_end(handle: &TunnelHandle) -> Vec<u8> {
    let mut result = Vec::new();
    while let Some(data) = handle.read(4096).await.unwrap() {
        result.extend_from_slice(&data);
    }
    result
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lossy_transport_delivers_exactly_once_in_order() {
    timeout(Duration::from_secs(60), async {
        let (relay, link_addr, _) = start_relay(fast_config(), "127.0.0.1:0").await;
        let driver = start_driver(fast_config(), link_addr).await;
        wait_until_linked(&relay).await;

        let transport = LossyTransport::new(InProcessTransport::new(relay.clone()), 0.2, 0.2, 0.2);
        let mut config = fast_config();
        config.max_payload_len = 500;
        let client = start_client(config, Arc::new(transport));

        // each direction ends with a close, so duplicated packets would show up as extra data
        let upstream = test_data(40_000);
        let client_handle = client.open(SERVICE).await.unwrap();
        let server_handle = driver.accept().await.unwrap();
        let writer = {
            let upstream = upstream.clone();
            tokio::spawn(async move {
                client_handle.write(&upstream).await?;
                client_handle.close().await
            })
        };
        assert!(read_to_end(&server_handle).await == upstream, "data arrived corrupted, duplicated or out of order");
        writer.await.unwrap().unwrap();

        let downstream = test_data(30_000).into_iter().rev().collect::<Vec<_>>();
        let client_handle = client.open(SERVICE).await.unwrap();
        let server_handle = driver.accept().await.unwrap();
        server_handle.write(&downstream).await.unwrap();
        server_handle.close().await.unwrap();
        assert!(read_to_end(&client_handle).await == downstream, "data arrived corrupted, duplicated or out of order");
    }).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connections_survive_relay_restart() {
    timeout(Duration::from_secs(30), async {
        let (relay, link_addr, accept_task) = start_relay(fast_config(), "127.0.0.1:0").await;
        let driver = start_driver(fast_config(), link_addr).await;
        wait_until_linked(&relay).await;

        let transport = Arc::new(InProcessTransport::new(relay.clone()));
        let client = start_client(fast_config(), transport.clone());
        let client_handle = client.open(SERVICE).await.unwrap();
        let server_handle = driver.accept().await.unwrap();

        client_handle.write(b"before").await.unwrap();
        assert_eq!(read_exactly(&server_handle, 6).await, b"before");

        relay.shutdown();
        accept_task.await.unwrap().unwrap();
        let (new_relay, _, _) = start_relay(fast_config(), &link_addr.to_string()).await;
        transport.replace_relay(new_relay.clone());

        // written while the driver is not linked: retransmission or link init replay delivers it
        server_handle.write(b"after").await.unwrap();
        wait_until_linked(&new_relay).await;
        assert_eq!(new_relay.service(SERVICE).await.unwrap().num_connections().await, 1);

        assert_eq!(read_exactly(&client_handle, 5).await, b"after");
        client_handle.write(b"again").await.unwrap();
        assert_eq!(read_exactly(&server_handle, 5).await, b"again");
    }).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_accept_backlog_rejects_handshake() {
    timeout(Duration::from_secs(30), async {
        let mut server_config = fast_config();
        server_config.accept_backlog = 1;
        let (relay, link_addr, _) = start_relay(fast_config(), "127.0.0.1:0").await;
        let _driver = start_driver(server_config, link_addr).await;
        wait_until_linked(&relay).await;

        let client = start_client(fast_config(), Arc::new(InProcessTransport::new(relay.clone())));
        let _first = client.open(SERVICE).await.unwrap();
        assert_eq!(client.open(SERVICE).await.unwrap_err(), TunnelError::ConnectRejected("accept backlog full".to_string()));
    }).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_not_listening_rejects_handshake() {
    timeout(Duration::from_secs(30), async {
        let (relay, link_addr, _) = start_relay(fast_config(), "127.0.0.1:0").await;
        let driver = start_driver(fast_config(), link_addr).await;
        wait_until_linked(&relay).await;

        driver.set_listening(false);
        while relay.service(SERVICE).await.unwrap().is_listening() {
            time::sleep(Duration::from_millis(10)).await;
        }

        let client = start_client(fast_config(), Arc::new(InProcessTransport::new(relay.clone())));
        assert!(matches!(client.open(SERVICE).await, Err(TunnelError::ConnectRejected(_))));
    }).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_over_http() {
    timeout(Duration::from_secs(30), async {
        let (relay, link_addr, _) = start_relay(fast_config(), "127.0.0.1:0").await;
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http_listener.local_addr().unwrap();
        tokio::spawn(serve_http(relay.clone(), http_listener));

        let driver = start_driver(fast_config(), link_addr).await;
        wait_until_linked(&relay).await;

        let transport = HttpTransport::new(format!("http://{}/tunnel", http_addr));
        let client = start_client(fast_config(), Arc::new(transport));

        // the default service: only one is linked
        let client_handle = client.open("").await.unwrap();
        assert_eq!(client_handle.peer_address(), SERVICE);
        let server_handle = driver.accept().await.unwrap();
        assert_eq!(server_handle.connection_id(), client_handle.connection_id());

        client_handle.write(b"ping").await.unwrap();
        assert_eq!(read_exactly(&server_handle, 4).await, b"ping");
        server_handle.write(b"pong").await.unwrap();
        assert_eq!(read_exactly(&client_handle, 4).await, b"pong");

        client_handle.close().await.unwrap();
        assert_eq!(server_handle.read(10).await.unwrap(), None);

        relay.shutdown();
    }).await.unwrap();
}

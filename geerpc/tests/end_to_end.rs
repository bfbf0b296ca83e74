//! Client/server scenarios over real sockets.

use geerpc::{
    balanced::BalancedClient,
    codec::CodecKind,
    discovery::{Discovery, RegistryDiscovery, SelectMode, StaticDiscovery},
    registry::{start_heartbeat, Registry, DEFAULT_REGISTRY_PATH},
    Client, Error, MethodError, Options, Server, Service,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TwoInts {
    a: i32,
    b: i32,
}

fn arith_service() -> Service {
    Service::new("Arith")
        .method("Sum", |args: TwoInts| async move { Ok(args.a + args.b) })
        .method("Sleep", |millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(millis)
        })
        .method("Fail", |_: ()| async move {
            Err::<i32, MethodError>("boom".into())
        })
}

async fn start_server(service: Service) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Server::new();
    server.register(service);
    tokio::spawn(server.serve(listener));
    addr
}

async fn start_http_server(service: Service) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Server::new();
    server.register(service);
    tokio::spawn(server.serve_http(listener));
    addr
}

#[tokio::test]
async fn test_call_over_tcp() {
    let addr = start_server(arith_service()).await;
    let client = Client::dial(&addr, &Options::default()).await.unwrap();

    let sum: i32 = client
        .call("Arith.Sum", &TwoInts { a: 3, b: 4 })
        .await
        .unwrap();
    assert_eq!(sum, 7);
}

#[tokio::test]
async fn test_call_with_json_codec() {
    let addr = start_server(arith_service()).await;
    let options = Options {
        codec_type: CodecKind::Json,
        ..Options::default()
    };
    let client = Client::dial(&addr, &options).await.unwrap();

    let sum: i32 = client
        .call("Arith.Sum", &TwoInts { a: 10, b: -3 })
        .await
        .unwrap();
    assert_eq!(sum, 7);
}

#[tokio::test]
async fn test_concurrent_calls_multiplex_one_connection() {
    let addr = start_server(arith_service()).await;
    let client = Arc::new(Client::dial(&addr, &Options::default()).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..32i32 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let sum: i32 = client
                .call("Arith.Sum", &TwoInts { a: i, b: i * 10 })
                .await
                .unwrap();
            (i, sum)
        }));
    }
    for handle in handles {
        let (i, sum) = handle.await.unwrap();
        assert_eq!(sum, i + i * 10);
    }
}

#[tokio::test]
async fn test_unknown_service_and_method() {
    let addr = start_server(arith_service()).await;
    let client = Client::dial(&addr, &Options::default()).await.unwrap();

    let err = client
        .call::<_, i32>("Nope.Sum", &TwoInts { a: 1, b: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("doesn't exist"), "got: {err}");

    let err = client
        .call::<_, i32>("Arith.Nope", &TwoInts { a: 1, b: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("doesn't exist"), "got: {err}");

    // Connection is still healthy afterwards.
    let sum: i32 = client
        .call("Arith.Sum", &TwoInts { a: 1, b: 2 })
        .await
        .unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn test_method_error_reaches_caller() {
    let addr = start_server(arith_service()).await;
    let client = Client::dial(&addr, &Options::default()).await.unwrap();

    let err = client.call::<_, i32>("Arith.Fail", &()).await.unwrap_err();
    assert!(matches!(&err, Error::Remote(message) if message == "boom"));
}

#[tokio::test]
async fn test_server_handle_timeout() {
    let addr = start_server(arith_service()).await;
    let options = Options {
        handle_timeout: Duration::from_secs(1),
        ..Options::default()
    };
    let client = Client::dial(&addr, &options).await.unwrap();

    let started = std::time::Instant::now();
    let err = client
        .call::<_, u64>("Arith.Sleep", &2_000u64)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timeout"), "got: {err}");
    assert!(started.elapsed() < Duration::from_millis(1_800));

    // Later calls on the same connection still work.
    let sum: i32 = client
        .call("Arith.Sum", &TwoInts { a: 2, b: 2 })
        .await
        .unwrap();
    assert_eq!(sum, 4);
}

#[tokio::test]
async fn test_client_call_timeout_leaves_connection_usable() {
    let addr = start_server(arith_service()).await;
    let client = Client::dial(&addr, &Options::default()).await.unwrap();

    let err = client
        .call_with_timeout::<_, u64>("Arith.Sleep", &500u64, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CallTimeout { .. }));

    let sum: i32 = client
        .call("Arith.Sum", &TwoInts { a: 5, b: 6 })
        .await
        .unwrap();
    assert_eq!(sum, 11);

    // Wait out the slept call so its stale response gets discarded, then
    // verify the connection is still fine.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let sum: i32 = client
        .call("Arith.Sum", &TwoInts { a: 7, b: 8 })
        .await
        .unwrap();
    assert_eq!(sum, 15);
}

#[tokio::test]
async fn test_close_rejects_further_calls() {
    let addr = start_server(arith_service()).await;
    let client = Client::dial(&addr, &Options::default()).await.unwrap();
    assert!(client.is_alive());

    client.close().await.unwrap();
    assert!(!client.is_alive());
    assert!(matches!(client.close().await, Err(Error::Shutdown)));
    assert!(matches!(
        client.call::<_, i32>("Arith.Sum", &TwoInts { a: 1, b: 1 }).await,
        Err(Error::Shutdown)
    ));
}

#[tokio::test]
async fn test_call_through_http_tunnel() {
    let addr = start_http_server(arith_service()).await;
    let client = Client::dial_addr(&format!("http@{addr}"), &Options::default())
        .await
        .unwrap();

    let sum: i32 = client
        .call("Arith.Sum", &TwoInts { a: 20, b: 22 })
        .await
        .unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn test_tunnel_rejects_non_connect() {
    let addr = start_http_server(arith_service()).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET /_geerpc HTTP/1.0\n\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.contains("405"), "got: {response}");
    assert!(response.contains("CONNECT"), "got: {response}");
}

#[tokio::test]
async fn test_dial_addr_validates_scheme() {
    assert!(matches!(
        Client::dial_addr("badformat", &Options::default()).await,
        Err(Error::InvalidAddress { .. })
    ));
    assert!(matches!(
        Client::dial_addr("udp@127.0.0.1:1", &Options::default()).await,
        Err(Error::UnsupportedProtocol { .. })
    ));
}

#[tokio::test]
async fn test_registry_liveness_over_http() {
    let registry = Registry::new(Duration::from_millis(300));
    let (addr, server) = registry.bind("127.0.0.1:0".parse().unwrap());
    tokio::spawn(server);
    let url = format!("http://{addr}{DEFAULT_REGISTRY_PATH}");

    start_heartbeat(url.clone(), "tcp@a:1", None).await.unwrap();

    let fetch = |url: String| async move {
        let response = hyper::Client::new().get(url.parse().unwrap()).await.unwrap();
        response
            .headers()
            .get("X-Geerpc-Server")
            .map(|value| value.to_str().unwrap().to_string())
            .unwrap_or_default()
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetch(url.clone()).await, "tcp@a:1");

    // No further heartbeat lands before expiry (the default period is
    // minutes), so 400ms after the POST the entry is gone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetch(url).await, "");
}

#[tokio::test]
async fn test_balanced_call_round_robin() {
    let addr_a = start_server(arith_service()).await;
    let addr_b = start_server(arith_service()).await;
    let discovery = Arc::new(StaticDiscovery::new(vec![
        format!("tcp@{addr_a}"),
        format!("tcp@{addr_b}"),
    ]));
    let client = BalancedClient::new(discovery, SelectMode::RoundRobin, Options::default());

    for i in 0..4 {
        let sum: i32 = client
            .call("Arith.Sum", &TwoInts { a: i, b: 1 })
            .await
            .unwrap();
        assert_eq!(sum, i + 1);
    }
    client.close().await;
}

#[tokio::test]
async fn test_broadcast_all_success() {
    let addr_a = start_server(arith_service()).await;
    let addr_b = start_server(arith_service()).await;
    let discovery = Arc::new(StaticDiscovery::new(vec![
        format!("tcp@{addr_a}"),
        format!("tcp@{addr_b}"),
    ]));
    let client = BalancedClient::new(discovery, SelectMode::Random, Options::default());

    let reply: Option<i32> = client
        .broadcast("Arith.Sum", &TwoInts { a: 1, b: 2 })
        .await
        .unwrap();
    assert_eq!(reply, Some(3));
}

#[tokio::test]
async fn test_broadcast_with_one_failure() {
    let failing = Service::new("Arith").method("Sum", |_: TwoInts| async move {
        Err::<i32, MethodError>("boom".into())
    });

    let addr_a = start_server(arith_service()).await;
    let addr_b = start_server(arith_service()).await;
    let addr_c = start_server(failing).await;
    let discovery = Arc::new(StaticDiscovery::new(vec![
        format!("tcp@{addr_a}"),
        format!("tcp@{addr_b}"),
        format!("tcp@{addr_c}"),
    ]));
    let client = BalancedClient::new(discovery, SelectMode::Random, Options::default());

    let err = client
        .broadcast::<_, i32>("Arith.Sum", &TwoInts { a: 1, b: 2 })
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::Remote(message) if message == "boom")
            || matches!(err, Error::Cancelled),
        "got: {err}"
    );
}

#[tokio::test]
async fn test_registry_backed_discovery_and_calls() {
    let registry = Registry::new(Duration::from_secs(5));
    let (registry_addr, server) = registry.bind("127.0.0.1:0".parse().unwrap());
    tokio::spawn(server);
    let registry_url = format!("http://{registry_addr}{DEFAULT_REGISTRY_PATH}");

    let addr_a = start_server(arith_service()).await;
    let addr_b = start_server(arith_service()).await;
    for addr in [&addr_a, &addr_b] {
        start_heartbeat(
            registry_url.clone(),
            format!("tcp@{addr}"),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    }

    let discovery = RegistryDiscovery::new(registry_url, Some(Duration::from_millis(50)));
    let mut all = discovery.get_all().await.unwrap();
    all.sort();
    let mut expected = vec![format!("tcp@{addr_a}"), format!("tcp@{addr_b}")];
    expected.sort();
    assert_eq!(all, expected);

    let client = BalancedClient::new(
        Arc::new(discovery),
        SelectMode::RoundRobin,
        Options::default(),
    );
    for _ in 0..3 {
        let sum: i32 = client
            .call("Arith.Sum", &TwoInts { a: 40, b: 2 })
            .await
            .unwrap();
        assert_eq!(sum, 42);
    }
}

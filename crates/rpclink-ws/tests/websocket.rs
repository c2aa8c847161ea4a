use rpclink::{Client, ConnectionState, EndpointOptions, Server, Service, Value};
use rpclink_ws::{serve, WebSocketConnector};
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn calls_cross_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("ws://{}", listener.local_addr().unwrap());

    let server = Server::new("server", address.clone(), EndpointOptions::default());
    let service = Service::new().method("add", |args| async move {
        Ok(Value::Integer(Value::int_arg(&args, 0)? + Value::int_arg(&args, 1)?))
    });
    server.publish("service", service.into_value()).unwrap();
    server.open(1, Duration::from_secs(1)).await.unwrap();
    tokio::spawn(serve(listener, server.clone()));

    let client = Client::new("client", address, WebSocketConnector, EndpointOptions::default());
    client.open(3, Duration::from_millis(100)).await.unwrap();
    let sum = client
        .protocol()
        .unwrap()
        .get("service")
        .await
        .unwrap()
        .into_proxy()
        .unwrap()
        .invoke("add", vec![Value::from(2), Value::from(3)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Integer(5));

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    server.close().await;
}

#[tokio::test]
async fn upgrades_outside_the_rpc_path_are_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("ws://{}", listener.local_addr().unwrap());
    let server = Server::new("server", address.clone(), EndpointOptions::default());
    server.open(1, Duration::from_secs(1)).await.unwrap();
    tokio::spawn(serve(listener, server.clone()));

    let err = tokio_tungstenite::connect_async(format!("{address}/chat"))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected an http rejection, got {other:?}"),
    }

    let (socket, _) = tokio_tungstenite::connect_async(format!("{address}/rpc/"))
        .await
        .unwrap();
    drop(socket);
    server.close().await;
}

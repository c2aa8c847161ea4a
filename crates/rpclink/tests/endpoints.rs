use rpclink::transport::memory::{network, MemoryConnector};
use rpclink::{
    generate_id, AuthError, Client, CloseCode, ConnectionState, EndpointEvent, EndpointOptions,
    Error, Function, Link, RpcError, Server, Service, TransportEvent, Value,
};
use rpclink_core::{make_signature, Action, AuthorizationData, Message, MessageKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

struct Net {
    server: Server,
    connector: MemoryConnector,
    _serve: JoinHandle<()>,
}

fn calculator() -> Value {
    Service::new()
        .method("add", |args| async move {
            Ok(Value::Integer(Value::int_arg(&args, 0)? + Value::int_arg(&args, 1)?))
        })
        .method("apply", |args| async move {
            let callback = args
                .into_iter()
                .next()
                .and_then(Value::into_proxy)
                .ok_or_else(|| RpcError::new("callback expected"))?;
            let result = callback.call(vec![Value::from(20)]).await?;
            Ok(Value::from(result.as_i64().unwrap_or_default() + 1))
        })
        .into_value()
}

async fn start(options: EndpointOptions) -> Net {
    let (connector, listener) = network();
    let server = Server::new("server", "memory://server", options);
    server.publish("service", calculator()).unwrap();
    server.publish("version", "1.0").unwrap();
    server.open(1, Duration::from_secs(1)).await.unwrap();
    let serve = listener.serve(server.clone());
    Net {
        server,
        connector,
        _serve: serve,
    }
}

async fn connect(net: &Net, options: EndpointOptions) -> Client {
    let client = Client::new("client", "memory://server", net.connector.clone(), options);
    client.open(1, Duration::from_secs(1)).await.unwrap();
    client
}

async fn next_event(
    events: &mut broadcast::Receiver<EndpointEvent>,
    wanted: impl Fn(&EndpointEvent) -> bool,
) -> EndpointEvent {
    loop {
        match events.recv().await {
            Ok(event) if wanted(&event) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("endpoint dropped"),
        }
    }
}

fn is_closed(event: &EndpointEvent) -> bool {
    matches!(event, EndpointEvent::Closed(_))
}

/// Answer one handshake on `link` with `reply`.
async fn answer_handshake(link: &mut Link, reply: AuthorizationData) {
    match link.events.recv().await {
        Some(TransportEvent::Recv(frame)) => {
            let request = Message::from_json(frame).unwrap();
            assert_eq!(request.action, Action::Authorization);
        }
        other => panic!("expected a handshake, got {other:?}"),
    }
    link.transport
        .send(&Message::with_data(Action::Authorization, &reply).unwrap())
        .await
        .unwrap();
}

fn server_reply() -> AuthorizationData {
    AuthorizationData {
        kind: MessageKind::Response,
        name: "server".into(),
        signature: make_signature("server"),
        session_id: Some(generate_id()),
        ..AuthorizationData::default()
    }
}

#[tokio::test]
async fn client_calls_a_published_service() {
    let net = start(EndpointOptions::default()).await;
    let client = connect(&net, EndpointOptions::default()).await;
    assert_eq!(client.state(), ConnectionState::Connected);

    let service = client
        .protocol()
        .unwrap()
        .get("service")
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    let sum = service
        .invoke("add", vec![Value::from(2), Value::from(3)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Integer(5));
    assert_eq!(
        net.server.session("client").unwrap().id(),
        client.session().unwrap().id()
    );
}

#[tokio::test]
async fn server_calls_back_into_the_client() {
    let net = start(EndpointOptions::default()).await;
    let client = connect(&net, EndpointOptions::default()).await;
    let service = client
        .protocol()
        .unwrap()
        .get("service")
        .await
        .unwrap()
        .into_proxy()
        .unwrap();

    let double = Function::new(|args| async move { Ok(Value::from(Value::int_arg(&args, 0)? * 2)) })
        .into_value();
    let result = service.invoke("apply", vec![double]).await.unwrap();
    assert_eq!(result, Value::Integer(41));
}

#[tokio::test]
async fn dropped_proxies_are_released_on_the_server() {
    let net = start(EndpointOptions::default()).await;
    let client = connect(&net, EndpointOptions::default()).await;
    let protocol = client.protocol().unwrap();
    let on_server = net.server.protocol("client").unwrap();

    let first = protocol.get("service").await.unwrap().into_proxy().unwrap();
    let second = protocol.get("service").await.unwrap().into_proxy().unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(on_server.reference_count(), 1);

    drop(first);
    drop(second);
    assert_eq!(protocol.get("version").await.unwrap(), Value::from("1.0"));
    assert_eq!(on_server.reference_count(), 0);
}

#[tokio::test]
async fn wrong_signature_is_rejected() {
    let net = start(EndpointOptions::default()).await;
    let mut events = net.server.subscribe();
    let mut link = rpclink::Connector::connect(&net.connector, "memory://server")
        .await
        .unwrap();

    let request = AuthorizationData {
        signature: "forged".into(),
        ..AuthorizationData::request("mallory", None)
    };
    link.transport
        .send(&Message::with_data(Action::Authorization, &request).unwrap())
        .await
        .unwrap();

    let Some(TransportEvent::Recv(frame)) = link.events.recv().await else {
        panic!("expected a handshake reply");
    };
    let reply: AuthorizationData = Message::from_json(frame).unwrap().data_as().unwrap();
    assert_eq!(reply.kind, MessageKind::Response);
    assert_eq!(reply.error.as_deref(), Some("signature is not correct"));
    assert!(reply.session_id.is_none());
    assert!(matches!(
        link.events.recv().await,
        Some(TransportEvent::Disconnect(_))
    ));

    assert_eq!(
        next_event(&mut events, |event| matches!(event, EndpointEvent::Error(_))).await,
        EndpointEvent::Error("signature is not correct".into())
    );
    assert!(net.server.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn denied_client_gives_up_at_once() {
    let (connector, mut listener) = network();
    let client = Client::new("client", "memory://server", connector, EndpointOptions::default());
    let mut events = client.subscribe();
    let peer = tokio::spawn(async move {
        let mut link = listener.accept().await.unwrap();
        let reply = AuthorizationData {
            error: Some("go away".into()),
            session_id: None,
            ..server_reply()
        };
        answer_handshake(&mut link, reply).await;
        listener
    });

    let err = client.open(5, Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(&err, Error::Auth(AuthError::Denied(message)) if message == "go away"));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        next_event(&mut events, |event| matches!(event, EndpointEvent::Error(_))).await,
        EndpointEvent::Error("go away".into())
    );

    // no second attempt was made
    let mut listener = peer.await.unwrap();
    assert!(timeout(Duration::from_secs(10), listener.accept()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn calls_survive_a_reconnect() {
    let net = start(EndpointOptions::default()).await;
    let client = connect(&net, EndpointOptions::default()).await;
    let mut events = client.subscribe();
    let session_id = client.session().unwrap().id().to_string();
    let service = client
        .protocol()
        .unwrap()
        .get("service")
        .await
        .unwrap()
        .into_proxy()
        .unwrap();

    let transport = net.server.session("client").unwrap().transport().unwrap();
    transport.disconnect(Some("network blip")).await.unwrap();
    let sum = service
        .invoke("add", vec![Value::from(20), Value::from(22)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Integer(42));

    assert_eq!(
        next_event(&mut events, |event| matches!(event, EndpointEvent::SessionDisconnected { .. })).await,
        EndpointEvent::SessionDisconnected {
            name: "server".into(),
            reason: Some("network blip".into()),
        }
    );
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.session().unwrap().id(), session_id);
    assert_eq!(net.server.session("client").unwrap().id(), session_id);
}

#[tokio::test(start_paused = true)]
async fn call_made_while_disconnected_runs_once() {
    let net = start(EndpointOptions::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let tally = calls.clone();
    net.server
        .publish(
            "tally",
            Function::new(move |_| {
                let tally = tally.clone();
                async move { Ok(Value::from(tally.fetch_add(1, Ordering::SeqCst) as i64 + 1)) }
            })
            .into_value(),
        )
        .unwrap();
    let client = connect(&net, EndpointOptions::default()).await;
    let mut events = client.subscribe();
    let protocol = client.protocol().unwrap();

    let transport = net.server.session("client").unwrap().transport().unwrap();
    transport.disconnect(Some("network blip")).await.unwrap();
    next_event(&mut events, |event| matches!(event, EndpointEvent::SessionDisconnected { .. })).await;
    let first = protocol.call("tally", vec![]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(first.await.unwrap(), Value::Integer(1));
    assert_eq!(protocol.call("tally", vec![]).await.unwrap(), Value::Integer(2));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_exhaustion_closes_with_timeout() {
    let net = start(EndpointOptions::default()).await;
    let options =
        EndpointOptions::default().with_reconnect(Duration::from_secs(6), Duration::from_secs(3));
    let client = connect(&net, options).await;
    let mut events = client.subscribe();

    net.connector.set_offline(true);
    let transport = net.server.session("client").unwrap().transport().unwrap();
    transport.disconnect(Some("network down")).await.unwrap();

    assert_eq!(
        next_event(&mut events, is_closed).await,
        EndpointEvent::Closed(CloseCode::Timeout)
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn silent_server_is_dropped_by_keepalive() {
    let (connector, mut listener) = network();
    let client = Client::new(
        "client",
        "memory://server",
        connector,
        EndpointOptions::default().without_reconnect(),
    );
    let mut events = client.subscribe();
    let _peer = tokio::spawn(async move {
        let mut link = listener.accept().await.unwrap();
        answer_handshake(&mut link, server_reply()).await;
        while link.events.recv().await.is_some() {}
        listener
    });

    client.open(1, Duration::from_secs(1)).await.unwrap();
    let started = Instant::now();
    assert_eq!(
        next_event(&mut events, |event| matches!(event, EndpointEvent::SessionDisconnected { .. })).await,
        EndpointEvent::SessionDisconnected {
            name: "server".into(),
            reason: Some("keepalive timeout".into()),
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(
        next_event(&mut events, is_closed).await,
        EndpointEvent::Closed(CloseCode::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn second_login_kicks_out_the_first() {
    let net = start(EndpointOptions::default()).await;
    let first = connect(&net, EndpointOptions::default()).await;
    let mut first_events = first.subscribe();
    let second = connect(&net, EndpointOptions::default()).await;

    assert_eq!(
        next_event(&mut first_events, |event| matches!(event, EndpointEvent::SessionDisconnected { .. })).await,
        EndpointEvent::SessionDisconnected {
            name: "server".into(),
            reason: Some("session client kicked out".into()),
        }
    );
    // the old session cannot be resumed any more
    assert_eq!(
        next_event(&mut first_events, is_closed).await,
        EndpointEvent::Closed(CloseCode::Unauthorized)
    );
    assert_eq!(first.state(), ConnectionState::Disconnected);
    assert_eq!(second.state(), ConnectionState::Connected);
    assert_eq!(
        net.server.session("client").unwrap().id(),
        second.session().unwrap().id()
    );
}

#[tokio::test]
async fn duplicate_login_is_refused_without_kick_out() {
    let net = start(EndpointOptions::default().with_kick_out(false)).await;
    let first = connect(&net, EndpointOptions::default()).await;
    let mut server_events = net.server.subscribe();
    let second = Client::new(
        "client",
        "memory://server",
        net.connector.clone(),
        EndpointOptions::default().without_reconnect(),
    );
    second.open(1, Duration::from_secs(1)).await.unwrap();

    assert_eq!(
        next_event(&mut server_events, |event| matches!(event, EndpointEvent::Error(_))).await,
        EndpointEvent::Error("session client was exists".into())
    );
    assert_eq!(
        net.server.session("client").unwrap().id(),
        first.session().unwrap().id()
    );
}

#[tokio::test]
async fn closing_the_client_waves_goodbye() {
    let net = start(EndpointOptions::default()).await;
    let mut server_events = net.server.subscribe();
    let client = connect(&net, EndpointOptions::default()).await;
    let mut events = client.subscribe();

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        next_event(&mut events, is_closed).await,
        EndpointEvent::Closed(CloseCode::Normal)
    );
    assert_eq!(
        next_event(&mut server_events, |event| matches!(event, EndpointEvent::SessionDisconnected { .. })).await,
        EndpointEvent::SessionDisconnected {
            name: "client".into(),
            reason: Some("receive wave and disconnect".into()),
        }
    );
    assert!(net.server.session("client").is_none());

    // a second close is a no-op
    client.close().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn closing_the_server_disconnects_clients() {
    let net = start(EndpointOptions::default()).await;
    let mut server_events = net.server.subscribe();
    let client = connect(&net, EndpointOptions::default().without_reconnect()).await;
    let mut events = client.subscribe();

    net.server.close().await;
    assert_eq!(net.server.state(), ConnectionState::Disconnected);
    assert!(net.server.sessions().is_empty());
    assert_eq!(
        next_event(&mut server_events, is_closed).await,
        EndpointEvent::Closed(CloseCode::Normal)
    );
    assert_eq!(
        next_event(&mut events, |event| matches!(event, EndpointEvent::SessionDisconnected { .. })).await,
        EndpointEvent::SessionDisconnected {
            name: "server".into(),
            reason: Some("server [server] was closed".into()),
        }
    );
    assert_eq!(
        next_event(&mut events, is_closed).await,
        EndpointEvent::Closed(CloseCode::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_sessions_are_swept() {
    let options =
        EndpointOptions::default().with_reconnect(Duration::from_secs(1), Duration::from_millis(500));
    let net = start(options).await;
    let _client = connect(&net, EndpointOptions::default().without_reconnect()).await;

    let session = net.server.session("client").unwrap();
    session.transport().unwrap().disconnect(None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(net.server.session("client").is_some());
    assert!(session.disconnect_time().is_some());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(net.server.session("client").is_none());
    assert!(session.is_destroyed());
}

//! Connection handlers for Ferrobus server.
//!
//! This module handles the connection lifecycle: handshake, admission,
//! the read/route loop with its writer task, and teardown.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json};
use bus_protocol::{AuthStatus, Message, MessageCodec, ProtocolError, ServerAuth};
use bytes::BytesMut;
use ferrobus_core::{ConnectionId, OutboundReceiver, Router};
use ferrobus_transport::{Accepted, Transport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Upper bound on bytes coalesced into one socket write.
const WRITE_BATCH_SIZE: usize = 64 * 1024;

/// Shared server state.
pub struct AppState {
    /// The message router.
    pub router: Router,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            router: Router::with_config(config.router_config()),
            config,
        }
    }
}

/// Bind the configured listener and run the bus.
///
/// # Errors
///
/// Returns an error if the listen address is invalid or cannot be bound.
pub async fn run_server(config: Config) -> Result<()> {
    let address = config.listen_address()?;
    let transport: Arc<dyn Transport> = ferrobus_transport::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?
        .into();

    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    if config.health.enabled {
        let health = HealthState {
            app: state.clone(),
            transport: transport.clone(),
        };
        let port = config.health.port;
        tokio::spawn(async move {
            if let Err(e) = serve_health(health, port).await {
                error!("Health endpoint failed: {:#}", e);
            }
        });
    }

    serve(transport, state).await
}

/// Accept clients from `transport` until the process exits.
///
/// # Errors
///
/// Currently never returns; accept errors are logged and retried.
pub async fn serve(transport: Arc<dyn Transport>, state: Arc<AppState>) -> Result<()> {
    info!(
        transport = transport.name(),
        "Ferrobus listening, clients connect to {}",
        transport.connect_string()
    );

    loop {
        match transport.accept().await {
            Ok(accepted) => {
                let state = state.clone();
                tokio::spawn(handle_connection(accepted, state));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                metrics::record_error("accept");
                // Persistent errors such as EMFILE would otherwise spin
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// State behind the health endpoint.
#[derive(Clone)]
struct HealthState {
    app: Arc<AppState>,
    transport: Arc<dyn Transport>,
}

/// Serve `/health` and `/stats`.
async fn serve_health(health: HealthState, port: u16) -> Result<()> {
    let app = axum::Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(health);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Health endpoint listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(health): State<HealthState>) -> impl IntoResponse {
    let (status, label) = if health.transport.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    let body = Json(serde_json::json!({
        "status": label,
        "transport": health.transport.name(),
        "version": env!("CARGO_PKG_VERSION")
    }));
    (status, body)
}

/// Router statistics handler.
async fn stats_handler(State(health): State<HealthState>) -> impl IntoResponse {
    Json(health.app.router.stats())
}

/// Drive one client from handshake to teardown.
async fn handle_connection(accepted: Accepted, state: Arc<AppState>) {
    let Accepted { mut stream, peer } = accepted;
    let mut input = BytesMut::with_capacity(4096);

    let token = state.config.auth.server_token.as_str();
    match tokio::time::timeout(
        state.config.auth_timeout(),
        handshake(&mut stream, &mut input, token),
    )
    .await
    {
        Ok(Ok(())) => debug!(peer = %peer, "Handshake complete"),
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "Handshake failed");
            metrics::record_error("handshake");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "Handshake timed out");
            metrics::record_error("handshake_timeout");
            return;
        }
    }

    let admission = match state.router.admit() {
        Ok(admission) => admission,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Connection refused");
            metrics::record_error("admission");
            return;
        }
    };
    let _metrics_guard = ConnectionMetricsGuard::new();
    let id = admission.id;

    debug!(connection = %id, peer = %peer, unique_name = %admission.unique_name, "Session started");

    let (reader, writer) = tokio::io::split(stream);
    let mut writer = tokio::spawn(write_outbound(id, admission.outbound, writer));

    let result = tokio::select! {
        read = read_inbound(&state, id, reader, input) => read,
        written = &mut writer => match written {
            Ok(written) => written.context("Write failed"),
            Err(e) => Err(e.into()),
        },
    };
    if let Err(e) = result {
        warn!(connection = %id, error = %e, "Session ended with error");
        metrics::record_error("session");
    }

    state.router.disconnect(id);
    writer.abort();
    metrics::set_router_stats(&state.router.stats());

    debug!(connection = %id, "Session ended");
}

/// Run the server side of the handshake.
///
/// Bytes following `BEGIN` stay in `input` for message framing.
async fn handshake<S>(stream: &mut S, input: &mut BytesMut, token: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut auth = ServerAuth::new(token);
    let mut output = BytesMut::new();

    loop {
        let status = auth.advance(input, &mut output);
        if !output.is_empty() {
            stream.write_all(&output).await?;
            output.clear();
        }

        if status? == AuthStatus::Complete {
            return Ok(());
        }

        if stream.read_buf(input).await? == 0 {
            anyhow::bail!("Connection closed during handshake in state {:?}", auth.state());
        }
    }
}

/// Read, decode and route inbound messages until the peer closes or
/// misbehaves.
///
/// Reading never waits on this connection's writes, so a peer that sends
/// before it reads cannot stall its own session.
async fn read_inbound<R>(state: &AppState, id: ConnectionId, mut reader: R, mut input: BytesMut) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let codec = MessageCodec::with_max_frame_size(state.config.limits.max_message_size);

    // The client may have pipelined messages behind BEGIN
    route_buffered(state, id, &codec, &mut input)?;

    loop {
        if reader.read_buf(&mut input).await? == 0 {
            debug!(connection = %id, "Connection closed by peer");
            return Ok(());
        }
        route_buffered(state, id, &codec, &mut input)?;
    }
}

/// Route every complete message in `input`.
fn route_buffered(
    state: &AppState,
    id: ConnectionId,
    codec: &MessageCodec,
    input: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let mut routed = 0usize;
    loop {
        let before = input.len();
        let Some(message) = codec.decode_from(input)? else {
            if routed > 0 {
                metrics::set_router_stats(&state.router.stats());
            }
            return Ok(());
        };
        metrics::record_message(before - input.len(), "inbound");

        let start = Instant::now();
        let outcome = state.router.route(id, &message);
        metrics::record_latency(start.elapsed().as_secs_f64());
        metrics::record_route(&outcome);
        routed += 1;
    }
}

/// Drain the outbound queue into the socket until the router drops the
/// queue at teardown.
async fn write_outbound<W>(id: ConnectionId, mut outbound: OutboundReceiver, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Only inbound frames are held to the configured limit
    let codec = MessageCodec::new();
    let mut write_buf = BytesMut::with_capacity(4096);

    while let Some(message) = outbound.recv().await {
        write_buf.clear();
        encode_outbound(id, &codec, &message, &mut write_buf);
        while write_buf.len() < WRITE_BATCH_SIZE {
            let Ok(message) = outbound.try_recv() else {
                break;
            };
            encode_outbound(id, &codec, &message, &mut write_buf);
        }
        if !write_buf.is_empty() {
            writer.write_all(&write_buf).await?;
        }
    }

    writer.shutdown().await
}

/// Append one outbound message to `buf`. A message that cannot be encoded
/// is dropped; the session stays open.
fn encode_outbound(id: ConnectionId, codec: &MessageCodec, message: &Message, buf: &mut BytesMut) {
    let before = buf.len();
    match codec.encode_into(message, buf) {
        Ok(()) => metrics::record_message(buf.len() - before, "outbound"),
        Err(e) => {
            warn!(connection = %id, serial = message.serial, error = %e, "Dropping unencodable message");
            metrics::record_error("encode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_protocol::auth::{client_preamble, read_ok_line};
    use bus_protocol::names::{request_name, BUS_INTERFACE, BUS_NAME, BUS_PATH};
    use bus_protocol::{codec, MessageKind};
    use ferrobus_transport::ByteStream;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        let mut config = Config::default();
        config.listen = "tcp:host=127.0.0.1,port=0".to_string();
        config.metrics.enabled = false;
        config.health.enabled = false;
        config
    }

    async fn start(config: Config) -> (String, Arc<AppState>) {
        let transport: Arc<dyn Transport> = ferrobus_transport::bind(&config.listen_address().unwrap())
            .await
            .unwrap()
            .into();
        let address = transport.connect_string();
        let state = Arc::new(AppState::new(config));
        tokio::spawn(serve(transport, state.clone()));
        (address, state)
    }

    struct Client {
        stream: Box<dyn ByteStream>,
        buf: BytesMut,
        serial: u32,
        unique_name: String,
    }

    impl Client {
        async fn connect(address: &str) -> Self {
            let mut stream = ferrobus_transport::connect(address).await.unwrap();
            stream.write_all(&client_preamble("ANONYMOUS")).await.unwrap();

            let mut buf = BytesMut::new();
            loop {
                if let Some(token) = read_ok_line(&mut buf).unwrap() {
                    assert_eq!(token, "f00f");
                    break;
                }
                assert_ne!(stream.read_buf(&mut buf).await.unwrap(), 0);
            }

            let mut client = Self {
                stream,
                buf,
                serial: 0,
                unique_name: String::new(),
            };
            client
                .send(Message::method_call(BUS_NAME, BUS_PATH, "Hello").with_interface(BUS_INTERFACE))
                .await;
            let reply = client.recv().await;
            client.unique_name = reply.arg_str(0).unwrap().to_string();
            client
        }

        async fn send(&mut self, message: Message) -> u32 {
            self.serial += 1;
            let data = codec::encode(&message.with_serial(self.serial)).unwrap();
            self.stream.write_all(&data).await.unwrap();
            self.serial
        }

        async fn recv(&mut self) -> Message {
            tokio::time::timeout(TIMEOUT, async {
                loop {
                    if let Some(message) = codec::decode_from(&mut self.buf).unwrap() {
                        return message;
                    }
                    assert_ne!(self.stream.read_buf(&mut self.buf).await.unwrap(), 0);
                }
            })
            .await
            .unwrap()
        }
    }

    async fn wait_for_connections(state: &AppState, count: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while state.router.stats().connection_count != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_closed(stream: &mut Box<dyn ByteStream>) {
        let mut buf = BytesMut::new();
        tokio::time::timeout(TIMEOUT, async {
            loop {
                match stream.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_hello_and_proxied_call() {
        let (address, state) = start(test_config()).await;
        let mut c1 = Client::connect(&address).await;
        let mut c2 = Client::connect(&address).await;

        assert!(c1.unique_name.starts_with(':'));
        assert!(c2.unique_name.starts_with(':'));
        assert_ne!(c1.unique_name, c2.unique_name);

        c1.send(Message::method_call(BUS_NAME, BUS_PATH, "RequestName").with_arg("com.example.Foo"))
            .await;
        let reply = c1.recv().await;
        assert_eq!(reply.args[0].as_u32(), Some(request_name::PRIMARY_OWNER));

        let call_serial = c2
            .send(
                Message::method_call("com.example.Foo", "/com/example/Foo", "Ping")
                    .with_sender(c2.unique_name.clone()),
            )
            .await;

        let call = c1.recv().await;
        assert_eq!(call.member, "Ping");
        c1.send(call.method_return().with_arg("pong")).await;

        let answer = c2.recv().await;
        assert_eq!(answer.kind, MessageKind::MethodReturn);
        assert_eq!(answer.reply_serial, Some(call_serial));
        assert_eq!(answer.arg_str(0), Some("pong"));
        assert!(state.router.correlations().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_signal() {
        let (address, _state) = start(test_config()).await;
        let mut c1 = Client::connect(&address).await;
        let mut c2 = Client::connect(&address).await;

        c1.send(Message::signal("/com/example", "com.example.Iface", "Changed"))
            .await;

        assert_eq!(c1.recv().await.member, "Changed");
        assert_eq!(c2.recv().await.member, "Changed");
    }

    #[tokio::test]
    async fn test_bad_handshake_is_rejected() {
        let (address, state) = start(test_config()).await;

        let mut stream = ferrobus_transport::connect(&address).await.unwrap();
        stream.write_all(b"AUTH ANONYMOUS\r\n").await.unwrap();
        wait_closed(&mut stream).await;

        assert_eq!(state.router.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let mut config = test_config();
        config.auth.timeout_ms = 50;
        let (address, _state) = start(config).await;

        let mut stream = ferrobus_transport::connect(&address).await.unwrap();
        wait_closed(&mut stream).await;
    }

    #[tokio::test]
    async fn test_disconnect_releases_names() {
        let (address, state) = start(test_config()).await;
        let mut c1 = Client::connect(&address).await;

        c1.send(Message::method_call(BUS_NAME, BUS_PATH, "RequestName").with_arg("com.example.Gone"))
            .await;
        c1.recv().await;
        assert!(state.router.resolve("com.example.Gone").is_some());

        drop(c1);

        tokio::time::timeout(TIMEOUT, async {
            while state.router.resolve("com.example.Gone").is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(state.router.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let mut config = test_config();
        config.limits.max_message_size = 512;
        let (address, state) = start(config).await;
        let mut c1 = Client::connect(&address).await;

        c1.stream.write_all(&[0, 0, 0x10, 0]).await.unwrap();
        wait_closed(&mut c1.stream).await;
        wait_for_connections(&state, 0).await;
    }

    #[tokio::test]
    async fn test_reserialed_message_at_size_limit_reaches_recipient() {
        let mut config = test_config();
        config.limits.max_message_size = 512;
        let (address, state) = start(config).await;
        let mut c1 = Client::connect(&address).await;
        let mut c2 = Client::connect(&address).await;

        // Push the router's serial counter past the one-byte encodings
        for _ in 0..300 {
            c1.send(Message::method_call(BUS_NAME, BUS_PATH, "AddMatch").with_arg("type='signal'"))
                .await;
        }
        for _ in 0..300 {
            c1.recv().await;
        }

        // A call whose body sits right at the limit while its serial is 1;
        // the forwarded copy carries a wider serial
        let call = |padding: usize| {
            Message::method_call(c2.unique_name.clone(), "/com/example", "Fill")
                .with_arg(vec![0u8; padding])
                .with_serial(1)
        };
        let padding = (0..1024)
            .find(|&padding| {
                let body = codec::encode(&call(padding)).unwrap().len() - codec::LENGTH_PREFIX_SIZE;
                body == 511 || body == 512
            })
            .unwrap();
        c1.stream.write_all(&codec::encode(&call(padding)).unwrap()).await.unwrap();

        let delivered = c2.recv().await;
        assert_eq!(delivered.member, "Fill");
        assert!(delivered.serial > 255);
        assert_eq!(state.router.stats().connection_count, 2);
        assert!(state.router.resolve(&c2.unique_name).is_some());
    }

    #[tokio::test]
    async fn test_sender_that_does_not_read_keeps_being_read() {
        let (address, _state) = start(test_config()).await;
        let mut c1 = Client::connect(&address).await;
        let mut c2 = Client::connect(&address).await;

        // Every broadcast echoes back to c1, which reads nothing until it
        // has written all of them
        const COUNT: usize = 1024;
        let payload = vec![7u8; 32 * 1024];
        tokio::time::timeout(Duration::from_secs(20), async {
            for _ in 0..COUNT {
                c1.send(Message::signal("/com/example", "com.example.Bulk", "Big").with_arg(payload.clone()))
                    .await;
            }
        })
        .await
        .unwrap();

        assert_eq!(c2.recv().await.member, "Big");
        for _ in 0..COUNT {
            assert_eq!(c1.recv().await.member, "Big");
        }
    }

    #[test]
    fn test_unencodable_outbound_message_is_skipped() {
        let codec = MessageCodec::with_max_frame_size(128);
        let id = Router::new().admit().unwrap().id;
        let mut buf = BytesMut::new();

        let big = Message::signal("/a", "com.example.Iface", "Big").with_arg(vec![0u8; 256]);
        let small = Message::signal("/a", "com.example.Iface", "Small").with_serial(2);
        encode_outbound(id, &codec, &big, &mut buf);
        assert!(buf.is_empty());
        encode_outbound(id, &codec, &small, &mut buf);

        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap().member, "Small");
        assert!(buf.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_reflects_transport() {
        let config = test_config();
        let path = std::env::temp_dir().join(format!("ferrobus-health-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let transport: Arc<dyn Transport> = Arc::new(ferrobus_transport::UnixTransport::bind(&path).unwrap());
        let health = HealthState {
            app: Arc::new(AppState::new(config)),
            transport,
        };

        let response = health_handler(State(health.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        std::fs::remove_file(&path).unwrap();
        let response = health_handler(State(health)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! End-to-end throughput benchmark for Ferrobus.
//!
//! Measures broadcast signal throughput with real socket I/O against a
//! running `ferrobusd`.
//!
//! ```bash
//! e2e_throughput [clients] [connect-string]
//! e2e_throughput 16 tcp:127.0.0.1:7000
//! ```

use bus_protocol::auth::{client_preamble, read_ok_line};
use bus_protocol::names::{BUS_INTERFACE, BUS_NAME, BUS_PATH};
use bus_protocol::{codec, Message};
use bytes::BytesMut;
use ferrobus_transport::ByteStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Barrier;

const DEFAULT_ADDRESS: &str = "tcp:127.0.0.1:7000";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let address = args.get(2).cloned().unwrap_or_else(|| DEFAULT_ADDRESS.to_string());

    println!("Ferrobus end-to-end throughput benchmark");
    println!("Make sure the server is running: cargo run --release --bin ferrobusd");
    println!();

    run_broadcast_benchmark(num_clients, address).await;
}

async fn run_broadcast_benchmark(num_clients: usize, address: String) {
    println!("Broadcast benchmark: {} clients against {}", num_clients, address);
    println!("  Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let address = address.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(&address, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to connect
    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("Results");
    println!("  Clients:         {:>10}", num_clients);
    println!("  Duration:        {:>10.2}s", elapsed.as_secs_f64());
    println!("  Messages recv'd: {:>10}", total_messages);
    println!("  Throughput:      {:>10.0} msg/s", msgs_per_sec);
    println!("  Per client:      {:>10.0} msg/s", msgs_per_sec_per_client);

    for handle in handles {
        handle.abort();
    }
}

/// Authenticate and say Hello, leaving any extra bytes in `buf`.
async fn open_session(address: &str, buf: &mut BytesMut) -> Result<Box<dyn ByteStream>, BoxError> {
    let mut stream = ferrobus_transport::connect(address).await?;
    stream.write_all(&client_preamble("ANONYMOUS")).await?;

    while read_ok_line(buf)?.is_none() {
        if stream.read_buf(buf).await? == 0 {
            return Err("server closed during handshake".into());
        }
    }

    let hello = Message::method_call(BUS_NAME, BUS_PATH, "Hello")
        .with_interface(BUS_INTERFACE)
        .with_serial(1);
    stream.write_all(&codec::encode(&hello)?).await?;
    loop {
        if codec::decode_from(buf)?.is_some() {
            return Ok(stream);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err("server closed before Hello reply".into());
        }
    }
}

async fn run_client(
    address: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let mut buf = BytesMut::with_capacity(65536);
    let stream = open_session(address, &mut buf).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Wait for all clients to be ready
    barrier.wait().await;

    // Pre-encode the signal
    let signal = Message::signal("/bench", "com.example.Bench", "Tick")
        .with_serial(2)
        .with_arg(vec![0u8; 64]);
    let signal_bytes = codec::encode(&signal)?;

    // Separate receiver task for full-duplex operation
    let recv_task = tokio::spawn(async move {
        loop {
            while let Ok(Some(_message)) = codec::decode_from(&mut buf) {
                message_count.fetch_add(1, Ordering::Relaxed);
            }
            match reader.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    loop {
        if writer.write_all(&signal_bytes).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

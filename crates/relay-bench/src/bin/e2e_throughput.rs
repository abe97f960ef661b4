//! End-to-end throughput benchmark for Relay.
//!
//! Measures delivered messages per second over real TCP connections against
//! a running server. Each client opens one subscriber and one publisher
//! connection on a shared topic.

use relay_protocol::{codec, Request, Response};
use relay_transport::{Connection, TcpConnection};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;

const DEFAULT_SERVER: &str = "127.0.0.1:7878";
const TOPIC: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let server: SocketAddr = args
        .get(2)
        .map(String::as_str)
        .unwrap_or(DEFAULT_SERVER)
        .parse()?;

    println!("Relay end-to-end throughput benchmark");
    println!("  Server:  {} (start it with: cargo run --release)", server);
    println!("  Clients: {}", num_clients);
    println!("  Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));
    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let delivered = Arc::clone(&delivered);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(server, delivered, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    // Wait for all clients to subscribe
    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results");
    println!("  Duration:         {:>10.2}s", elapsed.as_secs_f64());
    println!("  Delivered:        {:>10}", total);
    println!("  Throughput:       {:>10.0} msg/s", per_sec);
    println!(
        "  Per client:       {:>10.0} msg/s",
        per_sec / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn run_client(
    server: SocketAddr,
    delivered: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let mut subscriber = TcpConnection::connect(server).await?;
    subscriber
        .send_raw(codec::encode(&Request::subscribe(TOPIC))?)
        .await?;
    // Subscribe acknowledgement
    subscriber.recv().await?;

    let mut publisher = TcpConnection::connect(server).await?;
    let publish = codec::encode(&Request::publish(TOPIC, "x".repeat(64), 0))?;

    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Ok(Some(frame)) = subscriber.recv().await {
            if frame.get("type").is_some() {
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    // One request in flight at a time; back off while the topic is full
    loop {
        if publisher.send_raw(publish.clone()).await.is_err() {
            break;
        }
        let response: Response = match publisher.recv().await {
            Ok(Some(frame)) => serde_json::from_value(frame)?,
            _ => break,
        };
        if !response.is_ok() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    recv_task.abort();
    Ok(())
}

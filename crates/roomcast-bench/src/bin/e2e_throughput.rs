//! End-to-end throughput benchmark for Roomcast.
//!
//! Connects N WebSocket clients to one room of a running server and has every
//! client broadcast as fast as it can. The server must admit the clients and
//! read identity from the query string, for example with
//! `ROOMCAST_OPEN_ROOMS=true ROOMCAST_AUTH__USER_QUERY=user_id`.

use futures_util::{SinkExt, StreamExt};
use roomcast_bench::chat_json;
use roomcast_protocol::{codec, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws/benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("Roomcast end-to-end throughput benchmark");
    println!(
        "Server: {SERVER_URL} (start it with ROOMCAST_OPEN_ROOMS=true ROOMCAST_AUTH__USER_QUERY=user_id)"
    );
    println!();

    run_room_benchmark(num_clients).await;
}

async fn run_room_benchmark(num_clients: usize) {
    println!("Room broadcast: {} clients", num_clients);
    println!("Warmup: {}s, measurement: {}s", WARMUP_SECS, BENCH_SECS);

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();

    println!();
    println!("Clients:          {:>12}", num_clients);
    println!("Duration:         {:>12.2}s", elapsed.as_secs_f64());
    println!("Messages received:{:>12}", total_messages);
    println!("Throughput:       {:>12.0} msg/s", msgs_per_sec);
    println!(
        "Per client:       {:>12.0} msg/s",
        msgs_per_sec / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!("{SERVER_URL}?user_id=bench-{client_id}");
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    barrier.wait().await;

    let recv_count = Arc::clone(&message_count);
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            // One frame may carry several coalesced messages.
            let frame = match result {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(_) => continue,
                Err(_) => break,
            };
            if let Ok(batch) = codec::decode_batch(&frame) {
                recv_count.fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
        }
    });

    let message = Message::Text(chat_json(64));
    loop {
        if sender.send(message.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

//! End-to-end throughput benchmark for Murmur.
//!
//! Every client joins the same room and submits messages as fast as the
//! server acknowledges them, so each message is fanned out to all clients.
//! Measures delivered room messages per second over real WebSocket I/O.

use bytes::BytesMut;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use murmur_protocol::{codec, ClientFrame, ServerFrame, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const ROOM: &str = "public";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Murmur End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_room_benchmark(num_clients).await;
}

async fn run_room_benchmark(num_clients: usize) {
    println!("📊 Room Benchmark: {} clients in '{}'", num_clients, ROOM);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

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
    println!("✓ All {} clients joined", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Delivered Messages:   {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// Read frames until one matches `pred`, skipping everything else.
async fn wait_for(
    receiver: &mut WsReader,
    buf: &mut BytesMut,
    pred: impl Fn(&ServerFrame) -> bool,
) -> Result<ServerFrame, BoxError> {
    loop {
        while let Some(frame) = codec::decode_from::<ServerFrame>(buf)? {
            if let ServerFrame::Error { code, message, .. } = &frame {
                return Err(format!("server error {code}: {message}").into());
            }
            if pred(&frame) {
                return Ok(frame);
            }
        }
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err("connection closed".into()),
        }
    }
}

async fn run_client(
    client_id: usize,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();
    let mut recv_buf = BytesMut::with_capacity(65536);

    let connect = ClientFrame::connect(PROTOCOL_VERSION.major, format!("bench-{client_id}"));
    sender
        .send(Message::Binary(codec::encode(&connect)?.to_vec()))
        .await?;
    wait_for(&mut receiver, &mut recv_buf, |f| {
        matches!(f, ServerFrame::Connected { .. })
    })
    .await?;

    let join = ClientFrame::join(1, ROOM);
    sender
        .send(Message::Binary(codec::encode(&join)?.to_vec()))
        .await?;
    wait_for(&mut receiver, &mut recv_buf, |f| {
        matches!(f, ServerFrame::Ack { id: 1, .. })
    })
    .await?;

    barrier.wait().await;

    let message = ClientFrame::message(2, ROOM, format!("hello from {client_id}"));
    let message = Message::Binary(codec::encode(&message)?.to_vec());

    let recv_count = Arc::clone(&message_count);
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Binary(data)) = result {
                recv_buf.extend_from_slice(&data);
                while let Ok(Some(frame)) = codec::decode_from::<ServerFrame>(&mut recv_buf) {
                    if let ServerFrame::Message { .. } = frame {
                        recv_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    loop {
        if sender.send(message.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

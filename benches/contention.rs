use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY0: i64 = 1_767_225_600_000; // 2026-01-01T00:00:00Z

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config.host(host).port(port).dbname("meetd").user("meetd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn iso(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .expect("timestamp in range")
        .to_rfc3339()
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn create_user(client: &Client, label: &str) -> String {
    let email = format!("{label}-{}@bench.example.com", Ulid::new()).to_lowercase();
    let messages = client
        .simple_query(&format!(
            "INSERT INTO users (name, email) VALUES ('{label}', '{email}') RETURNING *"
        ))
        .await
        .expect("create user");
    messages
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
            _ => None,
        })
        .expect("user row")
}

async fn book(client: &Client, user: &str, start: i64, end: i64) -> Result<(), tokio_postgres::Error> {
    client
        .simple_query(&format!(
            "INSERT INTO meetings (user_id, title, start_time, end_time) \
             VALUES ('{user}', 'bench', '{}', '{}')",
            iso(start),
            iso(end)
        ))
        .await
        .map(|_| ())
}

/// Back-to-back bookings for one user from one connection.
async fn phase_sequential(host: &str, port: u16, n: i64) {
    let client = connect(host, port).await;
    let user = create_user(&client, "sequential").await;
    let mut latencies = Vec::with_capacity(n as usize);

    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        book(&client, &user, DAY0 + i * HOUR, DAY0 + (i + 1) * HOUR)
            .await
            .expect("back-to-back booking");
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("book", &mut latencies);
}

/// Many connections racing for the same slots of one user.
async fn phase_contended(host: &str, port: u16, clients: usize, slots: i64) {
    let setup = connect(host, port).await;
    let user = create_user(&setup, "contended").await;

    let mut handles = Vec::new();
    for _ in 0..clients {
        let host = host.to_string();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (mut won, mut lost, mut latencies) = (0u64, 0u64, Vec::new());
            for slot in 0..slots {
                let t = Instant::now();
                let start = DAY0 + slot * HOUR;
                match book(&client, &user, start, start + HOUR).await {
                    Ok(()) => won += 1,
                    Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => lost += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
                latencies.push(t.elapsed());
            }
            (won, lost, latencies)
        }));
    }

    let (mut won, mut lost, mut latencies) = (0u64, 0u64, Vec::new());
    for h in handles {
        let (w, l, lat) = h.await.expect("task panicked");
        won += w;
        lost += l;
        latencies.extend(lat);
    }
    println!("  {clients} clients x {slots} slots: {won} booked, {lost} conflicts");
    assert_eq!(won, slots as u64, "each slot must be booked exactly once");
    print_latency("book (contended)", &mut latencies);
}

/// One user per connection; no shared locks between them.
async fn phase_independent(host: &str, port: u16, clients: usize, per_client: i64) {
    let start = Instant::now();
    let mut handles = Vec::new();
    for c in 0..clients {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let user = create_user(&client, &format!("independent{c}")).await;
            let mut latencies = Vec::new();
            for i in 0..per_client {
                let t = Instant::now();
                book(&client, &user, DAY0 + i * HOUR, DAY0 + (i + 1) * HOUR)
                    .await
                    .expect("independent booking");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.expect("task panicked"));
    }
    let elapsed = start.elapsed();
    let total = latencies.len();
    println!(
        "  {total} bookings across {clients} users in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    print_latency("book (independent)", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("MEETD_BENCH_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("MEETD_BENCH_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5433);

    println!("=== meetd contention benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential back-to-back bookings");
    phase_sequential(&host, port, 500).await;

    println!("\n[phase 2] contended bookings, one user");
    phase_contended(&host, port, 16, 100).await;

    println!("\n[phase 3] independent users in parallel");
    phase_independent(&host, port, 16, 100).await;
}

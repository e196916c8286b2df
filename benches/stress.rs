use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("seatd")
        .password("seatd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
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

async fn create_trip(client: &tokio_postgres::Client, seats: u32) -> Ulid {
    let trip = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO trips (id, total_seats) VALUES ('{trip}', {seats})"
        ))
        .await
        .unwrap();
    trip
}

/// Place a hold and return its id, or None when the trip is sold out.
async fn hold(client: &tokio_postgres::Client, trip: Ulid, seats: u32, token: &str) -> Option<String> {
    let msgs = client
        .simple_query(&format!(
            "INSERT INTO holds (trip_id, seats, holder_token) VALUES ('{trip}', {seats}, '{token}')"
        ))
        .await
        .ok()?;
    msgs.into_iter().find_map(|m| match m {
        SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
        _ => None,
    })
}

async fn phase1_checkout_cycle(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let trip = create_trip(&client, 100_000).await;

    let n = 2000;
    let mut hold_lat = Vec::with_capacity(n);
    let mut finalize_lat = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let token = format!("session-{i}");
        let t = Instant::now();
        let Some(hold_id) = hold(&client, trip, 2, &token).await else { continue };
        hold_lat.push(t.elapsed());

        let t = Instant::now();
        client
            .simple_query(&format!(
                "INSERT INTO bookings (hold_id, holder_token) VALUES ('{hold_id}', '{token}')"
            ))
            .await
            .unwrap();
        finalize_lat.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} hold+finalize cycles in {:.2}s = {ops:.0} checkouts/sec", elapsed.as_secs_f64());
    print_latency("hold latency", &mut hold_lat);
    print_latency("finalize latency", &mut finalize_lat);
}

async fn phase2_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let seats = 50u32;
    let trip = create_trip(&setup, seats).await;

    let n_clients = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_clients {
        let host = host.to_string();
        let tenant = tenant.clone();
        let won = won.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            if hold(&client, trip, 1, &format!("racer-{i}")).await.is_some() {
                won.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients raced for {seats} seats: {won} holds granted in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    assert!(won <= seats as usize, "oversold: {won} holds for {seats} seats");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let trip = create_trip(&setup, 1_000).await;

    // Writers churn holds on the shared trip
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let token = format!("writer-{w}");
            while !stop.load(Ordering::Relaxed) {
                if let Some(hold_id) = hold(&client, trip, 3, &token).await {
                    let _ = client
                        .batch_execute(&format!(
                            "DELETE FROM holds WHERE id = '{hold_id}' AND holder_token = '{token}'"
                        ))
                        .await;
                }
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM trips WHERE id = '{trip}'"))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("inventory query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let trip = create_trip(&client, 100).await;
            for i in 0..ops_per_conn {
                hold(&client, trip, 1, &format!("storm-{i}")).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} holds each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SEATD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SEATD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SEATD_PORT");

    println!("=== seatd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential checkout throughput");
    phase1_checkout_cycle(&host, port).await;

    println!("\n[phase 2] contention on a small trip");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] inventory reads under hold churn");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}

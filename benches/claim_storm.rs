use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HALF_HOUR: i64 = 1_800_000;
/// 2025-06-02T08:00:00Z
const FIRST_SLOT: i64 = 1_748_851_200_000;

async fn connect(host: &str, port: u16, password: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("tutorslot")
        .user("bench")
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("cannot reach tutorslot");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("bench connection closed: {e}");
        }
    });
    client
}

/// Collected request timings for one phase.
#[derive(Default)]
struct Latencies(Vec<Duration>);

impl Latencies {
    fn time(&mut self, since: Instant) {
        self.0.push(since.elapsed());
    }

    fn absorb(&mut self, other: Latencies) {
        self.0.extend(other.0);
    }

    fn ms_at(&self, quantile: f64) -> f64 {
        let rank = ((self.0.len() - 1) as f64 * quantile).round() as usize;
        self.0[rank].as_secs_f64() * 1e3
    }

    fn report(mut self, label: &str) {
        if self.0.is_empty() {
            println!("  {label}: nothing recorded");
            return;
        }
        self.0.sort_unstable();
        let mean_ms = self.0.iter().map(Duration::as_secs_f64).sum::<f64>() * 1e3 / self.0.len() as f64;
        println!(
            "  {label}: n={} mean={mean_ms:.2}ms p50={:.2}ms p95={:.2}ms p99={:.2}ms max={:.2}ms",
            self.0.len(),
            self.ms_at(0.50),
            self.ms_at(0.95),
            self.ms_at(0.99),
            self.ms_at(1.0),
        );
    }
}

/// Publish `n` consecutive half-hour windows for a fresh tutor, in batches.
async fn publish_windows(client: &tokio_postgres::Client, tutor: &str, n: usize) -> Vec<Ulid> {
    let ids: Vec<Ulid> = (0..n).map(|_| Ulid::new()).collect();
    for (chunk_no, chunk) in ids.chunks(500).enumerate() {
        let values: Vec<String> = chunk
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let s = FIRST_SLOT + ((chunk_no * 500 + i) as i64) * HALF_HOUR;
                format!("('{id}', '{tutor}', {s}, {})", s + HALF_HOUR)
            })
            .collect();
        client
            .batch_execute(&format!(
                r#"INSERT INTO windows (id, owner_id, start, "end") VALUES {}"#,
                values.join(", ")
            ))
            .await
            .unwrap();
    }
    ids
}

async fn phase1_sequential_claims(host: &str, port: u16, password: &str) {
    let client = connect(host, port, password).await;
    let n = 2000;
    let ids = publish_windows(&client, &format!("tutor-seq-{}", Ulid::new()), n).await;

    let mut latencies = Latencies::default();
    let started = Instant::now();
    for id in &ids {
        let t = Instant::now();
        client
            .batch_execute(&format!(
                "INSERT INTO bookings (window_id, student_id) VALUES ('{id}', 'student-seq')"
            ))
            .await
            .unwrap();
        latencies.time(t);
    }

    let secs = started.elapsed().as_secs_f64();
    println!("  {n} claims in {secs:.2}s ({:.0}/s)", n as f64 / secs);
    latencies.report("claim");
}

/// Many students race for the same few windows. Every window must end up
/// with exactly one winner.
async fn phase2_contended_claims(host: &str, port: u16, password: &str) {
    let n_windows = 20;
    let n_students = 50;

    let setup = connect(host, port, password).await;
    let tutor = format!("tutor-storm-{}", Ulid::new());
    let ids = Arc::new(publish_windows(&setup, &tutor, n_windows).await);

    let booked = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    let mut students = Vec::new();

    for s in 0..n_students {
        let host = host.to_string();
        let password = password.to_string();
        let ids = ids.clone();
        let booked = booked.clone();
        let rejected = rejected.clone();
        students.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let mut latencies = Latencies::default();
            // Students walk the windows from different offsets.
            for k in 0..ids.len() {
                let id = ids[(s + k) % ids.len()];
                let t = Instant::now();
                let result = client
                    .batch_execute(&format!(
                        "INSERT INTO bookings (window_id, student_id) VALUES ('{id}', 'student-{s}')"
                    ))
                    .await;
                latencies.time(t);
                match result {
                    Ok(()) => booked.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
            latencies
        }));
    }

    let mut latencies = Latencies::default();
    for student in students {
        latencies.absorb(student.await.expect("student task panicked"));
    }

    let secs = started.elapsed().as_secs_f64();
    let booked = booked.load(Ordering::Relaxed);
    let rejected = rejected.load(Ordering::Relaxed);
    println!(
        "  {n_students} students over {n_windows} windows: {booked} booked, {rejected} turned away in {secs:.2}s"
    );
    latencies.report("contended claim");

    let rows = setup
        .simple_query(&format!("SELECT * FROM bookings WHERE tutor_id = '{tutor}'"))
        .await
        .unwrap()
        .into_iter()
        .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
        .count();
    assert_eq!(booked, n_windows, "every window booked exactly once");
    assert_eq!(rows, n_windows, "one booking row per window");
    println!("  invariant holds: {rows} bookings for {n_windows} windows");
}

async fn phase3_calendar_reads(host: &str, port: u16, password: &str) {
    let client = connect(host, port, password).await;
    let tutor = format!("tutor-cal-{}", Ulid::new());
    publish_windows(&client, &tutor, 1000).await;

    let reads = 500;
    let mut latencies = Latencies::default();
    for _ in 0..reads {
        let t = Instant::now();
        client
            .simple_query(&format!(
                "SELECT * FROM open_days WHERE owner_id = '{tutor}' AND year = 2025 AND month = 6"
            ))
            .await
            .unwrap();
        latencies.time(t);
    }
    latencies.report("open_days");
}

#[tokio::main]
async fn main() {
    let host = std::env::var("TUTORSLOT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = match std::env::var("TUTORSLOT_PORT") {
        Ok(p) => p.parse().expect("TUTORSLOT_PORT must be a port number"),
        Err(_) => 5433,
    };
    let password = std::env::var("TUTORSLOT_PASSWORD").unwrap_or_else(|_| "tutorslot".into());

    println!("tutorslot claim storm against {host}:{port}\n");

    println!("[phase 1] sequential claim throughput");
    phase1_sequential_claims(&host, port, &password).await;

    println!("\n[phase 2] contended claims");
    phase2_contended_claims(&host, port, &password).await;

    println!("\n[phase 3] calendar reads");
    phase3_calendar_reads(&host, port, &password).await;

    println!("\ndone");
}

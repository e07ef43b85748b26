use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use ulid::Ulid;

use kitroom::clock::SystemClock;
use kitroom::fields::NoRequiredFields;
use kitroom::hours::WeeklySchedule;
use kitroom::model::*;
use kitroom::services::Services;

fn day(n: i64) -> NaiveDateTime {
    let base = NaiveDate::from_ymd_opt(2030, 1, 1)
        .unwrap()
        .and_time(NaiveTime::from_hms_opt(10, 0, 0).unwrap());
    base + TimeDelta::days(n)
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

struct Desk {
    services: Arc<Services>,
    location: Ulid,
    borrower: Ulid,
}

async fn start(name: &str) -> Desk {
    let dir = std::env::temp_dir().join(format!("kitroom_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let hours = Arc::new(WeeklySchedule::new());
    let services = Services::start(
        &dir.join("kitroom.wal"),
        ConflictGranularity::Day,
        hours.clone(),
        Arc::new(NoRequiredFields),
        Arc::new(SystemClock),
    )
    .expect("open store");
    let location = services.catalog.register_location(name).await.unwrap();
    hours.open_daily(
        location,
        NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
    );
    let borrower = services.catalog.register_borrower("bench").await.unwrap();
    Desk {
        services: Arc::new(services),
        location,
        borrower,
    }
}

async fn serialized_model(desk: &Desk, units: usize) -> Ulid {
    let catalog = &desk.services.catalog;
    let model = catalog
        .register_model("Bench", "Cameras", &format!("model-{}", Ulid::new()), TrackingKind::Serialized)
        .await
        .unwrap();
    for _ in 0..units {
        catalog.register_asset(model, desk.location, None).await.unwrap();
    }
    model
}

async fn reserve(desk: &Desk, model: Ulid, first_day: i64) -> Result<Ulid, kitroom::engine::EngineError> {
    desk.services
        .reservations
        .create_reservation(
            desk.borrower,
            desk.location,
            Period::new(day(first_day), day(first_day + 1)),
            &[ItemRequest::new(model, 1)],
            None,
            desk.borrower,
        )
        .await
}

async fn phase1_sequential() {
    let desk = start("sequential").await;
    let model = serialized_model(&desk, 1).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        // Two-day loans every other day never overlap.
        reserve(&desk, model, (i as i64) * 2).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent() {
    let desk = Arc::new(start("concurrent").await);
    let n_tasks = 10;
    let n_per_task = 200;
    let mut models = Vec::new();
    for _ in 0..n_tasks {
        models.push(serialized_model(&desk, 5).await);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for (i, model) in models.into_iter().enumerate() {
        let desk = desk.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                // Five units per model: five loans share each pair of days.
                let _ = reserve(&desk, model, (j as i64) / 5 * 2 + (i as i64 % 2)).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load() {
    let desk = Arc::new(start("read-under-load").await);
    let hot = serialized_model(&desk, 10).await;
    for i in 0..200 {
        let _ = reserve(&desk, hot, i % 100).await;
    }

    // Background writers reserve other models meanwhile
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let desk = desk.clone();
        let stop = stop.clone();
        let model = serialized_model(&desk, 10).await;
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = reserve(&desk, model, i % 300).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let desk = desk.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let first = ((r * reads_per_reader + i) % 90) as i64;
                let period = Period::new(day(first), day(first + 7));
                let t = Instant::now();
                desk.services
                    .availability
                    .free_units(hot, desk.location, period)
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

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_contended_checkout() {
    let desk = Arc::new(start("contended").await);
    let model = serialized_model(&desk, 20).await;
    let n_sessions = 200;
    let period = Period::new(day(3), day(5));

    let success = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_sessions {
        let desk = desk.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let cart = &desk.services.cart;
            let session = Ulid::new();
            if cart
                .add_item(session, model, desk.location, period, 1, vec![])
                .await
                .is_err()
            {
                return;
            }
            if cart.checkout(session, desk.borrower, desk.borrower).await.is_ok() {
                success.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    let free = desk
        .services
        .availability
        .free_units(model, desk.location, period)
        .await
        .unwrap();
    println!(
        "  {n_sessions} carts racing for 20 units: {ok} checked out, {free} left, in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert!(ok <= 20, "overbooked: {ok} checkouts for 20 units");
}

async fn phase5_compaction() {
    let desk = start("compaction").await;
    let model = serialized_model(&desk, 3).await;
    for i in 0..2000 {
        let loan = reserve(&desk, model, i % 50).await;
        if let Ok(loan) = loan {
            desk.services.reservations.cancel_loan(loan, desk.borrower).await.unwrap();
        }
    }
    let appends = desk.services.store.wal_appends_since_compact().await;
    let t = Instant::now();
    desk.services.store.compact_wal().await.unwrap();
    println!(
        "  compacted {appends} appends in {:.2}ms",
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== kitroom stress benchmark ===\n");

    println!("[phase 1] sequential reservation throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent reservation throughput");
    phase2_concurrent().await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load().await;

    println!("\n[phase 4] contended cart checkout");
    phase4_contended_checkout().await;

    println!("\n[phase 5] WAL compaction");
    phase5_compaction().await;

    println!("\n=== done ===");
}

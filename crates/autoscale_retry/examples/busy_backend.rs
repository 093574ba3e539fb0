// examples/busy_backend.rs
//
// Drives an autoscaler against a simulated backend that answers 429 once more than
// BACKEND_CAPACITY calls overlap, and occasionally fails with a 502. The retry engine sits in
// front of the autoscaler and repeats the 502s.
//
//   RUST_LOG=autoscale_retry=debug cargo run --example busy_backend

use std::{
    env,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use autoscale_retry::{
    Error as CrateError,
    autoscaler::{Autoscaler, AutoscalerSettings},
    http::{HttpError, HttpStatusFailureLogic},
    retry::{RetryEngine, RetryOptions},
};
use http::StatusCode;
use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

const DEFAULT_CAPACITY: usize = 6;
const DEFAULT_REQUESTS: u32 = 60;

fn get_env_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring {}={:?}: not a valid value", name, value);
            default
        }),
        Err(_) => default,
    }
}

/// A pretend API: each call takes 50-150ms and the server only tolerates `capacity` of them
/// at once.
#[derive(Clone)]
struct SimulatedBackend {
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
}

impl SimulatedBackend {
    async fn fetch(&self, page: u32) -> Result<String, HttpError> {
        let overlapping = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let (latency, flaky) = {
            let mut rng = rand::rng();
            (rng.random_range(50..=150), rng.random_bool(0.05))
        };
        sleep(Duration::from_millis(latency)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if overlapping > self.capacity {
            return Err(HttpError::Status {
                status: StatusCode::TOO_MANY_REQUESTS,
                body: format!("{} concurrent calls, limit is {}", overlapping, self.capacity),
            });
        }
        if flaky {
            return Err(HttpError::Status {
                status: StatusCode::BAD_GATEWAY,
                body: "upstream hiccup".to_string(),
            });
        }
        Ok(format!("page {} ({}ms)", page, latency))
    }
}

#[tokio::main]
async fn main() -> Result<(), CrateError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();
    let capacity = get_env_var("BACKEND_CAPACITY", DEFAULT_CAPACITY);
    let requests = get_env_var("REQUESTS", DEFAULT_REQUESTS);
    info!("Backend capacity {}, sending {} requests", capacity, requests);

    let backend = SimulatedBackend {
        capacity,
        in_flight: Arc::new(AtomicUsize::new(0)),
    };

    let settings = AutoscalerSettings::builder()
        .min_parallel(1)
        .max_parallel(capacity * 2)
        .grow_delay(Duration::from_millis(200))
        .busy_grow_delay(Duration::from_secs(1))
        .idle_or_busy_decrease(Duration::from_secs(2))
        .build();
    let autoscaler = Autoscaler::new(
        settings,
        move |page: u32| {
            let backend = backend.clone();
            async move { backend.fetch(page).await }
        },
        HttpStatusFailureLogic::default(),
    )?;

    let submitter = autoscaler.clone();
    let engine = RetryEngine::new(
        RetryOptions::builder()
            .max_retries(3)
            .base_wait(Duration::from_millis(100))
            .max_wait(Duration::from_secs(2))
            .build(),
        move |page: u32| submitter.submit_request(page),
    );

    let reporter = {
        let autoscaler = autoscaler.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(500)).await;
                let diagnostics = autoscaler.to_diagnostics();
                info!(
                    "max_active={} active={} pending={}",
                    diagnostics.metrics.max_active,
                    diagnostics.active_count,
                    diagnostics.pending_count
                );
            }
        })
    };

    let tasks: Vec<_> = (0..requests)
        .map(|page| {
            let engine = engine.clone();
            tokio::spawn(async move { (page, engine.invoke(page).await) })
        })
        .collect();

    let mut failed = 0;
    for task in tasks {
        let (page, outcome) = task.await?;
        match outcome {
            Ok(body) => info!("[{}] {}", page, body),
            Err(error) => {
                failed += 1;
                info!("[{}] gave up: {}", page, error);
            }
        }
    }
    reporter.abort();

    info!(
        "Done: {} failed, final state {}",
        failed,
        autoscaler.to_json()?
    );
    Ok(())
}

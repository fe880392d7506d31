use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use artifact_loader::{Config, Listener, Loader};
use parking_lot::Mutex;
use rand::Rng;
use sketches_ddsketch::DDSketch;
use tokio::sync::{Semaphore, oneshot};

use crate::workloads::{SyntheticProducer, WorkloadsConfig};

type SyntheticLoader = Loader<u64, Vec<u8>>;

/// How a single request was answered.
#[derive(Clone, Copy, Debug)]
enum Outcome {
    Hit,
    Computed,
    Dropped,
}

/// Forwards the notification of one request to the awaiting task.
///
/// The sender is dropped along with the listener if the request is deduplicated.
struct OneshotListener(Mutex<Option<oneshot::Sender<Outcome>>>);

impl Listener<u64, Vec<u8>> for OneshotListener {
    fn on_loading(&self) {}

    fn on_loaded(&self, _key: &u64, _value: Option<Arc<Vec<u8>>>, animate: bool) {
        let outcome = if animate {
            Outcome::Computed
        } else {
            Outcome::Hit
        };
        if let Some(sender) = self.0.lock().take() {
            sender.send(outcome).ok();
        }
    }
}

async fn request(loader: &SyntheticLoader, key: u64) -> Outcome {
    let (sender, receiver) = oneshot::channel();
    loader.request(key, OneshotListener(Mutex::new(Some(sender))));
    receiver.await.unwrap_or(Outcome::Dropped)
}

#[derive(Default)]
struct Outcomes {
    hits: AtomicUsize,
    computed: AtomicUsize,
    dropped: AtomicUsize,
}

impl Outcomes {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Hit => &self.hits,
            Outcome::Computed => &self.computed,
            Outcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    Duration::from_secs_f64(sketch.quantile(q).ok().flatten().unwrap_or_default())
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads, each with its own loader
    let workloads = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            let loader = SyntheticLoader::from_config(&config, SyntheticProducer::new(&workload))
                .context("failed to start loader")?;
            Ok((workload.concurrency.max(1), workload.keys.max(1), Arc::new(loader)))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: request every key once, so that the cache is as full as it gets
    {
        let start = Instant::now();

        let futures = workloads.iter().flat_map(|(_, keys, loader)| {
            (0..*keys).map(move |key| {
                let loader = Arc::clone(loader);
                tokio::spawn(async move { request(&loader, key).await })
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, keys, loader) in workloads {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let outcomes = Arc::new(Outcomes::default());
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let loader = Arc::clone(&loader);
                        let task_durations = Arc::clone(&task_durations);
                        let outcomes = Arc::clone(&outcomes);
                        let key = rand::rng().random_range(0..keys);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            let outcome = request(&loader, key).await;

                            outcomes.record(outcome);
                            task_durations.lock().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations = std::mem::take(&mut *task_durations.lock());
            let stats = loader.stats();
            loader.close();

            (concurrency, task_durations, outcomes, stats)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, outcomes, stats) = task.context("workload panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops > 0 {
            let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
            let p50 = quantile(&task_durations, 0.5);
            let p90 = quantile(&task_durations, 0.9);
            let p99 = quantile(&task_durations, 0.99);
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        println!(
            "  hits: {}; computed: {}; dropped: {}",
            outcomes.hits.load(Ordering::Relaxed),
            outcomes.computed.load(Ordering::Relaxed),
            outcomes.dropped.load(Ordering::Relaxed),
        );
        let stats = serde_yaml::to_string(&stats).context("failed to serialize loader stats")?;
        println!("  loader stats:");
        for line in stats.lines() {
            println!("    {line}");
        }
    }

    Ok(())
}

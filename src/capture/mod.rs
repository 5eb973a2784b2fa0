//! Live capture from many vantage points.
//!
//! The capture dispatcher pairs each configured vantage point with a worker
//! pool. When a proxy comes online its workers start draining that
//! location's URL queue, writing one capture file per URL; when it goes
//! offline the workers stop and the remaining queue waits for the proxy to
//! come back. The fetch contract is the same as the archive path's: every
//! outcome is recorded, including the failures.

pub mod format;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::proxy::{self, ProxyEvent, ProxySpec};
use crate::status;
use self::format::{write_capture, CaptureRecord};

/// Everything one fetch produced.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub final_url: String,
    pub coarse: String,
    pub detail: String,
    pub html: String,
    pub har_json: String,
}

/// The fetch seam. The production implementation drives plain HTTP; a
/// headless-browser implementation slots in here without touching the
/// dispatcher.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> CaptureOutcome;
}

/// Plain-HTTP fetcher with the full status taxonomy.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pagehist/", env!("CARGO_PKG_VERSION"), " (capture)"))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(20))
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> CaptureOutcome {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let reason = resp
                    .status()
                    .canonical_reason()
                    .unwrap_or_else(|| status::reason_phrase(code))
                    .to_string();
                let final_url = resp.url().to_string();
                let html = resp.text().await.unwrap_or_default();
                CaptureOutcome {
                    har_json: minimal_har(url, &final_url, Some(code)),
                    final_url,
                    coarse: status::coarse_result(code).to_string(),
                    detail: status::fine_result(code, &reason),
                    html,
                }
            }
            Err(e) => {
                let coarse = if e.is_timeout() {
                    status::TIMEOUT
                } else if e.is_redirect() {
                    "redirection loop"
                } else {
                    status::CRAWLER_FAILURE
                };
                CaptureOutcome {
                    final_url: url.to_string(),
                    coarse: coarse.to_string(),
                    detail: e.to_string(),
                    html: String::new(),
                    har_json: minimal_har(url, url, None),
                }
            }
        }
    }
}

fn minimal_har(url: &str, final_url: &str, code: Option<u16>) -> String {
    serde_json::json!({
        "log": {
            "version": "1.2",
            "creator": { "name": "pagehist", "version": env!("CARGO_PKG_VERSION") },
            "entries": [{
                "request": { "method": "GET", "url": url },
                "response": { "status": code.unwrap_or(0), "redirectURL": final_url },
            }],
        }
    })
    .to_string()
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub workers_per_location: usize,
    pub total_workers: Option<usize>,
    pub max_simultaneous_proxies: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            workers_per_location: 2,
            total_workers: None,
            max_simultaneous_proxies: None,
        }
    }
}

/// Capture one URL and write its file. Exposed separately so the worker
/// body is trivially testable.
pub async fn capture_one(
    fetcher: &dyn PageFetcher,
    url: &str,
    out_path: &Path,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let outcome = fetcher.fetch(url).await;
    let record = CaptureRecord {
        original_url: url.to_string(),
        final_url: outcome.final_url,
        coarse: outcome.coarse,
        detail: outcome.detail,
        elapsed: started.elapsed().as_secs_f64(),
        html: outcome.html,
        log: outcome.har_json,
    };

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(out_path)?;
    write_capture(&mut file, &record)?;
    Ok(())
}

type LocationQueue = Arc<Mutex<Vec<(usize, String)>>>;
type InFlight = Arc<Mutex<HashMap<usize, String>>>;

/// Run the whole capture job: bring proxies up, drain every location's URL
/// queue through its worker pool, write capture files under
/// `output_dir/<label>/`.
pub async fn run_capture(
    specs: Vec<ProxySpec>,
    urls: Vec<String>,
    output_dir: PathBuf,
    cfg: CaptureConfig,
    fetcher: Arc<dyn PageFetcher>,
) -> anyhow::Result<()> {
    if specs.is_empty() || urls.is_empty() {
        info!("nothing to do");
        return Ok(());
    }

    let n_active = cfg
        .max_simultaneous_proxies
        .unwrap_or(specs.len())
        .min(specs.len());
    if n_active < specs.len() {
        warn!(
            configured = specs.len(),
            active = n_active,
            "proxy count capped by --max-simultaneous-proxies"
        );
    }
    let active_specs = &specs[..n_active];

    // Namespaces are only needed for tunneled proxies.
    let needs_namespaces = active_specs
        .iter()
        .any(|s| !matches!(s.method, proxy::ProxyMethod::Direct));
    let mut ns_manager = if needs_namespaces {
        Some(proxy::NamespaceManager::start("cap", n_active).await?)
    } else {
        None
    };

    // One queue per location: every URL is captured from every vantage
    // point. The in-flight map holds claims so work lost to a proxy flap
    // can be re-queued.
    let mut queues: HashMap<String, LocationQueue> = HashMap::new();
    let mut in_flight: HashMap<String, InFlight> = HashMap::new();
    for spec in active_specs {
        let queue: Vec<(usize, String)> = urls.iter().cloned().enumerate().collect();
        queues.insert(spec.label.clone(), Arc::new(Mutex::new(queue)));
        in_flight.insert(spec.label.clone(), Arc::new(Mutex::new(HashMap::new())));
    }

    let (event_tx, mut event_rx) = mpsc::channel::<ProxyEvent>(n_active * 2);
    let mut supervisors = JoinSet::new();
    for (i, spec) in active_specs.iter().enumerate() {
        let namespace = ns_manager
            .as_ref()
            .map(|m| m.namespaces()[i].clone())
            .unwrap_or_default();
        supervisors.spawn(proxy::supervise(
            proxy::manager_for(spec),
            namespace,
            event_tx.clone(),
        ));
    }
    drop(event_tx);

    let total_slots = Arc::new(Semaphore::new(
        cfg.total_workers
            .unwrap_or(cfg.workers_per_location * n_active),
    ));

    let mut pools: HashMap<String, JoinSet<()>> = HashMap::new();
    loop {
        // Reap finished workers, then check for completion: every queue
        // drained, nothing claimed, nobody still working.
        let mut remaining = 0usize;
        for queue in queues.values() {
            remaining += queue.lock().await.len();
        }
        for claims in in_flight.values() {
            remaining += claims.lock().await.len();
        }
        for pool in pools.values_mut() {
            while pool.try_join_next().is_some() {}
        }
        let workers_busy = pools.values().any(|pool| !pool.is_empty());
        if remaining == 0 && !workers_busy {
            break;
        }

        let event = tokio::select! {
            event = event_rx.recv() => event,
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
        };
        let Some(event) = event else {
            // All supervisors gone; nothing more will come online.
            break;
        };

        match event {
            ProxyEvent::Online(label) => {
                debug!(label, "vantage point online, starting workers");
                let queue = Arc::clone(&queues[&label]);
                let claims = Arc::clone(&in_flight[&label]);
                let pool = pools.entry(label.clone()).or_default();
                for _ in 0..cfg.workers_per_location {
                    let queue = Arc::clone(&queue);
                    let claims = Arc::clone(&claims);
                    let fetcher = Arc::clone(&fetcher);
                    let slots = Arc::clone(&total_slots);
                    let out_base = output_dir.join(&label);
                    pool.spawn(async move {
                        loop {
                            let Ok(_permit) = slots.clone().acquire_owned().await else {
                                return;
                            };
                            let next = queue.lock().await.pop();
                            let Some((idx, url)) = next else { return };
                            claims.lock().await.insert(idx, url.clone());

                            let out_path = out_base.join(format!("{:06}.cap", idx));
                            if let Err(e) = capture_one(fetcher.as_ref(), &url, &out_path).await {
                                // Fetch failures are recorded as outcomes;
                                // an error here is local I/O. Skip the URL
                                // rather than spin on a full disk.
                                warn!(url, error = %e, "could not write capture file");
                            }
                            claims.lock().await.remove(&idx);
                        }
                    });
                }
            }
            ProxyEvent::Offline(label) => {
                debug!(label, "vantage point offline, stopping workers");
                if let Some(pool) = pools.get_mut(&label) {
                    pool.abort_all();
                }
                // Re-queue whatever the aborted workers had claimed.
                let mut claimed = in_flight[&label].lock().await;
                let mut queue = queues[&label].lock().await;
                for (idx, url) in claimed.drain() {
                    queue.push((idx, url));
                }
            }
        }
    }

    for pool in pools.values_mut() {
        pool.abort_all();
    }
    supervisors.abort_all();
    if let Some(manager) = ns_manager.as_mut() {
        manager.stop().await;
    }
    info!("capture complete");
    Ok(())
}

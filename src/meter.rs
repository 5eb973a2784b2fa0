//! Metered HTTP engine: rate-limited, bounded-concurrency, session-rotating.
//!
//! [`Meter::acquire`] is the single suspension point in front of every
//! outbound request. It resolves once the global request rate allows another
//! request *and* a concurrency slot is free, and hands back a guard holding
//! one HTTP session from a round-robin pool. Sessions age out
//! `session_timeout` seconds after first use; crashed sessions are discarded
//! instead of returned.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Cookie jar that can be emptied.
///
/// The archive echoes `Set-Cookie` on every response; because all requests go
/// to the same origin the cookies accumulate until the request headers exceed
/// the server's size limit. The archive never needs them back, so callers
/// clear the jar before each request. `reqwest::cookie::Jar` has no way to do
/// that, hence this minimal store.
#[derive(Debug, Default)]
pub struct ClearableJar {
    // host -> cookie name -> value
    cookies: StdMutex<HashMap<String, HashMap<String, String>>>,
}

impl ClearableJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every stored cookie.
    pub fn clear(&self) {
        self.cookies.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        self.cookies.lock().unwrap().values().map(HashMap::len).sum()
    }
}

impl CookieStore for ClearableJar {
    fn set_cookies(&self, headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let host = match url.host_str() {
            Some(h) => h.to_string(),
            None => return,
        };
        let mut jar = self.cookies.lock().unwrap();
        let entry = jar.entry(host).or_default();
        for header in headers {
            let Ok(s) = header.to_str() else { continue };
            // Only the name=value pair matters for replay; attributes are
            // irrelevant to a single-origin client.
            let pair = s.split(';').next().unwrap_or("");
            if let Some((name, value)) = pair.split_once('=') {
                entry.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let host = url.host_str()?;
        let jar = self.cookies.lock().unwrap();
        let entry = jar.get(host)?;
        if entry.is_empty() {
            return None;
        }
        let joined = entry
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }
}

/// Engine parameters; see the fields of [`crate::config::Settings`] for the
/// operational defaults.
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Requests per second across the whole pool.
    pub rate: f64,
    /// Maximum simultaneously held sessions.
    pub concurrency: usize,
    /// Deadline for all operations performed under one acquisition.
    pub query_timeout: Duration,
    /// TCP connect timeout per session.
    pub connect_timeout: Duration,
    /// Session lifetime from first use.
    pub session_timeout: Duration,
    /// User-Agent sent on every request.
    pub user_agent: String,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            rate: 30.0,
            concurrency: 5,
            query_timeout: Duration::from_secs(900),
            connect_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(1800),
            user_agent: concat!("pagehist/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// One pooled HTTP session.
struct Session {
    id: u64,
    client: reqwest::Client,
    jar: Arc<ClearableJar>,
    first_use: StdMutex<Option<Instant>>,
    requests: AtomicU64,
}

impl Session {
    fn expired(&self, lifetime: Duration) -> bool {
        match *self.first_use.lock().unwrap() {
            Some(t) => t.elapsed() >= lifetime,
            None => false,
        }
    }

    fn mark_used(&self) {
        let mut first = self.first_use.lock().unwrap();
        if first.is_none() {
            *first = Some(Instant::now());
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// The metered engine itself. Cheap to clone via [`Arc`].
pub struct Meter {
    config: MeterConfig,
    interval: Duration,
    slots: Arc<Semaphore>,
    last_tick: Mutex<Instant>,
    pool: StdMutex<VecDeque<Arc<Session>>>,
    next_session_id: AtomicU64,
}

impl Meter {
    pub fn new(config: MeterConfig) -> Arc<Self> {
        let interval = Duration::from_secs_f64(1.0 / config.rate);
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(config.concurrency)),
            last_tick: Mutex::new(Instant::now() - interval),
            pool: StdMutex::new(VecDeque::new()),
            next_session_id: AtomicU64::new(0),
            interval,
            config,
        })
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Wait for the rate tick and a free concurrency slot, then hand out a
    /// session.
    ///
    /// The returned guard releases the slot on drop and returns the session
    /// to the pool unless [`MeterGuard::discard`] was called.
    pub async fn acquire(self: &Arc<Self>) -> MeterGuard {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("meter semaphore closed");

        // Rate gate. Holding the lock across the sleep serializes waiters at
        // exactly one tick per interval.
        {
            let mut last = self.last_tick.lock().await;
            let target = *last + self.interval;
            let now = Instant::now();
            if now < target {
                tokio::time::sleep_until(target).await;
                *last = target;
            } else {
                *last = now;
            }
        }

        let session = self.checkout_session();
        session.mark_used();
        MeterGuard {
            meter: Arc::clone(self),
            session: Some(session),
            discarded: false,
            _permit: permit,
        }
    }

    fn checkout_session(self: &Arc<Self>) -> Arc<Session> {
        let mut pool = self.pool.lock().unwrap();
        while let Some(sess) = pool.pop_front() {
            if sess.expired(self.config.session_timeout) {
                debug!(session = sess.id, "retiring expired session");
                continue;
            }
            return sess;
        }
        drop(pool);
        self.make_session()
    }

    fn make_session(&self) -> Arc<Session> {
        let jar = Arc::new(ClearableJar::new());
        // One connection per session; parallelism comes from the pool, not
        // from concurrent streams. Redirects are handled manually by the
        // archive client, which must see every hop.
        let client = reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .cookie_provider(Arc::clone(&jar))
            .connect_timeout(self.config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(1)
            .build()
            .expect("failed to build HTTP client");

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "created HTTP session");
        Arc::new(Session {
            id,
            client,
            jar,
            first_use: StdMutex::new(None),
            requests: AtomicU64::new(0),
        })
    }

    fn return_session(&self, session: Arc<Session>) {
        if !session.expired(self.config.session_timeout) {
            self.pool.lock().unwrap().push_back(session);
        } else {
            debug!(session = session.id, "dropping expired session on release");
        }
    }
}

/// Scoped session acquisition. See [`Meter::acquire`].
pub struct MeterGuard {
    meter: Arc<Meter>,
    session: Option<Arc<Session>>,
    discarded: bool,
    _permit: OwnedSemaphorePermit,
}

impl MeterGuard {
    pub fn client(&self) -> &reqwest::Client {
        &self.session.as_ref().unwrap().client
    }

    /// Empty the session's cookie jar.
    pub fn clear_cookies(&self) {
        self.session.as_ref().unwrap().jar.clear();
    }

    /// Deadline covering everything done under this guard.
    pub fn query_timeout(&self) -> Duration {
        self.meter.config.query_timeout
    }

    /// Number of requests issued on this session so far, including this one.
    pub fn session_requests(&self) -> u64 {
        self.session.as_ref().unwrap().requests.load(Ordering::Relaxed)
    }

    /// Mark the session as broken: it will be dropped instead of pooled.
    pub fn discard(&mut self) {
        self.discarded = true;
    }
}

impl Drop for MeterGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.discarded {
                debug!(session = session.id, "discarding session");
            } else {
                self.meter.return_session(session);
            }
        }
    }
}

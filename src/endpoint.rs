//! `Endpoint` — the public facade (`spec.md` §4.4): URL/name/serialization
//! wiring, lazy pool initialization with background retry, availability
//! tracking driven by consecutive call failures, and a keepalive heartbeat
//! prober that can bring a degraded endpoint back.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{Codec, Exception, Request, Response, RpcContext, SerializerRegistry};
use crate::config::MotanUrl;
use crate::error::{Error, Result};
use crate::pool::ChannelPool;

const ENDPOINT_NAME: &str = "motanEndpoint";
const DEFAULT_POOL_CAPACITY: usize = 3;
const DEFAULT_FAILURE_THRESHOLD: u32 = 10;
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_INIT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide immutable placeholder returned for asynchronous calls: a
/// single shared value rather than one allocation per call, analogous to
/// the Go source's shared `defaultAsyncResponse` sentinel.
fn default_async_response() -> &'static Response {
    static RESPONSE: OnceLock<Response> = OnceLock::new();
    RESPONSE.get_or_init(|| Response {
        request_id: 0,
        value: None,
        exception: None,
        processing_time_ms: 0,
    })
}

/// The outcome of `Endpoint::call`. A synchronous request resolves to its
/// real `Response`; an asynchronous one resolves immediately to the shared
/// placeholder plus a receiver the caller can await separately once the
/// reply actually lands.
pub enum CallOutcome {
    Sync(Response),
    Async {
        placeholder: Response,
        result: oneshot::Receiver<Response>,
    },
}

pub struct Endpoint {
    url: RwLock<Option<MotanUrl>>,
    pool: RwLock<Option<Arc<ChannelPool>>>,
    available: RwLock<bool>,
    codec: Arc<dyn Codec>,
    extension_factory: RwLock<Arc<SerializerRegistry>>,
    proxy: AtomicBool,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
    destroyed: AtomicBool,
    keepalive_counter: AtomicU64,
    init_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    /// A weak handle back to this endpoint's own `Arc`, so the edge-triggered
    /// keepalive prober can be spawned from `&self`-taking code paths
    /// (`call`, `probe_once`) that don't otherwise have one. Set once in
    /// `new` and never reassigned.
    self_ref: OnceLock<Weak<Endpoint>>,
}

impl Endpoint {
    pub fn new(codec: Arc<dyn Codec>) -> Arc<Endpoint> {
        let endpoint = Arc::new(Endpoint {
            url: RwLock::new(None),
            pool: RwLock::new(None),
            available: RwLock::new(false),
            codec,
            extension_factory: RwLock::new(Arc::new(SerializerRegistry::with_defaults())),
            proxy: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            destroyed: AtomicBool::new(false),
            keepalive_counter: AtomicU64::new(0),
            init_task: Mutex::new(None),
            keepalive_task: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = endpoint.self_ref.set(Arc::downgrade(&endpoint));
        endpoint
    }

    pub fn name(&self) -> &'static str {
        ENDPOINT_NAME
    }

    pub fn set_url(&self, url: MotanUrl) {
        *self.url.write() = Some(url);
    }

    pub fn url(&self) -> Option<MotanUrl> {
        self.url.read().clone()
    }

    pub fn set_serialization(&self, registry: Arc<SerializerRegistry>) {
        *self.extension_factory.write() = registry;
    }

    pub fn set_proxy(&self, proxy: bool) {
        self.proxy.store(proxy, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        *self.available.read()
    }

    /// Attempts to build the channel pool synchronously; if that fails,
    /// leaves the endpoint unavailable and starts a background task that
    /// retries every 60 seconds until it succeeds or the endpoint is
    /// destroyed. A successful build does *not* start the keepalive prober
    /// by itself — per `spec.md` §4.4 that's an edge-triggered response to
    /// consecutive call failures crossing the threshold, not an
    /// always-on background task (see `record_failure`).
    pub async fn initialize(self: &Arc<Self>, url: MotanUrl) {
        self.set_url(url.clone());
        if self.try_build_pool(&url).await.is_ok() {
            return;
        }
        self.spawn_init_retry(url);
    }

    async fn try_build_pool(&self, url: &MotanUrl) -> Result<()> {
        let addr = format!("{}:{}", url.host(), url.port());
        let pool = ChannelPool::new(addr, self.codec.clone(), DEFAULT_POOL_CAPACITY, url.connect_timeout()).await?;
        *self.pool.write() = Some(Arc::new(pool));
        self.set_available(true);
        Ok(())
    }

    fn spawn_init_retry(self: &Arc<Self>, url: MotanUrl) {
        let endpoint = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_INIT_RETRY_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it, we already tried once
            loop {
                ticker.tick().await;
                if endpoint.destroyed.load(Ordering::SeqCst) {
                    return;
                }
                if endpoint.try_build_pool(&url).await.is_ok() {
                    return;
                }
            }
        });
        *self.init_task.lock() = Some(handle);
    }

    /// Spawns the keepalive prober: a 10s-interval loop that probes the
    /// remote with a heartbeat `Call` until one succeeds (which also resets
    /// the failure counter and restores availability) or the endpoint is
    /// destroyed. Only ever called from the edge-triggered path in
    /// `record_failure`, so at most one keepalive task is ever in flight per
    /// degradation episode.
    fn spawn_keepalive(self: &Arc<Self>) {
        let endpoint = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_KEEPALIVE_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it, first probe should wait a full interval
            loop {
                ticker.tick().await;
                if endpoint.destroyed.load(Ordering::SeqCst) {
                    return;
                }
                if endpoint.probe_once().await {
                    return;
                }
            }
        });
        *self.keepalive_task.lock() = Some(handle);
    }

    /// Runs one heartbeat probe. Returns `true` if it succeeded (in which
    /// case the keepalive loop should terminate), `false` if it should keep
    /// ticking. A failed probe does *not* count against the consecutive-
    /// failure threshold — that threshold is driven by `Endpoint::call`
    /// failures, not by the prober's own liveness checks.
    async fn probe_once(&self) -> bool {
        let Some(pool) = self.pool.read().clone() else {
            return false;
        };
        let deadline = Instant::now() + self.request_timeout();
        let outcome = match pool.get(deadline).await {
            Ok(channel) => {
                let keepalive_id = self.keepalive_counter.fetch_add(1, Ordering::SeqCst) + 1;
                let ctx = RpcContext::sync(self.extension_factory.read().clone(), false, 0);
                channel.heartbeat(keepalive_id, ctx, deadline).await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(_) => {
                self.record_success();
                true
            }
            Err(_) => false,
        }
    }

    fn request_timeout(&self) -> Duration {
        self.url.read().as_ref().map(|u| u.request_timeout()).unwrap_or(Duration::from_millis(1000))
    }

    /// Increments the consecutive-failure counter and, exactly on the tick
    /// where it crosses from `threshold - 1` to `threshold`, flips
    /// availability off and spawns the keepalive prober (`spec.md` §4.4/§8:
    /// "edge-triggered unavailability"). `fetch_add` hands back the
    /// pre-increment value, so only the single call that observes
    /// `previous + 1 == threshold` takes this branch — concurrent callers
    /// racing past the threshold each see a distinct `previous`, so exactly
    /// one of them spawns the prober.
    fn record_failure(&self) {
        let previous = self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        if previous + 1 == self.failure_threshold {
            self.set_available(false);
            if let Some(endpoint) = self.self_ref.get().and_then(Weak::upgrade) {
                endpoint.spawn_keepalive();
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.set_available(true);
    }

    fn set_available(&self, value: bool) {
        let mut guard = self.available.write();
        if *guard != value {
            *guard = value;
            log::info!("{} availability changed to {value}", ENDPOINT_NAME);
        }
    }

    /// If the request's `group` attachment disagrees with the endpoint's
    /// configured URL group and the URL group is non-empty, overwrite the
    /// attachment (`spec.md` §4.4) so the wire request always reflects the
    /// group this endpoint is actually configured against.
    fn apply_group_override(&self, request: &mut Request) {
        let Some(group) = self.url.read().as_ref().and_then(|u| u.group().map(str::to_string)) else {
            return;
        };
        if group.is_empty() {
            return;
        }
        if request.attachments.get("group").map(String::as_str) != Some(group.as_str()) {
            request.attachments.insert("group".to_string(), group);
        }
    }

    fn gzip_size(&self) -> i64 {
        self.url.read().as_ref().map(|u| u.gzip_size()).unwrap_or(0)
    }

    /// Runs one call against the endpoint. `spec.md` §6/§8: `Call` never
    /// throws — every path below resolves to a `CallOutcome`, with transport
    /// and timeout failures counted against the consecutive-failure
    /// threshold and surfaced as a code-400 exception response, and encode
    /// failures surfaced as an uncounted code-500 exception response.
    pub async fn call(&self, mut request: Request) -> CallOutcome {
        self.apply_group_override(&mut request);
        let request_id = request.request_id;

        let Some(pool) = self.pool.read().clone() else {
            self.record_failure();
            return CallOutcome::Sync(Response::error(request_id, Exception::transport_failure("pool is not ready")));
        };

        let deadline = Instant::now() + self.request_timeout();
        let channel = match pool.get(deadline).await {
            Ok(channel) => channel,
            Err(e) => {
                self.record_failure();
                return CallOutcome::Sync(Response::error(request_id, Exception::transport_failure(e.to_string())));
            }
        };

        let proxy = self.proxy.load(Ordering::SeqCst);
        let extension_factory = self.extension_factory.read().clone();
        let gzip_size = self.gzip_size();

        if request.async_call {
            let (ctx, result) = RpcContext::async_with_done(extension_factory, proxy, gzip_size);
            match channel.call(&request, ctx, deadline).await {
                Ok(_) => {
                    self.record_success();
                    CallOutcome::Async {
                        placeholder: default_async_response().clone(),
                        result,
                    }
                }
                Err(e) => self.call_error_outcome(request_id, e),
            }
        } else {
            let ctx = RpcContext::sync(extension_factory.clone(), proxy, gzip_size);
            let call_start = Instant::now();
            match channel.call(&request, ctx, deadline).await {
                Ok(Some(mut message)) => {
                    self.record_success();
                    message.header.proxy = proxy;
                    let serializer = extension_factory.get(message.header.serialize_type);
                    let raw_body = std::mem::take(&mut message.body);
                    let mut response = message.into_response();
                    match serializer {
                        Some(serializer) => {
                            if let Err(e) = response.deserialize_reply(&*serializer, &raw_body) {
                                response.exception = Some(Exception::server_exception(e.to_string()));
                            }
                        }
                        None => {
                            response.exception = Some(Exception::server_exception("no serializer registered"));
                        }
                    }
                    response.processing_time_ms = call_start.elapsed().as_millis() as u64;
                    CallOutcome::Sync(response)
                }
                Ok(None) => unreachable!("synchronous call never returns Ok(None)"),
                Err(e) => self.call_error_outcome(request_id, e),
            }
        }
    }

    /// Converts a `Channel::call` failure into the error-response shapes
    /// `spec.md` §6/§7 specifies: an encode failure short-circuits to an
    /// uncounted code-500 exception, everything else counts against the
    /// consecutive-failure threshold and surfaces as a code-400 exception.
    fn call_error_outcome(&self, request_id: u64, e: Error) -> CallOutcome {
        if e.counts_as_connectivity_failure() {
            self.record_failure();
            CallOutcome::Sync(Response::error(request_id, Exception::transport_failure(e.to_string())))
        } else {
            CallOutcome::Sync(Response::error(request_id, Exception::server_exception(e.to_string())))
        }
    }

    /// Idempotent teardown: flips availability off, aborts any background
    /// init-retry and keepalive tasks, and closes the pool.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_available(false);
        if let Some(task) = self.init_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
        if let Some(pool) = self.pool.write().take() {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthPrefixedCodec;

    fn endpoint_with_url(group: Option<&str>) -> Arc<Endpoint> {
        let codec: Arc<dyn Codec> = Arc::new(LengthPrefixedCodec);
        let endpoint = Endpoint::new(codec);
        let mut url = MotanUrl::new("127.0.0.1", 0);
        if let Some(group) = group {
            url = url.with_group(group);
        }
        endpoint.set_url(url);
        endpoint
    }

    #[test]
    fn group_override_rewrites_a_disagreeing_attachment() {
        let endpoint = endpoint_with_url(Some("motan-demo-rpc"));
        let mut request = Request {
            attachments: [("group".to_string(), "some-other-group".to_string())].into(),
            ..Default::default()
        };
        endpoint.apply_group_override(&mut request);
        assert_eq!(request.attachments.get("group").map(String::as_str), Some("motan-demo-rpc"));
    }

    #[test]
    fn group_override_is_a_no_op_when_url_group_is_absent() {
        let endpoint = endpoint_with_url(None);
        let mut request = Request {
            attachments: [("group".to_string(), "caller-group".to_string())].into(),
            ..Default::default()
        };
        endpoint.apply_group_override(&mut request);
        assert_eq!(request.attachments.get("group").map(String::as_str), Some("caller-group"));
    }

    #[test]
    fn group_override_leaves_an_already_agreeing_attachment_untouched() {
        let endpoint = endpoint_with_url(Some("motan-demo-rpc"));
        let mut request = Request {
            attachments: [("group".to_string(), "motan-demo-rpc".to_string())].into(),
            ..Default::default()
        };
        endpoint.apply_group_override(&mut request);
        assert_eq!(request.attachments.get("group").map(String::as_str), Some("motan-demo-rpc"));
    }
}

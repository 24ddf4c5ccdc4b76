use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use reqwest::{
    header::{self, HeaderName, HeaderValue},
    Response, StatusCode, Url,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{interval_at, sleep, timeout, Instant, MissedTickBehavior},
};

use crate::{
    queue::RequestQueue,
    request::{FailedRequestRecord, QueueStatus, QueuedRequest, RequestConfig},
    session::{Session, SessionEvent},
    state::{RequestEvent, RequestState},
    storage::Storage,
    FetchError, HandlerOptions, Result,
};

const SESSION_EVENT_CAPACITY: usize = 16;

/// Fetch-compatible request layer with retry, offline queue and durable
/// persistence of pending mutations.
///
/// Cloning is cheap; clones share one queue. Call [`RequestHandler::start`]
/// inside a tokio runtime to load persisted requests and run the background
/// queue processor, and [`RequestHandler::stop`] to cancel it.
#[derive(Clone)]
pub struct RequestHandler {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    options: HandlerOptions,
    storage: Arc<dyn Storage>,
    session: Session,
    queue: Mutex<RequestQueue>,
    online: watch::Sender<bool>,
    session_events: broadcast::Sender<SessionEvent>,
    draining: tokio::sync::Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("options", &self.inner.options)
            .field("online", &self.is_online())
            .field("pending", &self.inner.queue.lock().len())
            .field("session", &self.inner.session)
            .finish()
    }
}

impl RequestHandler {
    /// Creates a handler persisting to `storage` with default options.
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self::build(
            Arc::new(storage),
            reqwest::Client::new(),
            HandlerOptions::default(),
        )
    }

    /// Creates a handler from [`HandlerOptions::from_env`].
    pub fn from_env(storage: impl Storage + 'static) -> std::result::Result<Self, String> {
        Ok(Self::new(storage).with_options(HandlerOptions::from_env()?))
    }

    fn build(storage: Arc<dyn Storage>, http: reqwest::Client, options: HandlerOptions) -> Self {
        let (online, _) = watch::channel(true);
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                http,
                session: Session::new(Arc::clone(&storage)),
                queue: Mutex::new(RequestQueue::new(
                    Arc::clone(&storage),
                    options.failed_capacity,
                )),
                storage,
                options,
                online,
                session_events,
                draining: tokio::sync::Mutex::new(()),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Applies timeout, retry and queue options. Call before
    /// [`start`](Self::start) and before cloning.
    ///
    /// Queued requests and session subscribers are kept. A handler that is
    /// already shared with a clone or a running processor is left unchanged
    /// and a warning is logged.
    pub fn with_options(self, options: HandlerOptions) -> Self {
        self.configure(|inner| {
            inner
                .queue
                .get_mut()
                .set_failed_capacity(options.failed_capacity);
            inner.options = options;
        })
    }

    /// Uses a preconfigured `reqwest` client. Same rules as
    /// [`with_options`](Self::with_options).
    pub fn with_http_client(self, http: reqwest::Client) -> Self {
        self.configure(|inner| inner.http = http)
    }

    fn configure(mut self, apply: impl FnOnce(&mut Inner)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => apply(inner),
            None => tracing::warn!("handler is already shared; configuration ignored"),
        }
        self
    }

    /// Options the handler was configured with.
    pub fn options(&self) -> &HandlerOptions {
        &self.inner.options
    }

    /// Credential store shared with the login flow.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Receives [`SessionEvent::LoginRequired`] whenever a request comes back 401.
    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_events.subscribe()
    }

    /// Loads persisted requests, clears their durable copy and spawns the
    /// background queue processor. Drains immediately when online.
    ///
    /// Calling `start` on a running handler does nothing.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(&self) {
        let runtime = tokio::runtime::Handle::current();
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return;
        }

        self.inner.queue.lock().load_persisted();

        let online = self.inner.online.subscribe();
        let interval = self.inner.options.queue_interval();
        let inner = Arc::downgrade(&self.inner);
        *worker = Some(runtime.spawn(run_processor(inner, online, interval)));
    }

    /// Cancels the background queue processor. Queued requests stay in
    /// memory and in storage.
    pub fn stop(&self) {
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.abort();
            tracing::debug!("queue processor stopped");
        }
    }

    /// Whether the background queue processor is alive.
    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Connectivity came back; drains the queue right away.
    pub fn went_online(&self) {
        let changed = self.inner.online.send_if_modified(|online| {
            let changed = !*online;
            *online = true;
            changed
        });
        if changed {
            tracing::info!(
                queue_len = self.inner.queue.lock().len(),
                "network connection restored"
            );
        }
    }

    /// Connectivity was lost; the processor stops draining. In-flight
    /// attempts are not cancelled.
    pub fn went_offline(&self) {
        let changed = self.inner.online.send_if_modified(|online| {
            let changed = *online;
            *online = false;
            changed
        });
        if changed {
            tracing::warn!("network connection lost");
        }
    }

    /// Last connectivity state reported through `went_online`/`went_offline`.
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Sends a request with timeout and in-line retries.
    ///
    /// Responses other than 401, 429 and 5xx are returned as-is. After the
    /// retry budget is spent on transient failures the request is queued
    /// (and persisted when its method is POST, PUT or DELETE) for background
    /// retry, and the causing error is returned.
    pub async fn fetch(&self, url: &str, options: RequestConfig) -> Result<Response> {
        let mut request = QueuedRequest::new(url, options);

        match self.inner.execute(&mut request, false).await {
            Ok(response) => Ok(response),
            Err(err) => {
                tracing::error!(url, error = %err, "request failed");
                if err.is_retryable() {
                    self.inner.enqueue(request);
                }
                Err(err)
            }
        }
    }

    /// Attempts the head-of-queue request once through the retry algorithm.
    ///
    /// Runs regardless of connectivity; the background processor only calls
    /// it while online. Returns immediately if another drain is in flight.
    pub async fn process_queue(&self) {
        self.inner.process_queue().await;
    }

    /// Snapshot of the active queue and connectivity.
    pub fn queue_status(&self) -> QueueStatus {
        let queue = self.inner.queue.lock();
        QueueStatus {
            pending: queue.len(),
            is_online: self.is_online(),
            requests: queue.statuses(),
        }
    }

    /// Requests that exhausted their retries, oldest first.
    pub fn failed_requests(&self) -> Vec<FailedRequestRecord> {
        self.inner.queue.lock().failed()
    }

    /// Empties the failure archive.
    pub fn clear_failed_requests(&self) {
        self.inner.queue.lock().clear_failed();
    }
}

async fn run_processor(inner: Weak<Inner>, mut online: watch::Receiver<bool>, every: Duration) {
    if let Some(inner) = inner.upgrade() {
        let is_online = *online.borrow_and_update();
        if is_online {
            inner.process_queue().await;
        }
    }

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let went_online = tokio::select! {
            _ = ticker.tick() => false,
            changed = online.changed() => {
                if changed.is_err() {
                    return;
                }
                true
            }
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let is_online = *online.borrow_and_update();
        if is_online && (went_online || inner.has_pending()) {
            inner.process_queue().await;
        }
    }
}

impl Inner {
    fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    fn enqueue(&self, request: QueuedRequest) {
        self.queue.lock().push(request);
    }

    fn dequeue(&self, request: &QueuedRequest) -> Option<QueuedRequest> {
        self.queue.lock().remove(&request.id)
    }

    fn record_retries(&self, request: &QueuedRequest) {
        self.queue
            .lock()
            .record_retries(&request.id, request.retry_count);
    }

    async fn process_queue(&self) {
        let Ok(_guard) = self.draining.try_lock() else {
            tracing::debug!("queue drain already in progress");
            return;
        };

        let (head, pending) = {
            let queue = self.queue.lock();
            (queue.front(), queue.len())
        };
        let Some(mut request) = head else {
            return;
        };

        tracing::info!(pending, "processing request queue");

        let err = match self.execute(&mut request, true).await {
            Ok(_) => return,
            Err(err) => err,
        };
        tracing::warn!(id = %request.id, error = %err, "failed to process queued request");

        let event = self.classify(&Err(err), request.retry_count);
        let next = RequestState::Queued.on(event);
        if matches!(next, RequestState::Archived | RequestState::Rejected)
            && self.dequeue(&request).is_some()
        {
            self.queue.lock().archive(request);
        }
    }

    /// Runs attempts for `request` until it succeeds, is rejected, or its
    /// retry budget is spent. `retry_count` is advanced in place.
    async fn execute(&self, request: &mut QueuedRequest, is_retry: bool) -> Result<Response> {
        let mut state = RequestState::Attempting;
        loop {
            tracing::debug!(
                url = %request.url,
                id = %request.id,
                attempt = request.retry_count + 1,
                retry = is_retry || request.retry_count > 0,
                "executing request"
            );

            let outcome = self.attempt(request).await;
            state = state.on(self.classify(&outcome, request.retry_count));
            match state {
                RequestState::Succeeded => {
                    self.dequeue(request);
                    return outcome;
                }
                RequestState::Backoff => {
                    let delay = self.options.backoff_delay(request.retry_count);
                    request.retry_count += 1;
                    self.record_retries(request);

                    tracing::debug!(
                        url = %request.url,
                        delay_ms = delay.as_millis() as u64,
                        "will retry after backoff"
                    );
                    sleep(delay).await;
                    state = state.on(RequestEvent::BackoffElapsed);
                }
                _ => return outcome,
            }
        }
    }

    fn classify(&self, outcome: &Result<Response>, retry_count: u32) -> RequestEvent {
        match outcome {
            Ok(_) => RequestEvent::AttemptSucceeded,
            Err(err) => {
                let kind = err.kind();
                if kind.is_retryable() && retry_count >= self.options.max_retries {
                    RequestEvent::RetryBudgetExhausted
                } else {
                    RequestEvent::AttemptFailed(kind)
                }
            }
        }
    }

    /// One network call bounded by the configured timeout. Requests that
    /// cannot be built fail with [`FetchError::InvalidRequest`], which the
    /// retry loop handles like any other transport failure.
    async fn attempt(&self, request: &QueuedRequest) -> Result<Response> {
        let url = self.resolve_url(&request.url)?;
        let method = request.options.http_method()?;

        let mut builder = self.http.request(method, url);
        for (name, value) in &request.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidRequest(format!("invalid header name '{name}'")))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                FetchError::InvalidRequest(format!("invalid value for header '{}'", name.as_str()))
            })?;
            builder = builder.header(name, value);
        }

        if self.options.attach_bearer_token && !request.options.has_header("authorization") {
            match self.session.authorization() {
                Ok(Some(authorization)) => {
                    builder = builder.header(header::AUTHORIZATION, authorization);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "failed to read session token"),
            }
        }

        if let Some(body) = &request.options.body {
            builder = builder.body(body.clone());
        }

        let response = match timeout(self.options.timeout(), builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(FetchError::Transport(err)),
            Err(_) => {
                return Err(FetchError::Timeout {
                    url: request.url.clone(),
                    timeout_ms: self.options.timeout_ms,
                })
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.handle_unauthorized();
            return Err(FetchError::Unauthorized);
        }
        if status.as_u16() >= 500 {
            return Err(FetchError::Server {
                status: status.as_u16(),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited);
        }

        Ok(response)
    }

    fn resolve_url(&self, raw: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(raw) {
            return Ok(url);
        }
        let base = self.options.base_url.as_deref().ok_or_else(|| {
            FetchError::InvalidRequest(format!("relative url '{raw}' requires a base url"))
        })?;
        Url::parse(base)
            .and_then(|base| base.join(raw))
            .map_err(|err| FetchError::InvalidRequest(format!("invalid url '{raw}': {err}")))
    }

    fn handle_unauthorized(&self) {
        tracing::info!(login_url = %self.options.login_url, "unauthorized, redirecting to login");
        if let Err(err) = self.session.clear() {
            tracing::warn!(error = %err, "failed to clear session token");
        }
        // Err only means nobody subscribed.
        let _ = self.session_events.send(SessionEvent::LoginRequired {
            login_url: self.options.login_url.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::RequestHandler;
    use crate::{FetchError, HandlerOptions, MemoryStorage, SessionEvent};

    fn handler(base_url: Option<&str>) -> RequestHandler {
        RequestHandler::new(MemoryStorage::new()).with_options(HandlerOptions {
            base_url: base_url.map(str::to_owned),
            ..HandlerOptions::default()
        })
    }

    #[test]
    fn relative_paths_join_base_url() {
        let handler = handler(Some("http://admin.local/app/"));
        let url = handler
            .inner
            .resolve_url("/projects/create/project")
            .expect("resolvable");
        assert_eq!(url.as_str(), "http://admin.local/projects/create/project");
    }

    #[test]
    fn absolute_urls_ignore_base() {
        let handler = handler(Some("http://admin.local"));
        let url = handler
            .inner
            .resolve_url("https://api.example.com/health")
            .expect("resolvable");
        assert_eq!(url.as_str(), "https://api.example.com/health");
    }

    #[test]
    fn relative_path_without_base_is_a_retryable_failure() {
        let err = handler(None)
            .inner
            .resolve_url("/redirects")
            .expect_err("needs base");
        assert!(matches!(err, FetchError::InvalidRequest(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn connectivity_transitions_are_tracked() {
        let handler = handler(None);
        assert!(handler.is_online());
        handler.went_offline();
        assert!(!handler.is_online());
        assert!(!handler.queue_status().is_online);
        handler.went_online();
        assert!(handler.is_online());
    }

    #[test]
    fn debug_redacts_session() {
        let handler = handler(None);
        handler.session().set_token("secret-token").expect("set");
        let debug = format!("{handler:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn with_options_keeps_session_subscribers() {
        let handler = RequestHandler::new(MemoryStorage::new());
        let mut events = handler.subscribe_session();
        let handler = handler.with_options(HandlerOptions {
            login_url: "/signin".to_owned(),
            ..HandlerOptions::default()
        });

        handler.inner.handle_unauthorized();

        assert_eq!(
            events.try_recv().expect("login event"),
            SessionEvent::LoginRequired {
                login_url: "/signin".to_owned()
            }
        );
    }

    #[test]
    fn with_options_leaves_a_shared_handler_untouched() {
        let handler = RequestHandler::new(MemoryStorage::new());
        let clone = handler.clone();

        let handler = handler.with_options(HandlerOptions {
            max_retries: 9,
            ..HandlerOptions::default()
        });

        assert_eq!(handler.options().max_retries, 3);
        assert!(Arc::ptr_eq(&handler.inner, &clone.inner));
    }

    #[test]
    #[should_panic]
    fn start_outside_a_runtime_panics() {
        handler(None).start();
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fleet_proto::{ParseFailure, ParseOutput, ParseTask, StatusEvent};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::broker::{publish_json, Broker, Message, MessageHandler};
use crate::config::StoreConfig;
use crate::crawler::CrawlerRegistry;
use crate::error::{Error, Result};
use crate::host_lock::deadline_after;
use crate::ns::topics;

/// Budget of a store, split between the broker fed lane and direct callers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Concurrency {
    pub max: i64,
    pub max_mq: i64,
    pub current: i64,
    pub current_mq: i64,
}

impl Concurrency {
    /// Slots kept for direct callers.
    pub fn reserved(&self) -> i64 {
        self.max - self.max_mq
    }

    /// Slots taken by direct callers.
    pub fn used(&self) -> i64 {
        self.current - self.current_mq
    }
}

#[derive(Debug, Default)]
struct Lanes {
    budget: Concurrency,
    /// Direct callers waiting for admission, each one takes a slot away
    /// from the queue lane when it starts waiting.
    waiting: i64,
}

impl Lanes {
    fn recompute(&mut self) {
        let b = &mut self.budget;
        b.max_mq = (b.max - b.used() - self.waiting).max(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Queue,
    Direct,
}

/// Counts of what a crawler returned for one task.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseSummary {
    pub items: usize,
    pub requests: usize,
    /// Explicit error from the crawler, or the lack of any result
    pub error: Option<String>,
}

impl ParseSummary {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

enum Sink<'a> {
    Callback(&'a mut (dyn FnMut(ParseOutput) + Send)),
    Broker,
}

/// Admission control and adaptive concurrency of a single store.
pub struct StoreHandler {
    store_id: String,
    config: StoreConfig,
    crawlers: Arc<CrawlerRegistry>,
    broker: Arc<dyn Broker>,
    lanes: Mutex<Lanes>,
    in_flight: watch::Sender<usize>,
    successes: AtomicU64,
    errors: AtomicU64,
}

impl StoreHandler {
    /// A disarmed handler, nothing gets admitted until it is armed.
    pub fn new(
        store_id: &str,
        config: StoreConfig,
        crawlers: Arc<CrawlerRegistry>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            store_id: store_id.to_string(),
            config,
            crawlers,
            broker,
            lanes: Mutex::new(Lanes::default()),
            in_flight,
            successes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recomputes the queue lane and pushes its limit to the consumer.
    fn settle(&self, lanes: &mut Lanes) {
        lanes.recompute();
        let limit = lanes.budget.max_mq.max(0) as usize;
        self.in_flight.send_if_modified(|current| {
            let changed = *current != limit;
            *current = limit;
            changed
        });
    }

    pub fn concurrency(&self) -> Concurrency {
        self.lanes().budget
    }

    /// Watches the in-flight limit the broker consumer should run with.
    pub fn in_flight_limit(&self) -> watch::Receiver<usize> {
        self.in_flight.subscribe()
    }

    pub fn set_concurrency(&self, max: i64) -> Concurrency {
        let mut lanes = self.lanes();
        lanes.budget.max = max.clamp(0, self.config.max_concurrency);
        self.settle(&mut lanes);
        lanes.budget
    }

    /// Arms a disarmed handler to the default concurrency.
    pub fn arm(&self) -> bool {
        let mut lanes = self.lanes();
        if lanes.budget.max > 0 {
            return false;
        }
        lanes.budget.max = self.config.default_concurrency;
        self.settle(&mut lanes);
        log::info!(
            "Store {} armed with concurrency {}",
            self.store_id,
            lanes.budget.max
        );
        true
    }

    pub fn disarm(&self) -> bool {
        let mut lanes = self.lanes();
        if lanes.budget.max == 0 {
            return false;
        }
        lanes.budget.max = 0;
        self.settle(&mut lanes);
        log::info!("Store {} disarmed", self.store_id);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.lanes().budget.max > 0
    }

    fn record(&self, success: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Closes a feedback window and retunes the store from its success rate.
    pub fn adjust(&self) -> Concurrency {
        let successes = self.successes.swap(0, Ordering::SeqCst) as i64;
        let errors = self.errors.swap(0, Ordering::SeqCst) as i64;
        let sample = successes + errors;
        let default = self.config.default_concurrency;
        let ceiling = self.config.max_concurrency;

        let mut lanes = self.lanes();
        let max = lanes.budget.max;
        if max == 0 {
            return lanes.budget;
        }

        let next = if sample <= 2 * default && max > default {
            default
        } else if sample == 0 {
            max
        } else {
            let rate = successes as f64 / sample as f64;
            if rate > 0.9 && max < ceiling {
                max + 1
            } else if successes == 0 {
                (max - 2).max(1)
            } else if rate < 0.4 && max > default {
                max - 1
            } else {
                max
            }
        };

        if next != max {
            log::info!(
                "Store {} concurrency {max} -> {next} ({successes}/{sample} succeeded)",
                self.store_id
            );
        }
        lanes.budget.max = next;
        self.settle(&mut lanes);
        lanes.budget
    }

    /// Lends the queue lane one more slot while it is saturated and the
    /// store has room.
    pub fn reclaim(&self) -> bool {
        let mut lanes = self.lanes();
        let b = lanes.budget;
        if lanes.waiting > 0 || b.max_mq >= b.max || b.current_mq < b.max_mq || b.current >= b.max {
            return false;
        }
        lanes.budget.max_mq += 1;
        let limit = lanes.budget.max_mq as usize;
        self.in_flight.send_replace(limit);
        true
    }

    fn try_admit_queue(&self) -> Option<Slot<'_>> {
        let mut lanes = self.lanes();
        let b = lanes.budget;
        if b.current_mq >= b.max_mq || b.current >= b.max {
            return None;
        }
        lanes.budget.current_mq += 1;
        lanes.budget.current += 1;
        Some(Slot {
            handler: self,
            lane: Lane::Queue,
        })
    }

    async fn admit_direct(&self, deadline: Instant) -> Result<Slot<'_>> {
        let mut waiting = Waiting::register(self);
        loop {
            if let Some(slot) = waiting.try_admit()? {
                return Ok(slot);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeadlineExceeded(format!(
                    "No capacity for store {} before the deadline",
                    self.store_id
                )));
            }
            sleep(self.config.admission_poll().min(deadline - now)).await;
        }
    }

    /// A slot freed by a direct caller stays reserved for direct callers,
    /// the reclaim loop hands it back to the queue lane.
    fn release(&self, lane: Lane) {
        let mut lanes = self.lanes();
        lanes.budget.current -= 1;
        if lane == Lane::Queue {
            lanes.budget.current_mq -= 1;
        }
    }

    /// Parses `task` on behalf of a direct caller, handing every output to
    /// `callback`.
    pub async fn parse<F>(&self, deadline: Instant, task: &ParseTask, mut callback: F) -> Result<ParseSummary>
    where
        F: FnMut(ParseOutput) + Send,
    {
        if !self.is_armed() {
            return Err(Error::Unavailable(format!(
                "Store {} takes no work",
                self.store_id
            )));
        }
        let slot = self.admit_direct(deadline).await?;
        let res = self
            .parse_until(deadline, task, Sink::Callback(&mut callback))
            .await;
        drop(slot);
        self.record(matches!(&res, Ok(summary) if summary.is_success()));
        res
    }

    async fn parse_until(&self, deadline: Instant, task: &ParseTask, sink: Sink<'_>) -> Result<ParseSummary> {
        match timeout_at(deadline, self.run_parse(task, sink)).await {
            Ok(res) => res,
            Err(_) => Err(Error::DeadlineExceeded(format!(
                "Parsing request {} outlived its deadline",
                task.request.id
            ))),
        }
    }

    async fn run_parse(&self, task: &ParseTask, mut sink: Sink<'_>) -> Result<ParseSummary> {
        let handle = self.crawlers.pick(&self.store_id).await?;
        let mut outputs = handle.client.parse(task).await.map_err(|e| {
            Error::Unavailable(format!("Crawler {} failed to parse: {e}", handle.crawler.id))
        })?;

        let mut summary = ParseSummary::default();
        while let Some(output) = outputs.next().await {
            let output = output?;
            match &output {
                ParseOutput::Item(_) => summary.items += 1,
                ParseOutput::Request(_) => summary.requests += 1,
                ParseOutput::Error(failure) => summary.error = Some(failure.message.clone()),
            }
            match &mut sink {
                Sink::Callback(callback) => callback(output),
                Sink::Broker => self.forward(output).await?,
            }
        }

        if summary.error.is_none() && summary.items == 0 && summary.requests == 0 {
            let message = format!("Crawler returned nothing for {}", task.request.url);
            let failure = ParseOutput::Error(ParseFailure {
                tracing_id: task.request.tracing_id.clone(),
                request_id: task.request.id.clone(),
                message: message.clone(),
            });
            match &mut sink {
                Sink::Callback(callback) => callback(failure),
                Sink::Broker => self.forward(failure).await?,
            }
            summary.error = Some(message);
        }
        Ok(summary)
    }

    async fn forward(&self, output: ParseOutput) -> Result<()> {
        let broker = self.broker.as_ref();
        match output {
            ParseOutput::Item(item) => publish_json(broker, topics::ITEM, &item).await,
            ParseOutput::Request(req) => publish_json(broker, topics::REQUEST, &req).await,
            ParseOutput::Error(failure) => publish_json(broker, topics::ERROR, &failure).await,
        }
    }

    fn keep_alive(&self, msg: Arc<dyn Message>) -> CancellationToken {
        let token = CancellationToken::new();
        let every = self.config.touch_interval();
        let stop = token.clone();
        tokio::spawn(async move {
            loop {
                match timeout(every, stop.cancelled()).await {
                    Ok(()) => break,
                    Err(_) => {
                        if let Err(e) = msg.touch().await {
                            log::warn!("Couldn't touch message {}: {e}", msg.id());
                        }
                    }
                }
            }
        });
        token
    }

    async fn publish_status(&self, task: &ParseTask, res: &Result<ParseSummary>, started: Instant) {
        let (success, item_count, request_count, error) = match res {
            Ok(summary) => (
                summary.is_success(),
                summary.items,
                summary.requests,
                summary.error.clone(),
            ),
            Err(e) => (false, 0, 0, Some(e.to_string())),
        };
        let event = StatusEvent {
            tracing_id: task.request.tracing_id.clone(),
            request_id: task.request.id.clone(),
            store_id: self.store_id.clone(),
            success,
            item_count,
            request_count,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if let Err(e) = publish_json(self.broker.as_ref(), topics::STATUS, &event).await {
            log::warn!("Couldn't publish status of request {}: {e}", task.request.id);
        }
    }

    pub fn spawn_feedback(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                match timeout(handler.config.feedback_window(), token.cancelled()).await {
                    Ok(()) => break,
                    Err(_) => {
                        handler.adjust();
                    }
                }
            }
        })
    }

    pub fn spawn_reclaim(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                match timeout(handler.config.reclaim_interval(), token.cancelled()).await {
                    Ok(()) => break,
                    Err(_) => {
                        handler.reclaim();
                    }
                }
            }
        })
    }
}

#[async_trait]
impl MessageHandler for StoreHandler {
    async fn handle_message(&self, msg: Arc<dyn Message>) -> Result<()> {
        msg.disable_auto_response();

        let task: ParseTask = match serde_json::from_slice(msg.body()) {
            Ok(task) => task,
            Err(e) => {
                log::warn!("Dropping malformed task {} of store {}: {e}", msg.id(), self.store_id);
                msg.finish().await?;
                return Ok(());
            }
        };
        let Some(slot) = self.try_admit_queue() else {
            msg.requeue_without_backoff(self.config.admission_poll())
                .await?;
            return Ok(());
        };

        let started = Instant::now();
        let ttl = task
            .request
            .options
            .max_ttl()
            .unwrap_or_else(|| self.config.default_parse_ttl());
        let keep_alive = self.keep_alive(msg.clone());
        let res = self
            .parse_until(deadline_after(started, ttl), &task, Sink::Broker)
            .await;
        keep_alive.cancel();
        drop(slot);

        self.record(matches!(&res, Ok(summary) if summary.is_success()));
        self.publish_status(&task, &res, started).await;

        match res {
            Ok(_) => msg.finish().await?,
            Err(Error::Unavailable(e)) => {
                log::warn!("Cordoning store {}: {e}", self.store_id);
                self.set_concurrency(0);
                msg.requeue(self.config.requeue_backoff()).await?;
            }
            Err(e) if e.is_retryable()
                && u32::from(msg.attempts()) <= task.request.options.max_retry_count =>
            {
                log::warn!("Retrying request {} later: {e}", task.request.id);
                msg.requeue(self.config.requeue_backoff()).await?;
            }
            Err(e) => {
                log::error!("Giving up on request {}: {e}", task.request.id);
                msg.finish().await?;
            }
        }
        Ok(())
    }
}

/// An admitted unit of work, gives its slot back when dropped.
struct Slot<'a> {
    handler: &'a StoreHandler,
    lane: Lane,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.handler.release(self.lane);
    }
}

/// A direct caller waiting for admission.
struct Waiting<'a> {
    handler: &'a StoreHandler,
    registered: bool,
}

impl<'a> Waiting<'a> {
    fn register(handler: &'a StoreHandler) -> Self {
        let mut lanes = handler.lanes();
        lanes.waiting += 1;
        handler.settle(&mut lanes);
        Self {
            handler,
            registered: true,
        }
    }

    fn try_admit(&mut self) -> Result<Option<Slot<'a>>> {
        let handler = self.handler;
        let mut lanes = handler.lanes();
        let b = lanes.budget;
        if b.max == 0 {
            return Err(Error::Unavailable(format!(
                "Store {} was cordoned",
                handler.store_id
            )));
        }
        if b.used() >= b.reserved() || b.current >= b.max {
            return Ok(None);
        }
        lanes.waiting -= 1;
        lanes.budget.current += 1;
        handler.settle(&mut lanes);
        self.registered = false;
        Ok(Some(Slot {
            handler,
            lane: Lane::Direct,
        }))
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.registered {
            self.handler.lanes().waiting -= 1;
        }
    }
}

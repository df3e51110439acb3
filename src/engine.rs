//! Concurrent webhook processing engine.
//!
//! For every service, in declared order, the engine queues the files the
//! service's filter selects and lets a bounded pool of workers drain the queue.
//! Each worker issues the call through a [`Processor`], classifies the reply
//! and forwards business failures (as [`Message`]s) and hard errors to two
//! collector tasks that run alongside the workers.
//!
//! # Failure policies
//! - [`FailurePolicy::StopOnFirstFailure`]: the first failure of either kind
//!   sets the stop signal. Idle workers stop claiming work and later services
//!   are skipped; calls already in flight finish.
//! - [`FailurePolicy::ContinueOnFailure`]: no failure stops the run, so every
//!   service sees every file. Hard errors are collected along the way.
//!
//! The stop signal is a child of the caller's [`CancellationToken`], so
//! cancelling the caller and tripping the policy stop the run the same way.
//! Any collected hard error fails the whole run; several are combined.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AssetError, Result};
use crate::filter::PathFilter;
use crate::model::{Message, MessageMap, ServiceDescriptor};
use crate::webhook::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    StopOnFirstFailure,
    ContinueOnFailure,
}

/// How a processor groups files into calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// One call per file.
    PerFile,
    /// One call per service carrying every selected file.
    Batch,
}

/// Files covered by a single webhook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnit {
    File(String),
    Batch(Vec<String>),
}

impl WorkUnit {
    pub fn files(&self) -> &[String] {
        match self {
            WorkUnit::File(file) => std::slice::from_ref(file),
            WorkUnit::Batch(files) => files,
        }
    }
}

/// A webhook stage plugged into the engine.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    fn dispatch(&self) -> Dispatch {
        Dispatch::PerFile
    }

    /// Issue the call for `unit`.
    async fn call(
        &self,
        service: &ServiceDescriptor,
        unit: &WorkUnit,
        timeout: Duration,
    ) -> Result<Reply>;

    /// Handle a `200` reply. Returned messages count as business failures.
    async fn on_success(
        &self,
        service: &ServiceDescriptor,
        unit: &WorkUnit,
        body: Vec<u8>,
    ) -> Result<Vec<Message>>;

    /// Handle a `422` reply.
    async fn on_fail(
        &self,
        service: &ServiceDescriptor,
        unit: &WorkUnit,
        body: Vec<u8>,
    ) -> Result<Vec<Message>>;
}

/// Aggregate outcome of an engine run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResult {
    pub success: bool,
    /// Messages keyed by [`ServiceDescriptor::key`], sorted per service.
    pub messages: MessageMap,
}

impl EngineResult {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            messages: MessageMap::new(),
        }
    }

    fn from_messages(mut messages: MessageMap) -> Self {
        for list in messages.values_mut() {
            list.sort();
        }
        Self {
            success: messages.is_empty(),
            messages,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub workers: usize,
    pub timeout: Duration,
    pub policy: FailurePolicy,
}

pub struct ProcessingEngine {
    options: EngineOptions,
}

impl ProcessingEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }

    pub async fn run(
        &self,
        processor: Arc<dyn Processor>,
        files: &[String],
        services: &[ServiceDescriptor],
        cancel: &CancellationToken,
    ) -> Result<EngineResult> {
        let stop = cancel.child_token();
        let mut messages = MessageMap::new();
        let mut errors = Vec::new();

        for service in services {
            if stop.is_cancelled() {
                info!(service = %service.key(), "Stop signal set, skipping remaining services");
                break;
            }

            let selected = PathFilter::new(&service.filter)?.apply(files);
            if selected.is_empty() {
                debug!(service = %service.key(), "No files selected for service");
                continue;
            }
            let units: Vec<WorkUnit> = match processor.dispatch() {
                Dispatch::PerFile => selected.into_iter().map(WorkUnit::File).collect(),
                Dispatch::Batch => vec![WorkUnit::Batch(selected)],
            };

            let (service_messages, service_errors) = self
                .run_service(processor.clone(), Arc::new(service.clone()), units, &stop)
                .await;
            if !service_messages.is_empty() {
                messages
                    .entry(service.key())
                    .or_default()
                    .extend(service_messages);
            }
            errors.extend(service_errors);
        }

        if let Some(err) = AssetError::combine(errors) {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(AssetError::Cancelled);
        }
        Ok(EngineResult::from_messages(messages))
    }

    async fn run_service(
        &self,
        processor: Arc<dyn Processor>,
        service: Arc<ServiceDescriptor>,
        units: Vec<WorkUnit>,
        stop: &CancellationToken,
    ) -> (Vec<Message>, Vec<AssetError>) {
        let worker_count = self.options.workers.max(1).min(units.len());
        debug!(
            service = %service.key(),
            units = units.len(),
            workers = worker_count,
            "Dispatching service work"
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(units)));
        let (message_tx, message_rx) = mpsc::channel(worker_count);
        let (error_tx, error_rx) = mpsc::channel(worker_count);
        let message_collector = tokio::spawn(collect(message_rx));
        let error_collector = tokio::spawn(collect(error_rx));

        let workers: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    processor: processor.clone(),
                    service: service.clone(),
                    queue: queue.clone(),
                    messages: message_tx.clone(),
                    errors: error_tx.clone(),
                    stop: stop.clone(),
                    timeout: self.options.timeout,
                    policy: self.options.policy,
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(message_tx);
        drop(error_tx);

        let mut failed_workers = Vec::new();
        for handle in workers {
            if let Err(e) = handle.await {
                stop.cancel();
                failed_workers.push(AssetError::Worker(e.to_string()));
            }
        }

        let messages = message_collector.await.unwrap_or_default();
        let mut errors = error_collector.await.unwrap_or_default();
        errors.extend(failed_workers);
        (messages, errors)
    }
}

async fn collect<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(item) = rx.recv().await {
        out.push(item);
    }
    out
}

struct Worker {
    id: usize,
    processor: Arc<dyn Processor>,
    service: Arc<ServiceDescriptor>,
    queue: Arc<Mutex<VecDeque<WorkUnit>>>,
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<AssetError>,
    stop: CancellationToken,
    timeout: Duration,
    policy: FailurePolicy,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let Some(unit) = self.queue.lock().await.pop_front() else {
                break;
            };
            // The signal may have been set while waiting for the queue.
            if self.stop.is_cancelled() {
                break;
            }
            self.process(unit).await;
        }
        debug!(worker = self.id, service = %self.service.key(), "Worker finished");
    }

    async fn process(&self, unit: WorkUnit) {
        let outcome = match self.processor.call(&self.service, &unit, self.timeout).await {
            Ok(Reply::Success(body)) => self.processor.on_success(&self.service, &unit, body).await,
            Ok(Reply::NotModified) => Ok(Vec::new()),
            Ok(Reply::Rejected(body)) => self.processor.on_fail(&self.service, &unit, body).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(messages) if messages.is_empty() => {}
            Ok(messages) => {
                debug!(
                    worker = self.id,
                    service = %self.service.key(),
                    failures = messages.len(),
                    "Service rejected files"
                );
                if self.policy == FailurePolicy::StopOnFirstFailure {
                    self.stop.cancel();
                }
                for message in messages {
                    if self.messages.send(message).await.is_err() {
                        warn!(worker = self.id, "Message collector closed");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(
                    worker = self.id,
                    service = %self.service.key(),
                    files = ?unit.files(),
                    error = %e,
                    "Webhook call failed"
                );
                if self.policy == FailurePolicy::StopOnFirstFailure {
                    self.stop.cancel();
                }
                if self.errors.send(e).await.is_err() {
                    warn!(worker = self.id, "Error collector closed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects the files it is told to, errors on others, accepts the rest.
    struct Scripted {
        dispatch: Dispatch,
        rejects: Vec<&'static str>,
        errors: Vec<&'static str>,
        calls: AtomicUsize,
        seen: std::sync::Mutex<HashMap<String, usize>>,
    }

    impl Scripted {
        fn new(rejects: Vec<&'static str>, errors: Vec<&'static str>) -> Self {
            Self {
                dispatch: Dispatch::PerFile,
                rejects,
                errors,
                calls: AtomicUsize::new(0),
                seen: Default::default(),
            }
        }
    }

    #[async_trait]
    impl Processor for Scripted {
        fn dispatch(&self) -> Dispatch {
            self.dispatch
        }

        async fn call(
            &self,
            service: &ServiceDescriptor,
            unit: &WorkUnit,
            _timeout: Duration,
        ) -> Result<Reply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock().unwrap().entry(service.name.clone()).or_default() += 1;
            let file = unit.files()[0].as_str();
            if self.errors.contains(&file) {
                return Err(AssetError::Store(format!("boom {file}")));
            }
            if self.rejects.contains(&file) {
                return Ok(Reply::Rejected(file.as_bytes().to_vec()));
            }
            Ok(Reply::NotModified)
        }

        async fn on_success(
            &self,
            _service: &ServiceDescriptor,
            _unit: &WorkUnit,
            _body: Vec<u8>,
        ) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn on_fail(
            &self,
            _service: &ServiceDescriptor,
            unit: &WorkUnit,
            body: Vec<u8>,
        ) -> Result<Vec<Message>> {
            let text = String::from_utf8_lossy(&body).into_owned();
            Ok(unit
                .files()
                .iter()
                .map(|f| Message::new(f.clone(), format!("rejected {text}")))
                .collect())
        }
    }

    fn service(name: &str, filter: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.into(),
            namespace: "hooks".into(),
            endpoint: "/run".into(),
            filter: filter.into(),
            ..Default::default()
        }
    }

    fn engine(workers: usize, policy: FailurePolicy) -> ProcessingEngine {
        ProcessingEngine::new(EngineOptions {
            workers,
            timeout: Duration::from_secs(1),
            policy,
        })
    }

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn continue_policy_reports_every_rejection_sorted() {
        let processor = Arc::new(Scripted::new(vec!["c.txt", "a.txt"], vec![]));
        let result = engine(4, FailurePolicy::ContinueOnFailure)
            .run(
                processor.clone(),
                &files(&["a.txt", "b.txt", "c.txt"]),
                &[service("first", ""), service("second", "")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 6);
        let first = &result.messages["hooks/first/run"];
        assert_eq!(
            first.iter().map(|m| m.file_name.as_str()).collect::<Vec<_>>(),
            vec!["a.txt", "c.txt"]
        );
        assert_eq!(result.messages.len(), 2);
    }

    #[tokio::test]
    async fn stop_policy_with_one_worker_makes_a_single_call() {
        let processor = Arc::new(Scripted::new(vec!["a.txt"], vec![]));
        let result = engine(1, FailurePolicy::StopOnFirstFailure)
            .run(
                processor.clone(),
                &files(&["a.txt", "b.txt", "c.txt"]),
                &[service("first", ""), service("second", "")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert!(!result.messages.contains_key("hooks/second/run"));
    }

    #[tokio::test]
    async fn filter_limits_the_files_a_service_sees() {
        let processor = Arc::new(Scripted::new(vec![], vec![]));
        let result = engine(2, FailurePolicy::ContinueOnFailure)
            .run(
                processor.clone(),
                &files(&["a.md", "b.txt", "c.md"]),
                &[service("md", r"\.md$"), service("none", r"\.json$")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.messages.is_empty());
        let seen = processor.seen.lock().unwrap();
        assert_eq!(seen.get("md"), Some(&2));
        assert_eq!(seen.get("none"), None);
    }

    /// Under the continue policy a hard error does not stop dispatch; every
    /// error is returned together.
    #[tokio::test]
    async fn continue_policy_dispatches_everything_despite_hard_errors() {
        let processor = Arc::new(Scripted::new(vec![], vec!["a.txt", "c.txt"]));
        let err = engine(1, FailurePolicy::ContinueOnFailure)
            .run(
                processor.clone(),
                &files(&["a.txt", "b.txt", "c.txt"]),
                &[service("first", ""), service("second", "")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(processor.calls.load(Ordering::SeqCst), 6);
        let seen = processor.seen.lock().unwrap();
        assert_eq!(seen.get("first"), Some(&3));
        assert_eq!(seen.get("second"), Some(&3));
        assert!(matches!(err, AssetError::Multiple(ref errors) if errors.len() == 4), "{err}");
        let text = err.to_string();
        assert!(text.contains("boom a.txt"));
        assert!(text.contains("boom c.txt"));
    }

    #[tokio::test]
    async fn stop_policy_hard_error_stops_dispatch() {
        let processor = Arc::new(Scripted::new(vec![], vec!["a.txt"]));
        let err = engine(1, FailurePolicy::StopOnFirstFailure)
            .run(
                processor.clone(),
                &files(&["a.txt", "b.txt", "c.txt"]),
                &[service("first", ""), service("second", "")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("boom a.txt"));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_dispatch_sends_one_unit_per_service() {
        let mut scripted = Scripted::new(vec![], vec![]);
        scripted.dispatch = Dispatch::Batch;
        let processor = Arc::new(scripted);
        engine(8, FailurePolicy::ContinueOnFailure)
            .run(
                processor.clone(),
                &files(&["a", "b", "c"]),
                &[service("one", ""), service("two", "")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_caller_gets_cancelled_error() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let processor = Arc::new(Scripted::new(vec![], vec![]));
        let err = engine(2, FailurePolicy::ContinueOnFailure)
            .run(processor.clone(), &files(&["a"]), &[service("one", "")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AssetError::Cancelled));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_filter_is_reported() {
        let processor = Arc::new(Scripted::new(vec![], vec![]));
        let err = engine(1, FailurePolicy::ContinueOnFailure)
            .run(processor, &files(&["a"]), &[service("bad", "(")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AssetError::InvalidFilter { .. }));
    }
}

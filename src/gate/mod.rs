mod queue;

use crate::errors::{AppError, AppResult};
use crate::models::{GateSnapshot, KernelSettings};
use queue::{QueuedTask, RequestQueue};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Notify};
use tokio::time::{Duration, Instant};

/// Local resource whose lifecycle is owned by the gate.
pub trait ResourceHandle: Send + 'static {
    fn open(&mut self) -> AppResult<()>;
    fn close(&mut self) -> AppResult<()>;
    fn ping(&self) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct GateOptions {
    pub poll_interval: Duration,
    pub availability_wait: Duration,
    pub max_retry: u32,
    pub max_queue_len: Option<usize>,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self::from_settings(&KernelSettings::default())
    }
}

impl GateOptions {
    pub fn from_settings(settings: &KernelSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.gate_poll_interval_ms.max(1)),
            availability_wait: Duration::from_millis(settings.gate_availability_wait_ms),
            max_retry: settings.gate_max_retry,
            max_queue_len: settings.max_queue_len,
        }
    }
}

struct GateState<R> {
    resource_unavailable: bool,
    in_flight: usize,
    queue: RequestQueue<R>,
    drain_running: bool,
}

struct GateInner<R> {
    state: Mutex<GateState<R>>,
    resource: Arc<Mutex<R>>,
    idle: Notify,
    reopened: Notify,
    options: GateOptions,
}

impl<R> GateInner<R> {
    fn lock_state(&self) -> MutexGuard<'_, GateState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct InFlightGuard<R> {
    inner: Arc<GateInner<R>>,
}

impl<R> Drop for InFlightGuard<R> {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.inner.lock_state();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.in_flight == 0
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}

enum Route<F, T> {
    Inline(F),
    Queued(oneshot::Receiver<T>),
}

/// Admission gate in front of a resource that is periodically taken away for
/// an exclusive window. Work submitted while the window is open, or while a
/// backlog exists, is queued and drained strictly in order by a single worker.
pub struct SyncGate<R> {
    inner: Arc<GateInner<R>>,
}

impl<R> Clone for SyncGate<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ResourceHandle> SyncGate<R> {
    /// Takes ownership of an already opened resource.
    pub fn new(resource: R, options: GateOptions) -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState {
                    resource_unavailable: false,
                    in_flight: 0,
                    queue: RequestQueue::new(options.max_queue_len),
                    drain_running: false,
                }),
                resource: Arc::new(Mutex::new(resource)),
                idle: Notify::new(),
                reopened: Notify::new(),
                options,
            }),
        }
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.inner.lock_state();
        GateSnapshot {
            resource_unavailable: state.resource_unavailable,
            queue_len: state.queue.len(),
            in_flight: state.in_flight,
            drain_running: state.drain_running,
        }
    }

    /// Runs `action` against the resource on the blocking pool and returns its
    /// result. Waits until the action has run, however long the resource
    /// stays unavailable.
    pub async fn submit<F, T>(&self, action: F) -> AppResult<T>
    where
        F: FnOnce(&mut R) -> T + Send + 'static,
        T: Send + 'static,
    {
        let route = {
            let mut state = self.inner.lock_state();
            // A running drain worker may hold a popped task that has not
            // reached the resource yet; new work goes behind it.
            if state.resource_unavailable || !state.queue.is_empty() || state.drain_running {
                let (sender, receiver) = oneshot::channel();
                let seq = state.queue.push(Box::new(move |resource: &mut R| {
                    let _ = sender.send(action(resource));
                }))?;
                tracing::info!(seq, queue_len = state.queue.len(), "added task to queue");
                self.ensure_drain_worker(&mut state);
                Route::Queued(receiver)
            } else {
                state.in_flight += 1;
                Route::Inline(action)
            }
        };

        match route {
            Route::Inline(action) => {
                let _guard = InFlightGuard {
                    inner: Arc::clone(&self.inner),
                };
                self.run_inline(action).await
            }
            Route::Queued(receiver) => receiver
                .await
                .map_err(|_| AppError::TaskFaulted("queued task aborted before completing".to_string())),
        }
    }

    async fn run_inline<F, T>(&self, action: F) -> AppResult<T>
    where
        F: FnOnce(&mut R) -> T + Send + 'static,
        T: Send + 'static,
    {
        let resource = Arc::clone(&self.inner.resource);
        let joined = tokio::task::spawn_blocking(move || {
            let mut resource = resource.lock().unwrap_or_else(PoisonError::into_inner);
            std::panic::catch_unwind(AssertUnwindSafe(|| action(&mut *resource)))
                .map_err(|panic| panic_message(&*panic))
        })
        .await;

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => {
                tracing::error!(error = %message, "inline task panicked");
                Err(AppError::TaskFaulted(message))
            }
            Err(error) => {
                tracing::error!(error = %error, "inline task join failed");
                Err(AppError::TaskFaulted(format!("inline task aborted: {}", error)))
            }
        }
    }

    fn ensure_drain_worker(&self, state: &mut GateState<R>) {
        if state.drain_running {
            return;
        }
        state.drain_running = true;
        tracing::info!(queue_len = state.queue.len(), "starting queue processor");
        let gate = self.clone();
        tokio::spawn(async move {
            gate.drain_loop().await;
        });
    }

    async fn drain_loop(self) {
        let mut failed_waits = 0_u32;
        loop {
            {
                let mut state = self.inner.lock_state();
                if state.queue.is_empty() {
                    state.drain_running = false;
                    tracing::info!("queue processor stopped: queue empty");
                    return;
                }
            }

            if !self.wait_until_available().await {
                failed_waits = failed_waits.saturating_add(1);
                if failed_waits > self.inner.options.max_retry {
                    tracing::warn!(
                        max_retry = self.inner.options.max_retry,
                        queue_len = self.snapshot().queue_len,
                        "queue processor: max retry reached, still waiting for resource"
                    );
                }
                continue;
            }
            failed_waits = 0;

            let task = {
                let mut state = self.inner.lock_state();
                if state.resource_unavailable {
                    continue;
                }
                match state.queue.pop() {
                    Some(task) => {
                        state.in_flight += 1;
                        task
                    }
                    None => continue,
                }
            };

            self.execute_queued(task).await;

            let remaining = self.inner.lock_state().queue.len();
            if remaining > 0 {
                tracing::debug!(remaining, "queue processor: tasks remaining in queue");
            }
        }
    }

    async fn execute_queued(&self, task: QueuedTask<R>) {
        let _guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
        };
        let seq = task.seq;
        let waited_ms = task.enqueued_at.elapsed().as_millis() as u64;
        let resource = Arc::clone(&self.inner.resource);
        let action = task.action;

        let joined = tokio::task::spawn_blocking(move || {
            let mut resource = resource.lock().unwrap_or_else(PoisonError::into_inner);
            std::panic::catch_unwind(AssertUnwindSafe(|| action(&mut *resource)))
                .map_err(|panic| panic_message(&*panic))
        })
        .await;

        match joined {
            Ok(Ok(())) => tracing::debug!(seq, waited_ms, "queued task completed"),
            Ok(Err(message)) => tracing::error!(seq, error = %message, "task execution panic"),
            Err(error) => tracing::error!(seq, error = %error, "queued task join failed"),
        }
    }

    /// Waits for the window to close and the resource to answer a ping.
    /// Gives up after `availability_wait` so the caller can count attempts.
    async fn wait_until_available(&self) -> bool {
        let deadline = Instant::now() + self.inner.options.availability_wait;
        loop {
            let reopened = self.inner.reopened.notified();
            tokio::pin!(reopened);
            reopened.as_mut().enable();

            let unavailable = self.inner.lock_state().resource_unavailable;
            if !unavailable {
                match self.with_resource(|resource| resource.ping()).await {
                    Ok(()) => return true,
                    Err(error) => tracing::debug!(error = %error, "resource not ready yet"),
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    waited_ms = self.inner.options.availability_wait.as_millis() as u64,
                    "wait for resource availability timed out"
                );
                return false;
            }
            let _ = tokio::time::timeout(self.inner.options.poll_interval, reopened).await;
        }
    }

    async fn with_resource<T, F>(&self, operation: F) -> AppResult<T>
    where
        F: FnOnce(&mut R) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let resource = Arc::clone(&self.inner.resource);
        tokio::task::spawn_blocking(move || {
            let mut resource = resource.lock().unwrap_or_else(PoisonError::into_inner);
            operation(&mut *resource)
        })
        .await
        .map_err(|error| AppError::Internal(format!("resource operation aborted: {}", error)))?
    }

    async fn wait_for_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.inner.lock_state().in_flight == 0 {
                return;
            }
            let _ = tokio::time::timeout(self.inner.options.poll_interval, idle).await;
        }
    }

    /// Marks the resource unavailable, waits for every executing action to
    /// finish, then closes the resource. New submits queue from this point.
    pub async fn begin_exclusive(&self) -> AppResult<()> {
        {
            let mut state = self.inner.lock_state();
            state.resource_unavailable = true;
        }
        tracing::info!("closing resource for exclusive window");
        self.wait_for_idle().await;
        self.with_resource(|resource| resource.close()).await
    }

    /// Reopens the resource and lifts the window. The flag is cleared even if
    /// reopening fails; the drain worker keeps pinging until it recovers.
    pub async fn end_exclusive(&self) -> AppResult<()> {
        let reopened = self.with_resource(|resource| resource.open()).await;
        let pending = {
            let mut state = self.inner.lock_state();
            state.resource_unavailable = false;
            if !state.queue.is_empty() {
                self.ensure_drain_worker(&mut state);
            }
            state.queue.len()
        };
        self.inner.reopened.notify_waiters();

        match &reopened {
            Ok(()) => tracing::info!(pending, "resource reopened after exclusive window"),
            Err(error) => tracing::error!(pending, error = %error, "reopen resource after exclusive window failed"),
        }
        reopened
    }

    /// Runs `job` inside an exclusive window. The window is always ended, and
    /// the job's error wins over a reopen error.
    pub async fn run_exclusive<Fut, T>(&self, job: Fut) -> AppResult<T>
    where
        Fut: Future<Output = AppResult<T>>,
    {
        if let Err(error) = self.begin_exclusive().await {
            let _ = self.end_exclusive().await;
            return Err(error);
        }
        let result = job.await;
        let reopened = self.end_exclusive().await;
        let value = result?;
        reopened?;
        Ok(value)
    }

    /// Waits until queued work has drained, then closes the resource.
    pub async fn close(&self) -> AppResult<()> {
        loop {
            let snapshot = self.snapshot();
            if snapshot.queue_len == 0 && snapshot.in_flight == 0 && !snapshot.drain_running {
                break;
            }
            tokio::time::sleep(self.inner.options.poll_interval).await;
        }
        self.with_resource(|resource| resource.close()).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

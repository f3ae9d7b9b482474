use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{Input, Output, OutputError, SchedulerError, Subscription};

/// Unique identifier of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    /// Returns the raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A standing binding between one input and one output.
struct Binding {
    input: Arc<dyn Input>,
    output: Arc<dyn Output>,
}

impl Binding {
    fn is(&self, input: &Arc<dyn Input>, output: &Arc<dyn Output>) -> bool {
        same(&self.input, input) && same(&self.output, output)
    }
}

/// Compares the data pointers only; vtable pointers of the same type may differ.
fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

#[derive(Default)]
struct Registry {
    endpoints: RwLock<FxHashMap<EndpointId, Binding>>,
}

/// Binds inputs to outputs.
///
/// Every endpoint owns one routing task, pulling from its own subscription on the input and
/// writing into the output. Messages an output doesn't accept are dropped silently. An endpoint
/// whose input ended or whose output closed is removed.
pub struct Scheduler {
    registry: Arc<Registry>,
    next_id: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("endpoints", &self.registry.endpoints.read().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler without endpoints.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Binds `input` to `output` and starts the endpoint's routing task.
    ///
    /// Fails with [`SchedulerError::InvalidBinding`] if the scheduler is closed or the pair is
    /// already bound.
    pub fn register_endpoint(
        &self,
        input: Arc<dyn Input>,
        output: Arc<dyn Output>,
    ) -> Result<EndpointId, SchedulerError> {
        let mut endpoints = self.registry.endpoints.write();

        if self.is_closed() {
            return Err(SchedulerError::InvalidBinding("scheduler is closed"));
        }
        if endpoints.values().any(|binding| binding.is(&input, &output)) {
            return Err(SchedulerError::InvalidBinding("input and output are already bound"));
        }

        let id = EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed));

        // Subscribe before the task starts so nothing published from now on is missed
        let subscription = input.subscribe();
        self.tasks.spawn(route(
            id,
            subscription,
            Arc::clone(&output),
            self.cancel.child_token(),
            Arc::downgrade(&self.registry),
        ));

        debug!(endpoint = %id, input = input.name(), output = output.name(), "Registered endpoint");
        endpoints.insert(id, Binding { input, output });

        Ok(id)
    }

    /// Binds every input to every output.
    pub fn bind_all(
        &self,
        inputs: &[Arc<dyn Input>],
        outputs: &[Arc<dyn Output>],
    ) -> Result<Vec<EndpointId>, SchedulerError> {
        let mut ids = Vec::with_capacity(inputs.len() * outputs.len());
        for input in inputs {
            for output in outputs {
                ids.push(self.register_endpoint(Arc::clone(input), Arc::clone(output))?);
            }
        }

        info!(inputs = inputs.len(), outputs = outputs.len(), endpoints = ids.len(), "Bound endpoints");
        Ok(ids)
    }

    /// Returns the live endpoints, in registration order.
    pub fn endpoints(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.registry.endpoints.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns `true` once [`Scheduler::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until every routing task has ended on its own, because its input was exhausted or
    /// its output closed.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stops every routing task and waits for them to finish. Messages in flight are dropped.
    pub async fn close(&self) {
        {
            // Hold the registry lock so no registration races the flag
            let _endpoints = self.registry.endpoints.write();
            self.closed.store(true, Ordering::Release);
        }

        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        self.registry.endpoints.write().clear();
        info!("Scheduler closed");
    }
}

async fn route(
    id: EndpointId,
    mut subscription: Subscription,
    output: Arc<dyn Output>,
    cancel: CancellationToken,
    registry: Weak<Registry>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = subscription.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!(endpoint = %id, "Input ended");
                    break;
                }
            },
        };

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = output.write(msg) => res,
        };

        match res {
            Ok(()) => {}
            Err(OutputError::LevelMismatch { level, accepted }) => {
                trace!(endpoint = %id, %level, %accepted, "Output does not accept message level");
            }
            Err(OutputError::Closed) => {
                warn!(endpoint = %id, output = output.name(), "Output closed, stopping endpoint");
                break;
            }
            Err(e) => {
                warn!(endpoint = %id, err = ?e, "Write failed");
            }
        }
    }

    if let Some(registry) = registry.upgrade() {
        registry.endpoints.write().remove(&id);
    }
    debug!(endpoint = %id, "Endpoint stopped");
}

//! Single-threaded mutation executor and cancelable contexts.
//!
//! All master state transitions run on one automaton task: callers enqueue
//! closures over the owned state and the automaton applies them strictly in
//! order. Heavy work stays off this task and posts a continuation back when
//! it completes. [`CancelableContext`] carries cooperative cancellation into
//! background pipelines; continuations poll it before touching state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use arbor_types::{ArborError, ErrorCode};

type Mutation<S> = Box<dyn FnOnce(&mut S) + Send>;

/// The owning half: applies queued mutations to the state it owns.
pub struct Automaton<S> {
    state: S,
    receiver: mpsc::UnboundedReceiver<Mutation<S>>,
}

/// The posting half: cheap to clone, usable from any task or thread.
pub struct AutomatonHandle<S> {
    sender: mpsc::UnboundedSender<Mutation<S>>,
}

impl<S> Clone for AutomatonHandle<S> {
    fn clone(&self) -> Self {
        AutomatonHandle {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Send + 'static> Automaton<S> {
    pub fn new(state: S) -> (Self, AutomatonHandle<S>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Automaton { state, receiver }, AutomatonHandle { sender })
    }

    /// Applies queued mutations until every handle is dropped, then returns
    /// the final state.
    pub async fn run(mut self) -> S {
        while let Some(mutation) = self.receiver.recv().await {
            mutation(&mut self.state);
        }
        self.state
    }

    /// Applies everything currently queued without waiting; for tick-driven
    /// tests.
    pub fn drain(&mut self) {
        while let Ok(mutation) = self.receiver.try_recv() {
            mutation(&mut self.state);
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }
}

impl<S: Send + 'static> AutomatonHandle<S> {
    /// Enqueues a mutation; the result arrives once the automaton applies it.
    pub fn invoke<R, F>(&self, mutation: F) -> oneshot::Receiver<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let _ = self.sender.send(Box::new(move |state| {
            let _ = tx.send(mutation(state));
        }));
        rx
    }

    /// Fire-and-forget variant.
    pub fn post<F>(&self, mutation: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let _ = self.sender.send(Box::new(mutation));
    }
}

/// Cooperative cancellation shared by a pipeline and its continuations.
///
/// Child contexts observe their parent's cancellation; cancelling a child
/// does not affect the parent.
#[derive(Clone)]
pub struct CancelableContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    cancelled: AtomicBool,
    error: Mutex<Option<ArborError>>,
    parent: Option<Arc<ContextInner>>,
}

impl CancelableContext {
    pub fn new() -> Self {
        CancelableContext {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                error: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Derives a child context observing this one.
    pub fn child(&self) -> Self {
        CancelableContext {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                error: Mutex::new(None),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    pub fn cancel(&self, error: ArborError) {
        let mut slot = self.inner.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut current = Some(&self.inner);
        while let Some(inner) = current {
            if inner.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            current = inner.parent.as_ref();
        }
        false
    }

    /// Returns the cancellation error, if any, walking up to the nearest
    /// cancelled ancestor.
    pub fn cancellation_error(&self) -> Option<ArborError> {
        let mut current = Some(&self.inner);
        while let Some(inner) = current {
            if inner.cancelled.load(Ordering::SeqCst) {
                let slot = inner.error.lock().unwrap();
                return Some(slot.clone().unwrap_or_else(|| {
                    ArborError::new(ErrorCode::Cancelled, "context cancelled")
                }));
            }
            current = inner.parent.as_ref();
        }
        None
    }

    /// Errors out if cancelled; polled before each continuation.
    pub fn check(&self) -> Result<(), ArborError> {
        match self.cancellation_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for CancelableContext {
    fn default() -> Self {
        Self::new()
    }
}

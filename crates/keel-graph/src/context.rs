//! Cancellation contexts
//!
//! A [`Context`] is a node in a tree. Cancelling a context cancels every
//! context derived from it. Blocking operations select on [`Context::done`]
//! and [`Context::deadline_channel`] so that abandoned work stops waiting.
//!
//! Contexts derived by the loader for package workers also carry the chain of
//! packages being loaded, which is how re-entrant loads of a package that is
//! still being parsed are reported as cycles.

use crate::error::Error;
use crossbeam::channel::{self, Receiver, Sender};
use keel_pm::Cancellation;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Cancellation context
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    done: Receiver<()>,
    deadline: Option<Instant>,
    loading: Option<Arc<LoadFrame>>,
}

struct State {
    reason: Option<Error>,
    // Dropped on cancellation, which disconnects `done`.
    done_tx: Option<Sender<()>>,
    children: Vec<Weak<Inner>>,
}

/// One package being loaded, linked to the package whose load required it.
struct LoadFrame {
    package: String,
    parent: Option<Arc<LoadFrame>>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::new_inner(None, None)
    }

    fn new_inner(deadline: Option<Instant>, loading: Option<Arc<LoadFrame>>) -> Self {
        let (tx, rx) = channel::bounded(0);
        Context {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    reason: None,
                    done_tx: Some(tx),
                    children: Vec::new(),
                }),
                done: rx,
                deadline,
                loading,
            }),
        }
    }

    fn derive(&self, deadline: Option<Instant>, loading: Option<Arc<LoadFrame>>) -> Context {
        let deadline = match (self.inner.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let child = Self::new_inner(deadline, loading);

        let mut state = self.inner.state.lock();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            child.cancel_with(reason);
            return child;
        }

        state.children.retain(|c| c.strong_count() > 0);
        state.children.push(Arc::downgrade(&child.inner));
        child
    }

    /// A context cancelled when this one is, or when [`Context::cancel`] is
    /// called on it.
    pub fn child(&self) -> Context {
        self.derive(None, self.inner.loading.clone())
    }

    /// A child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child context whose deadline is at most `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        self.derive(Some(deadline), self.inner.loading.clone())
    }

    /// A child context recording that `package` is being loaded.
    pub fn with_loading(&self, package: impl Into<String>) -> Context {
        let frame = Arc::new(LoadFrame {
            package: package.into(),
            parent: self.inner.loading.clone(),
        });
        self.derive(None, Some(frame))
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel_with(Error::Cancelled);
    }

    fn cancel_with(&self, reason: Error) {
        cancel_inner(&self.inner, reason);
    }

    /// Why the context is done, if it is.
    pub fn err(&self) -> Option<Error> {
        if let Some(reason) = self.inner.state.lock().reason.clone() {
            return Some(reason);
        }

        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fail with the context's error if it is done.
    pub fn check(&self) -> Result<(), Error> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Disconnected when the context is cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Fires when the deadline passes; never fires without a deadline.
    pub fn deadline_channel(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(deadline) => channel::at(deadline),
            None => channel::never(),
        }
    }

    /// The package whose load this context is working for, if any.
    pub fn loading_package(&self) -> Option<&str> {
        self.inner.loading.as_ref().map(|f| f.package.as_str())
    }

    /// Packages being loaded, outermost first.
    pub fn loading_chain(&self) -> Vec<String> {
        let mut chain = Vec::new();
        let mut frame = self.inner.loading.as_ref();
        while let Some(f) = frame {
            chain.push(f.package.clone());
            frame = f.parent.as_ref();
        }
        chain.reverse();
        chain
    }
}

fn cancel_inner(inner: &Arc<Inner>, reason: Error) {
    let children = {
        let mut state = inner.state.lock();
        if state.reason.is_some() {
            return;
        }
        state.reason = Some(reason.clone());
        state.done_tx = None;
        std::mem::take(&mut state.children)
    };

    for child in children {
        if let Some(child) = child.upgrade() {
            cancel_inner(&child, reason.clone());
        }
    }
}

impl Cancellation for Context {
    fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("loading", &self.loading_chain())
            .field("err", &self.err())
            .finish()
    }
}

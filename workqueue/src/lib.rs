//! Named worker pools draining a delay queue of string keys.
//!
//! A [`WorkerMgr`] owns a set of workers that each take one key off its
//! [`DelayQueue`], run the registered [`Handler`] on it and then get
//! restarted after a short pause. The pool can be resized at runtime, frozen
//! through a shared [`Action`], and individual in-flight keys can be
//! cancelled.

pub mod action;
pub mod queue;
mod worker;

pub use action::{Action, Event, EventKind, EventState, Mode};
pub use queue::DelayQueue;
pub use worker::{Handler, Request, WorkerMgr, WorkerMgrConfig, DEFAULT_QUEUE_SIZE};

//! Thread-safe wrapper over an execution context
//!
//! Every call takes a re-entrant lock, so a thread already inside the
//! context (for example from a callback) can call back in. Re-entry into the
//! same mutable borrow is reported as an error instead of deadlocking.

use std::cell::RefCell;

use parking_lot::ReentrantMutex;

use crate::context::ExecutionContext;
use crate::errors::{Result, StatelineError};
use crate::model::{Identity, ObjectRef, Value};

pub struct SharedExecutionContext {
    inner: ReentrantMutex<RefCell<ExecutionContext>>,
}

impl std::fmt::Debug for SharedExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock();
        let result = match guard.try_borrow() {
            Ok(ctx) => f.debug_tuple("SharedExecutionContext").field(&*ctx).finish(),
            Err(_) => f.write_str("SharedExecutionContext(<in use>)"),
        };
        result
    }
}

impl SharedExecutionContext {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(ctx)),
        }
    }

    /// Run `f` with exclusive access to the context
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the calling thread is already inside `with`,
    /// otherwise whatever `f` returns.
    pub fn with<T>(&self, f: impl FnOnce(&mut ExecutionContext) -> Result<T>) -> Result<T> {
        let guard = self.inner.lock();
        let mut ctx = guard.try_borrow_mut().map_err(|_| {
            StatelineError::internal("execution context re-entered while borrowed")
        })?;
        f(&mut *ctx)
    }

    pub fn into_inner(self) -> ExecutionContext {
        self.inner.into_inner().into_inner()
    }

    pub fn new_object(&self, class: &str) -> Result<ObjectRef> {
        self.with(|ctx| ctx.new_object(class))
    }

    pub fn get(&self, obj: ObjectRef, field: &str) -> Result<Value> {
        self.with(|ctx| ctx.get(obj, field))
    }

    pub fn set(&self, obj: ObjectRef, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.with(|ctx| ctx.set(obj, field, value))
    }

    pub fn persist(&self, obj: ObjectRef) -> Result<ObjectRef> {
        self.with(|ctx| ctx.persist(obj))
    }

    pub fn delete(&self, obj: ObjectRef) -> Result<()> {
        self.with(|ctx| ctx.delete(obj))
    }

    pub fn find_by_identity(&self, identity: &Identity, validate: bool) -> Result<ObjectRef> {
        self.with(|ctx| ctx.find_by_identity(identity, validate, true, None))
    }

    pub fn flush(&self) -> Result<()> {
        self.with(|ctx| ctx.flush(true))
    }

    pub fn begin(&self) -> Result<()> {
        self.with(ExecutionContext::begin)
    }

    pub fn commit(&self) -> Result<()> {
        self.with(ExecutionContext::commit)
    }

    pub fn rollback(&self) -> Result<()> {
        self.with(ExecutionContext::rollback)
    }

    pub fn close(&self) -> Result<()> {
        self.with(ExecutionContext::close)
    }
}

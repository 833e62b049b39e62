//! Ruby threads and mutexes.
//!
//! Every Ruby thread is an OS thread with its own [`Interp`]. Cancellation is
//! cooperative: `kill` raises a flag that the thread observes before each
//! dispatch and while waiting on a mutex or a join.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::heap::{Data, Object};
use super::{Core, Unwind};
use crate::value::Value;
use crate::vm::Interp;

const POLL: Duration = Duration::from_millis(10);

/// How a thread's block finished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Value(Value),
    Raised(Value),
    Killed,
}

pub struct ThreadHandle {
    pub id: u64,
    pub kill: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl ThreadHandle {
    /// Start running `block` on a new OS thread.
    pub fn spawn(core: &Arc<Core>, block: Value, args: Vec<Value>) -> std::io::Result<Arc<ThreadHandle>> {
        let id = core.next_thread_id();
        let handle = Arc::new(ThreadHandle {
            id,
            kill: Arc::new(AtomicBool::new(false)),
            join: Mutex::new(None),
            outcome: Mutex::new(None),
            done: Condvar::new(),
        });
        let worker = handle.clone();
        let core = core.clone();
        let stack_size = core.config.stack_size;
        let join = std::thread::Builder::new()
            .name(format!("garnet-{id}"))
            .stack_size(stack_size)
            .spawn(move || {
                let mut interp = Interp::new(core, worker.id, worker.kill.clone());
                let outcome = match interp.call_block(block, &args) {
                    Ok(v) => Outcome::Value(v),
                    Err(Unwind::Raise(exc)) => {
                        debug!(target: "garnet::thread", thread = worker.id, "thread terminated by exception");
                        Outcome::Raised(exc)
                    }
                    Err(Unwind::Kill) => Outcome::Killed,
                    Err(Unwind::Break { .. } | Unwind::Return { .. }) => {
                        Outcome::Raised(interp.exception(interp.core.c.local_jump_error, "unexpected break or return from thread block"))
                    }
                };
                worker.finish(outcome);
            })?;
        *handle.join.lock() = Some(join);
        info!(target: "garnet::thread", thread = id, "thread spawned");
        Ok(handle)
    }

    fn finish(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    pub fn outcome(&self) -> Option<Outcome> {
        *self.outcome.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.outcome.lock().is_none()
    }

    pub fn request_kill(&self) {
        self.kill.store(true, Ordering::Release);
    }

    /// Wait for the thread to finish. Returns `None` if `caller_kill` was
    /// raised while waiting.
    pub fn wait(&self, caller_kill: &AtomicBool) -> Option<Outcome> {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if caller_kill.load(Ordering::Acquire) {
                return None;
            }
            self.done.wait_for(&mut outcome, POLL);
        }
        let result = *outcome;
        drop(outcome);
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
        result
    }

    /// `Thread#status`: "run" while alive, false after a normal exit or kill,
    /// nil after an exception.
    pub fn status(&self, core: &Core) -> Value {
        match self.outcome() {
            None => core.new_string("run"),
            Some(Outcome::Value(_) | Outcome::Killed) => Value::FALSE,
            Some(Outcome::Raised(_)) => Value::NIL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The calling thread already holds the mutex.
    Recursive,
    /// The calling thread was killed while waiting.
    Killed,
}

/// Non-reentrant mutex owned by a Ruby thread id.
#[derive(Default)]
pub struct RubyMutex {
    owner: Mutex<Option<u64>>,
    released: Condvar,
}

impl RubyMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, thread: u64, kill: &AtomicBool) -> Result<(), LockError> {
        let mut owner = self.owner.lock();
        if *owner == Some(thread) {
            return Err(LockError::Recursive);
        }
        while owner.is_some() {
            if kill.load(Ordering::Acquire) {
                return Err(LockError::Killed);
            }
            self.released.wait_for(&mut owner, POLL);
        }
        *owner = Some(thread);
        Ok(())
    }

    pub fn try_lock(&self, thread: u64) -> bool {
        let mut owner = self.owner.lock();
        if owner.is_some() {
            return false;
        }
        *owner = Some(thread);
        true
    }

    /// False when `thread` is not the owner.
    pub fn unlock(&self, thread: u64) -> bool {
        let mut owner = self.owner.lock();
        if *owner != Some(thread) {
            return false;
        }
        *owner = None;
        self.released.notify_one();
        true
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub fn owned_by(&self, thread: u64) -> bool {
        *self.owner.lock() == Some(thread)
    }
}

// ── Thread and Mutex methods ────────────────────────────────────────

pub(crate) fn install(core: &Core) {
    let thread_meta = core.metaclass(core.c.thread);
    core.define_foreign(thread_meta, "new", 0, -1, thread_new);
    core.define_foreign(thread_meta, "start", 0, -1, thread_new);
    core.define_foreign(core.c.thread, "join", 0, 1, thread_join);
    core.define_foreign(core.c.thread, "value", 0, 0, thread_value);
    core.define_foreign(core.c.thread, "alive?", 0, 0, thread_alive);
    core.define_foreign(core.c.thread, "kill", 0, 0, thread_kill);
    core.define_foreign(core.c.thread, "status", 0, 0, thread_status);

    let mutex_meta = core.metaclass(core.c.mutex);
    core.define_foreign(mutex_meta, "new", 0, 0, mutex_new);
    core.define_foreign(core.c.mutex, "lock", 0, 0, mutex_lock);
    core.define_foreign(core.c.mutex, "try_lock", 0, 0, mutex_try_lock);
    core.define_foreign(core.c.mutex, "unlock", 0, 0, mutex_unlock);
    core.define_foreign(core.c.mutex, "synchronize", 0, 0, mutex_synchronize);
    core.define_foreign(core.c.mutex, "locked?", 0, 0, mutex_locked);
    core.define_foreign(core.c.mutex, "owned?", 0, 0, mutex_owned);
}

fn handle_of(interp: &mut Interp, v: Value) -> Result<Arc<ThreadHandle>, Unwind> {
    match interp.core.heap.get(v).map(|o| match &o.data {
        Data::Thread(h) => Some(h.clone()),
        _ => None,
    }) {
        Some(Some(h)) => Ok(h),
        _ => Err(interp.raise(interp.core.c.type_error, "not a thread")),
    }
}

fn mutex_of(interp: &mut Interp, v: Value) -> Result<Arc<RubyMutex>, Unwind> {
    match interp.core.heap.get(v).map(|o| match &o.data {
        Data::Mutex(m) => Some(m.clone()),
        _ => None,
    }) {
        Some(Some(m)) => Ok(m),
        _ => Err(interp.raise(interp.core.c.type_error, "not a mutex")),
    }
}

fn thread_new(interp: &mut Interp, _: Value, args: &[Value], block: Option<Value>) -> Result<Value, Unwind> {
    let Some(block) = block else {
        return Err(interp.raise(interp.core.c.thread_error, "must be called with a block"));
    };
    interp.escape_block(block);
    let core = interp.core.clone();
    let handle = ThreadHandle::spawn(&core, block, args.to_vec())
        .map_err(|e| interp.raise(core.c.thread_error, &format!("can't create Thread: {e}")))?;
    Ok(core.heap.alloc(Object::new(core.c.thread, Data::Thread(handle))))
}

fn thread_join(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let handle = handle_of(interp, recv)?;
    match handle.wait(&interp.thread.kill) {
        None => Err(Unwind::Kill),
        Some(Outcome::Raised(exc)) => Err(interp.raise_value(exc)),
        Some(_) => Ok(recv),
    }
}

fn thread_value(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let handle = handle_of(interp, recv)?;
    match handle.wait(&interp.thread.kill) {
        None => Err(Unwind::Kill),
        Some(Outcome::Raised(exc)) => Err(interp.raise_value(exc)),
        Some(Outcome::Value(v)) => Ok(v),
        Some(Outcome::Killed) => Ok(Value::NIL),
    }
}

fn thread_alive(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    Ok(Value::bool(handle_of(interp, recv)?.is_alive()))
}

fn thread_kill(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let handle = handle_of(interp, recv)?;
    debug!(target: "garnet::thread", thread = handle.id, "kill requested");
    handle.request_kill();
    Ok(recv)
}

fn thread_status(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let handle = handle_of(interp, recv)?;
    Ok(handle.status(&interp.core))
}

fn mutex_new(interp: &mut Interp, _: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let core = &interp.core;
    Ok(core.heap.alloc(Object::new(core.c.mutex, Data::Mutex(Arc::new(RubyMutex::new())))))
}

fn lock(interp: &mut Interp, m: &RubyMutex) -> Result<(), Unwind> {
    match m.lock(interp.thread.id, &interp.thread.kill) {
        Ok(()) => Ok(()),
        Err(LockError::Recursive) => Err(interp.raise(interp.core.c.thread_error, "deadlock; recursive locking")),
        Err(LockError::Killed) => Err(Unwind::Kill),
    }
}

fn unlock(interp: &mut Interp, m: &RubyMutex) -> Result<(), Unwind> {
    if m.unlock(interp.thread.id) {
        Ok(())
    } else {
        Err(interp.raise(interp.core.c.thread_error, "Attempt to unlock a mutex which is not locked by this thread"))
    }
}

fn mutex_lock(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let m = mutex_of(interp, recv)?;
    lock(interp, &m)?;
    Ok(recv)
}

fn mutex_try_lock(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let m = mutex_of(interp, recv)?;
    Ok(Value::bool(m.try_lock(interp.thread.id)))
}

fn mutex_unlock(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let m = mutex_of(interp, recv)?;
    unlock(interp, &m)?;
    Ok(recv)
}

fn mutex_synchronize(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Result<Value, Unwind> {
    let m = mutex_of(interp, recv)?;
    let Some(block) = block else {
        return Err(interp.raise(interp.core.c.thread_error, "must be called with a block"));
    };
    lock(interp, &m)?;
    let result = interp.call_block(block, &[]);
    m.unlock(interp.thread.id);
    result
}

fn mutex_locked(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    Ok(Value::bool(mutex_of(interp, recv)?.is_locked()))
}

fn mutex_owned(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
    let m = mutex_of(interp, recv)?;
    Ok(Value::bool(m.owned_by(interp.thread.id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocking_is_an_error() {
        let m = RubyMutex::new();
        let kill = AtomicBool::new(false);
        assert_eq!(m.lock(1, &kill), Ok(()));
        assert_eq!(m.lock(1, &kill), Err(LockError::Recursive));
        assert!(m.owned_by(1));
    }

    #[test]
    fn only_the_owner_unlocks() {
        let m = RubyMutex::new();
        let kill = AtomicBool::new(false);
        m.lock(1, &kill).unwrap();
        assert!(!m.unlock(2));
        assert!(m.unlock(1));
        assert!(!m.is_locked());
    }

    #[test]
    fn waiting_lock_observes_kill() {
        let m = Arc::new(RubyMutex::new());
        let kill = Arc::new(AtomicBool::new(false));
        m.lock(1, &kill).unwrap();
        let waiter = {
            let m = m.clone();
            let kill = kill.clone();
            std::thread::spawn(move || m.lock(2, &kill))
        };
        std::thread::sleep(Duration::from_millis(30));
        kill.store(true, Ordering::Release);
        assert_eq!(waiter.join().unwrap(), Err(LockError::Killed));
    }

    #[test]
    fn lock_is_handed_over_on_unlock() {
        let m = Arc::new(RubyMutex::new());
        let kill = Arc::new(AtomicBool::new(false));
        m.lock(1, &kill).unwrap();
        let waiter = {
            let m = m.clone();
            let kill = kill.clone();
            std::thread::spawn(move || m.lock(2, &kill))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(m.unlock(1));
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert!(m.owned_by(2));
    }
}

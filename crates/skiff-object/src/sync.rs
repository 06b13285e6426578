//! Data side of the concurrency layer: cancellation, channels and routine
//! handles. Spawning lives in the VM crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;

use crate::{RuntimeError, Value};

// ---
// Cancellation
// ---

struct CancelInner {
    cancelled: AtomicBool,
    /// Dropped on cancel, which disconnects `signal` and wakes every
    /// `select!` waiting on it.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    parent: Option<Weak<CancelInner>>,
    children: Mutex<Vec<Weak<CancelInner>>>,
}

/// Cooperative cancellation shared by a VM and the routines it spawns.
/// Cancelling a token cancels all of its descendants.
#[derive(Clone)]
pub struct CancelToken(Arc<CancelInner>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Weak<CancelInner>>) -> Self {
        let (trigger, signal) = channel::bounded(0);
        Self(Arc::new(CancelInner {
            cancelled: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            signal,
            parent,
            children: Mutex::new(Vec::new()),
        }))
    }

    /// A token cancelled together with this one. The parent only holds it
    /// weakly.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::with_parent(Some(Arc::downgrade(&self.0)));
        let mut children = self.0.children.lock();
        if self.is_cancelled() {
            child.cancel();
        } else {
            children.retain(|c| c.upgrade().is_some_and(|c| !c.cancelled.load(Ordering::SeqCst)));
            children.push(Arc::downgrade(&child.0));
        }
        child
    }

    /// Stop being cancelled by the parent. Called once the task owning this
    /// token has finished.
    pub fn detach(&self) {
        let Some(parent) = self.0.parent.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let this = Arc::as_ptr(&self.0);
        parent
            .children
            .lock()
            .retain(|c| c.strong_count() > 0 && c.as_ptr() != this);
    }

    pub fn cancel(&self) {
        if self.0.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.trigger.lock().take();
        let children = std::mem::take(&mut *self.0.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            CancelToken(child).cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Becomes ready (disconnected) once the token is cancelled. For use in
    /// `select!`.
    pub fn signal(&self) -> &Receiver<()> {
        &self.0.signal
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancelToken(cancelled={})", self.is_cancelled())
    }
}

// ---
// Channels
// ---

/// A blocking handoff queue. Capacity zero makes every send wait for a
/// matching receive.
pub struct Channel {
    tx: Sender<Value>,
    rx: Receiver<Value>,
    closed: AtomicBool,
    close_trigger: Mutex<Option<Sender<()>>>,
    close_signal: Receiver<()>,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        let (close_trigger, close_signal) = channel::bounded(0);
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
            close_trigger: Mutex::new(Some(close_trigger)),
            close_signal,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Blocks until a receiver takes the value or buffer space frees up.
    pub fn send(&self, value: Value, cancel: &CancelToken) -> Result<(), RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Aborted);
        }
        if self.is_closed() {
            return Err(RuntimeError::SendOnClosedChannel);
        }
        select! {
            send(self.tx, value) -> _ => Ok(()),
            recv(self.close_signal) -> _ => Err(RuntimeError::SendOnClosedChannel),
            recv(cancel.signal()) -> _ => Err(RuntimeError::Aborted),
        }
    }

    /// Blocks until a value arrives. A closed and drained channel yields
    /// `undefined`.
    pub fn recv(&self, cancel: &CancelToken) -> Result<Value, RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Aborted);
        }
        if self.is_closed() {
            return Ok(self.rx.try_recv().unwrap_or_default());
        }
        select! {
            recv(self.rx) -> msg => Ok(msg.unwrap_or_default()),
            recv(self.close_signal) -> _ => Ok(self.rx.try_recv().unwrap_or_default()),
            recv(cancel.signal()) -> _ => Err(RuntimeError::Aborted),
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_trigger.lock().take();
            tracing::debug!("channel closed");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel(closed={})", self.is_closed())
    }
}

// ---
// Routines
// ---

/// Handle to a spawned task.
pub struct Routine {
    token: CancelToken,
    result: Mutex<Option<Result<Value, String>>>,
    done_trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

impl Routine {
    pub fn new(token: CancelToken) -> Self {
        let (done_trigger, done) = channel::bounded(0);
        Self {
            token,
            result: Mutex::new(None),
            done_trigger: Mutex::new(Some(done_trigger)),
            done,
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Record the task's outcome and wake every waiter.
    pub fn finish(&self, result: Result<Value, String>) {
        *self.result.lock() = Some(result);
        self.done_trigger.lock().take();
        self.token.detach();
    }

    pub fn is_done(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Wait for the task to finish. Returns `false` if `timeout` elapsed
    /// first.
    pub fn wait(
        &self,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<bool, RuntimeError> {
        if self.is_done() {
            return Ok(true);
        }
        if cancel.is_cancelled() {
            return Err(RuntimeError::Aborted);
        }
        match timeout {
            Some(timeout) => select! {
                recv(self.done) -> _ => Ok(true),
                recv(cancel.signal()) -> _ => Err(RuntimeError::Aborted),
                default(timeout) => Ok(self.is_done()),
            },
            None => select! {
                recv(self.done) -> _ => Ok(true),
                recv(cancel.signal()) -> _ => Err(RuntimeError::Aborted),
            },
        }
    }

    /// The task's return value, or an error value when it failed. Waits for
    /// completion first.
    pub fn result(&self, cancel: &CancelToken) -> Result<Value, RuntimeError> {
        self.wait(None, cancel)?;
        Ok(match &*self.result.lock() {
            Some(Ok(value)) => value.clone(),
            Some(Err(message)) => Value::error_message(message.as_str()),
            None => Value::Undefined,
        })
    }

    pub fn abort(&self) {
        tracing::debug!("routine aborted");
        self.token.cancel();
    }
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Routine(done={})", self.is_done())
    }
}

// ---
// Bound methods
// ---

/// A method looked up on a routine or channel, bound to its receiver.
#[derive(Debug)]
pub enum Method {
    Wait(Arc<Routine>),
    Result(Arc<Routine>),
    Abort(Arc<Routine>),
    Send(Arc<Channel>),
    Recv(Arc<Channel>),
    Close(Arc<Channel>),
}

impl Method {
    pub fn for_routine(routine: &Arc<Routine>, name: &str) -> Option<Method> {
        let routine = routine.clone();
        Some(match name {
            "wait" => Method::Wait(routine),
            "result" => Method::Result(routine),
            "abort" => Method::Abort(routine),
            _ => return None,
        })
    }

    pub fn for_channel(channel: &Arc<Channel>, name: &str) -> Option<Method> {
        let channel = channel.clone();
        Some(match name {
            "send" => Method::Send(channel),
            "recv" => Method::Recv(channel),
            "close" => Method::Close(channel),
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Wait(_) => "wait",
            Method::Result(_) => "result",
            Method::Abort(_) => "abort",
            Method::Send(_) => "send",
            Method::Recv(_) => "recv",
            Method::Close(_) => "close",
        }
    }

    /// Invoke the method on behalf of the task owning `cancel`.
    pub fn call(&self, args: &[Value], cancel: &CancelToken) -> Result<Value, RuntimeError> {
        let arity = |want: usize| {
            if args.len() == want {
                Ok(())
            } else {
                Err(RuntimeError::WrongNumArguments {
                    want,
                    got: args.len(),
                })
            }
        };
        match self {
            Method::Wait(routine) => {
                let timeout = match args {
                    [] => None,
                    [Value::Int(secs)] => u64::try_from(*secs).ok().map(Duration::from_secs),
                    [Value::Float(secs)] if *secs >= 0.0 => Some(Duration::from_secs_f64(*secs)),
                    [Value::Float(_)] => None,
                    [other] => {
                        return Err(RuntimeError::InvalidArgumentType {
                            name: "timeout".into(),
                            expected: "int or float",
                            found: other.type_name(),
                        })
                    }
                    _ => {
                        return Err(RuntimeError::WrongNumArguments {
                            want: 1,
                            got: args.len(),
                        })
                    }
                };
                routine.wait(timeout, cancel).map(Value::Bool)
            }
            Method::Result(routine) => {
                arity(0)?;
                routine.result(cancel)
            }
            Method::Abort(routine) => {
                arity(0)?;
                routine.abort();
                Ok(Value::Undefined)
            }
            Method::Send(channel) => {
                arity(1)?;
                channel.send(args[0].clone(), cancel)?;
                Ok(Value::Undefined)
            }
            Method::Recv(channel) => {
                arity(0)?;
                channel.recv(cancel)
            }
            Method::Close(channel) => {
                arity(0)?;
                channel.close();
                Ok(Value::Undefined)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_propagates_to_children() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn test_finished_routines_release_their_tokens() {
        let parent = CancelToken::new();
        let mut routines = Vec::new();
        for i in 0..1000 {
            let routine = Routine::new(parent.child());
            routine.finish(Ok(Value::Int(i)));
            routines.push(routine);
        }
        assert_eq!(parent.0.children.lock().len(), 0);

        let running = Routine::new(parent.child());
        assert_eq!(parent.0.children.lock().len(), 1);
        parent.cancel();
        assert!(running.token().is_cancelled());
        assert!(!routines[0].token().is_cancelled());
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let parent = CancelToken::new();
        for _ in 0..100 {
            drop(parent.child());
        }
        let _kept = parent.child();
        assert_eq!(parent.0.children.lock().len(), 1);
    }

    #[test]
    fn test_unbuffered_exchange() {
        let ch = Arc::new(Channel::new(0));
        let token = CancelToken::new();
        let sender = {
            let ch = ch.clone();
            let token = token.clone();
            thread::spawn(move || ch.send(Value::Int(7), &token))
        };
        assert_eq!(ch.recv(&token).unwrap(), Value::Int(7));
        assert!(sender.join().unwrap().is_ok());
    }

    #[test]
    fn test_closed_channel() {
        let ch = Channel::new(1);
        let token = CancelToken::new();
        ch.send(Value::Int(1), &token).unwrap();
        ch.close();
        assert_eq!(ch.recv(&token).unwrap(), Value::Int(1));
        assert_eq!(ch.recv(&token).unwrap(), Value::Undefined);
        assert_eq!(
            ch.send(Value::Int(2), &token),
            Err(RuntimeError::SendOnClosedChannel)
        );
    }

    #[test]
    fn test_recv_aborts_on_cancel() {
        let ch = Arc::new(Channel::new(0));
        let token = CancelToken::new();
        let waiter = {
            let ch = ch.clone();
            let token = token.clone();
            thread::spawn(move || ch.recv(&token))
        };
        token.cancel();
        assert_eq!(waiter.join().unwrap(), Err(RuntimeError::Aborted));
    }

    #[test]
    fn test_routine_wait_timeout() {
        let routine = Routine::new(CancelToken::new());
        let caller = CancelToken::new();
        assert!(!routine.wait(Some(Duration::from_millis(10)), &caller).unwrap());
        routine.finish(Ok(Value::Int(3)));
        assert!(routine.wait(None, &caller).unwrap());
        assert_eq!(routine.result(&caller).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_routine_failure_is_error_value() {
        let routine = Routine::new(CancelToken::new());
        routine.finish(Err("boom".into()));
        let result = routine.result(&CancelToken::new()).unwrap();
        assert_eq!(result, Value::error_message("boom"));
    }
}

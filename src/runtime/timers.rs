//! `setTimeout` / `clearTimeout` backed by the host's delayed task queue.
//!
//! The callback and its realm are held as remote handles in the host's
//! [`TimerTable`]; the delayed task only carries the timer id. Clearing a
//! timer drops its handles at once, so they expire through the normal path
//! instead of waiting for the deadline.

use crate::runtime::error::ScriptError;
use crate::runtime::host::{HostShared, HostTask};
use crate::runtime::lock::{self, Lock};
use crate::runtime::remote::SharedRemote;
use crate::runtime::task_queue::TaskPriority;
use deno_core::v8;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Callback of a pending timer and the realm it was scheduled from.
pub struct PendingTimer {
    callback: SharedRemote<v8::Function>,
    context: SharedRemote<v8::Context>,
}

/// Pending timers of one host, keyed by id.
pub struct TimerTable<T = PendingTimer> {
    next_id: u32,
    pending: HashMap<u32, T>,
}

impl<T> Default for TimerTable<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
        }
    }
}

impl<T> TimerTable<T> {
    pub fn insert(&mut self, timer: T) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.pending.contains_key(&self.next_id) {
                break;
            }
        }
        self.pending.insert(self.next_id, timer);
        self.next_id
    }

    /// Take the timer out if it is still pending.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.pending.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let exception = v8::Exception::type_error(scope, message);
        scope.throw_exception(exception);
    }
}

pub(crate) fn set_timeout<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    let Ok(callback) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
        throw_type_error(scope, "setTimeout callback must be a function");
        return;
    };
    // `None` means converting the delay threw; the exception is pending.
    let Some(delay) = args.get(1).number_value(scope) else {
        return;
    };
    let delay = if delay.is_finite() && delay > 0.0 { delay } else { 0.0 };

    let Some(host) = scope.get_slot::<Arc<HostShared>>().cloned() else {
        return;
    };
    let context = scope.get_current_context();
    let timer = PendingTimer {
        callback: SharedRemote::new(scope, callback),
        context: SharedRemote::new(scope, context),
    };
    let id = lock::with_current(|env| env.timers().borrow_mut().insert(timer));

    let task: HostTask = Box::new(move |lock: &mut Lock<'_>| {
        lock.begin_tick();
        fire(lock, id);
    });
    if host
        .runner()
        .post_delayed(TaskPriority::UserVisible, Duration::from_millis(delay as u64), task)
        .is_err()
    {
        let timer = lock::with_current(|env| env.timers().borrow_mut().remove(id));
        drop(timer);
        return;
    }

    rv.set_double(f64::from(id));
}

pub(crate) fn clear_timeout<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    _rv: v8::ReturnValue,
) {
    let Some(id) = args.get(0).number_value(scope) else {
        return;
    };
    if id.is_finite() && id >= 1.0 && id <= f64::from(u32::MAX) {
        let timer = lock::with_current(|env| env.timers().borrow_mut().remove(id as u32));
        drop(timer);
    }
}

fn fire(lock: &mut Lock<'_>, id: u32) {
    let timer = lock.env().timers().borrow_mut().remove(id);
    let Some(PendingTimer { callback, context }) = timer else {
        return;
    };

    let host_id = lock.host_id();
    let scope = &mut v8::HandleScope::new(lock.isolate());
    let context = context.deref(scope);
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let callback = callback.deref(tc);
    let receiver = v8::undefined(tc).into();
    if callback.call(tc, receiver, &[]).is_none() {
        let err = ScriptError::from_try_catch(tc);
        warn!(host = host_id, timer = id, %err, "uncaught exception in timer callback");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_ids_are_unique_and_nonzero() {
        let mut table = TimerTable::default();
        let first = table.insert("a");
        let second = table.insert("b");
        assert_ne!(first, 0);
        assert_ne!(first, second);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_returns_pending_timer() {
        let mut table = TimerTable::default();
        let id = table.insert("callback");
        assert_eq!(table.remove(id), Some("callback"));
        assert_eq!(table.remove(id), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_skip_pending_after_wraparound() {
        let mut table = TimerTable::default();
        let kept = table.insert(());
        table.next_id = u32::MAX;
        let wrapped = table.insert(());
        assert_eq!(wrapped, kept + 1);
    }
}

//! Realms: independent global scopes inside one host.
//!
//! Every realm is bootstrapped so that `Date` reads the host clock, the first
//! realm of a seeded host gets a deterministic `Math.random`, and
//! `setTimeout`/`clearTimeout` are wired to the host's delayed task queue.

use crate::runtime::error::{ErrorKind, ScriptError};
use crate::runtime::lock::{self, Lock};
use crate::runtime::remote::SharedRemote;
use crate::runtime::timers;
use deno_core::v8;
use std::ops::{Deref, DerefMut};

const BOOTSTRAP: &str = r#"(function (now, seed, setTimeout, clearTimeout) {
  "use strict";
  const NativeDate = globalThis.Date;
  Object.defineProperty(NativeDate, "now", {
    value: now, writable: true, configurable: true,
  });
  const HostDate = new Proxy(NativeDate, {
    construct(target, args, newTarget) {
      return Reflect.construct(target, args.length === 0 ? [now()] : args, newTarget);
    },
    apply() {
      return new NativeDate(now()).toString();
    },
  });
  Object.defineProperty(globalThis, "Date", {
    value: HostDate, writable: true, configurable: true,
  });

  if (seed !== undefined) {
    let state = seed >>> 0;
    Object.defineProperty(Math, "random", {
      value: function random() {
        state = (state + 0x6d2b79f5) | 0;
        let t = Math.imul(state ^ (state >>> 15), 1 | state);
        t = (t + Math.imul(t ^ (t >>> 7), 61 | t)) ^ t;
        return ((t ^ (t >>> 14)) >>> 0) / 4294967296;
      },
      writable: true, configurable: true,
    });
  }

  for (const [name, fn] of [["setTimeout", setTimeout], ["clearTimeout", clearTimeout]]) {
    Object.defineProperty(globalThis, name, {
      value: fn, writable: true, configurable: true,
    });
  }
})"#;

fn clock_now<'s>(
    _scope: &mut v8::HandleScope<'s>,
    _args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    let now = lock::with_current(|env| env.clock_time_ms());
    rv.set_double(now as f64);
}

/// One global object inside a host's isolate.
#[derive(Clone)]
pub struct Realm {
    context: SharedRemote<v8::Context>,
}

impl Realm {
    /// Create and bootstrap a new realm.
    pub fn make(lock: &mut Lock<'_>) -> Result<Realm, ScriptError> {
        let env = lock.env().clone();
        let scope = &mut v8::HandleScope::new(lock.isolate());
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);
        let tc = &mut v8::TryCatch::new(scope);

        let source = v8::String::new(tc, BOOTSTRAP)
            .ok_or_else(|| ScriptError::conversion("bootstrap source"))?;
        let Some(script) = v8::Script::compile(tc, source, None) else {
            return Err(ScriptError::from_try_catch(tc));
        };
        let Some(bootstrap) = script.run(tc) else {
            return Err(ScriptError::from_try_catch(tc));
        };
        let bootstrap = v8::Local::<v8::Function>::try_from(bootstrap)
            .map_err(|_| ScriptError::conversion("bootstrap did not evaluate to a function"))?;

        let (Some(now), Some(set_timeout), Some(clear_timeout)) = (
            v8::Function::new(tc, clock_now),
            v8::Function::new(tc, timers::set_timeout),
            v8::Function::new(tc, timers::clear_timeout),
        ) else {
            return Err(ScriptError::new(
                ErrorKind::Error,
                "Error",
                "failed to create realm natives",
            ));
        };
        // The seed is single-use; only the first realm that bootstraps keeps it.
        let taken = env.take_random_seed();
        let seed: v8::Local<v8::Value> = match taken {
            Some(seed) => v8::Number::new(tc, seed).into(),
            None => v8::undefined(tc).into(),
        };
        let args = [now.into(), seed, set_timeout.into(), clear_timeout.into()];
        let receiver = v8::undefined(tc).into();
        if bootstrap.call(tc, receiver, &args).is_none() {
            if let Some(seed) = taken {
                env.restore_random_seed(seed);
            }
            return Err(ScriptError::from_try_catch(tc));
        }

        Ok(Realm {
            context: SharedRemote::new(tc, context),
        })
    }

    /// Enter this realm and run `f` inside it.
    pub fn invoke<R>(
        &self,
        lock: &mut Lock<'_>,
        f: impl FnOnce(&mut RealmScope<'_, '_>) -> R,
    ) -> R {
        let scope = &mut v8::HandleScope::new(lock.isolate());
        let context = self.context.deref(scope);
        let scope = &mut v8::ContextScope::new(scope, context);
        let mut realm_scope = RealmScope { scope, realm: self };
        f(&mut realm_scope)
    }

    pub fn context(&self) -> &SharedRemote<v8::Context> {
        &self.context
    }

    pub fn host_id(&self) -> u64 {
        self.context.host_id()
    }
}

/// Witness for "inside this realm, with the lock held". Derefs to the entered
/// handle scope.
pub struct RealmScope<'a, 's> {
    scope: &'a mut v8::HandleScope<'s>,
    realm: &'a Realm,
}

impl<'a, 's> RealmScope<'a, 's> {
    pub fn realm(&self) -> &Realm {
        self.realm
    }

    pub fn handle_scope(&mut self) -> &mut v8::HandleScope<'s> {
        &mut *self.scope
    }

    pub fn context(&mut self) -> v8::Local<'s, v8::Context> {
        self.scope.get_current_context()
    }

    pub fn global(&mut self) -> v8::Local<'s, v8::Object> {
        let context = self.scope.get_current_context();
        context.global(self.scope)
    }

    /// Set a property on the realm's global object.
    pub fn set_global(&mut self, name: &str, value: v8::Local<'s, v8::Value>) -> bool {
        let Some(key) = v8::String::new(self.scope, name) else {
            return false;
        };
        let global = self.global();
        global.set(self.scope, key.into(), value).unwrap_or(false)
    }

    /// Read a property of the realm's global object.
    pub fn get_global(&mut self, name: &str) -> Option<v8::Local<'s, v8::Value>> {
        let key = v8::String::new(self.scope, name)?;
        let global = self.global();
        global.get(self.scope, key.into())
    }
}

impl<'s> Deref for RealmScope<'_, 's> {
    type Target = v8::HandleScope<'s>;

    fn deref(&self) -> &Self::Target {
        &*self.scope
    }
}

impl<'s> DerefMut for RealmScope<'_, 's> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.scope
    }
}

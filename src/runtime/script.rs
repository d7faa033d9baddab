//! Script and module compilation and evaluation.
//!
//! Compilation happens in the host's scratch context and yields
//! context-independent code held through remote handles. Running binds that
//! code to a realm. Every engine call is wrapped in a `TryCatch` and failures
//! come back as [`ScriptError`] values.

use crate::runtime::error::{ErrorKind, ScriptError};
use crate::runtime::js_value::JsValue;
use crate::runtime::lock::Lock;
use crate::runtime::realm::RealmScope;
use crate::runtime::remote::SharedRemote;
use deno_core::v8;
use std::cell::RefCell;
use std::collections::HashMap;

/// Line/column offset of the source text, zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: i32,
    pub column: i32,
}

/// Where a piece of source text came from, for stack traces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceOrigin {
    pub name: Option<String>,
    pub location: Option<SourceLocation>,
}

impl SourceOrigin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            location: None,
        }
    }

    pub fn with_location(mut self, line: i32, column: i32) -> Self {
        self.location = Some(SourceLocation { line, column });
        self
    }

    fn to_v8<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        is_module: bool,
    ) -> v8::ScriptOrigin<'s> {
        let name = self.name.as_deref().unwrap_or("<anonymous>");
        let resource_name =
            v8::String::new(scope, name).unwrap_or_else(|| v8::String::empty(scope));
        let location = self.location.unwrap_or_default();
        v8::ScriptOrigin::new(
            scope,
            resource_name.into(),
            location.line,
            location.column,
            false,
            -1,
            None,
            false,
            false,
            is_module,
            None,
        )
    }
}

fn source_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    code: &str,
) -> Result<v8::Local<'s, v8::String>, ScriptError> {
    v8::String::new(scope, code).ok_or_else(|| {
        ScriptError::new(ErrorKind::RangeError, "RangeError", "source text is too large")
    })
}

/// A compiled classic script, runnable in any realm of its host.
#[derive(Clone)]
pub struct Script {
    unbound: SharedRemote<v8::UnboundScript>,
}

impl Script {
    pub fn compile(
        lock: &mut Lock<'_>,
        code: &str,
        origin: &SourceOrigin,
    ) -> Result<Script, ScriptError> {
        lock.with_scratch_scope(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            let code = source_string(tc, code)?;
            let origin = origin.to_v8(tc, false);
            let mut source = v8::script_compiler::Source::new(code, Some(&origin));
            match v8::script_compiler::compile_unbound_script(
                tc,
                &mut source,
                v8::script_compiler::CompileOptions::NoCompileOptions,
                v8::script_compiler::NoCacheReason::NoReason,
            ) {
                Some(unbound) => Ok(Script {
                    unbound: SharedRemote::new(tc, unbound),
                }),
                None => Err(ScriptError::from_try_catch(tc)),
            }
        })
    }

    /// Run in the realm entered by `scope` and transfer the completion value.
    pub fn run(&self, scope: &mut RealmScope<'_, '_>) -> Result<JsValue, ScriptError> {
        let tc = &mut v8::TryCatch::new(scope.handle_scope());
        let unbound = self.unbound.deref(tc);
        let script = unbound.bind_to_current_context(tc);
        match script.run(tc) {
            Some(value) => JsValue::from_v8(tc, value).map_err(ScriptError::conversion),
            None => Err(ScriptError::from_try_catch(tc)),
        }
    }
}

thread_local! {
    // Import tables of the `link` calls in progress on this thread.
    static LINK_TABLES: RefCell<Vec<HashMap<String, v8::Global<v8::Module>>>> =
        const { RefCell::new(Vec::new()) };
}

struct LinkTableGuard;

impl LinkTableGuard {
    fn push(table: HashMap<String, v8::Global<v8::Module>>) -> Self {
        LINK_TABLES.with(|tables| tables.borrow_mut().push(table));
        LinkTableGuard
    }
}

impl Drop for LinkTableGuard {
    fn drop(&mut self) {
        let table = LINK_TABLES.with(|tables| tables.borrow_mut().pop());
        drop(table);
    }
}

fn resolve_import<'s>(
    context: v8::Local<'s, v8::Context>,
    specifier: v8::Local<'s, v8::String>,
    _import_attributes: v8::Local<'s, v8::FixedArray>,
    _referrer: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Module>> {
    // SAFETY: invoked by V8 during instantiation, inside the context's isolate.
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let specifier = specifier.to_rust_string_lossy(scope);

    let found = LINK_TABLES.with(|tables| {
        tables
            .borrow()
            .last()
            .and_then(|table| table.get(&specifier))
            .map(|module| v8::Local::new(scope, module))
    });
    if found.is_none() {
        let message = format!("Cannot resolve module \"{specifier}\"");
        if let Some(message) = v8::String::new(scope, &message) {
            let exception = v8::Exception::error(scope, message);
            scope.throw_exception(exception);
        }
    }
    found
}

/// A compiled ES module.
#[derive(Clone)]
pub struct Module {
    module: SharedRemote<v8::Module>,
}

impl Module {
    pub fn compile(
        lock: &mut Lock<'_>,
        code: &str,
        origin: &SourceOrigin,
    ) -> Result<Module, ScriptError> {
        lock.with_scratch_scope(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            let code = source_string(tc, code)?;
            let origin = origin.to_v8(tc, true);
            let mut source = v8::script_compiler::Source::new(code, Some(&origin));
            match v8::script_compiler::compile_module(tc, &mut source) {
                Some(module) => Ok(Module {
                    module: SharedRemote::new(tc, module),
                }),
                None => Err(ScriptError::from_try_catch(tc)),
            }
        })
    }

    /// Import specifiers requested by this module, in source order.
    pub fn requests(&self, lock: &mut Lock<'_>) -> Vec<String> {
        lock.with_scratch_scope(|scope| {
            let module = self.module.deref(scope);
            let requests = module.get_module_requests();
            (0..requests.length())
                .filter_map(|index| {
                    let request = requests.get(scope, index)?;
                    let request = v8::Local::<v8::ModuleRequest>::try_from(request).ok()?;
                    Some(request.get_specifier().to_rust_string_lossy(scope))
                })
                .collect()
        })
    }

    /// Instantiate against `imports`, keyed by specifier. Nested imports of
    /// imported modules resolve against the same table.
    pub fn link(
        &self,
        scope: &mut RealmScope<'_, '_>,
        imports: &HashMap<String, Module>,
    ) -> Result<(), ScriptError> {
        let tc = &mut v8::TryCatch::new(scope.handle_scope());
        let table = imports
            .iter()
            .map(|(specifier, module)| {
                let local = module.module.deref(tc);
                (specifier.clone(), v8::Global::new(tc, local))
            })
            .collect();

        let module = self.module.deref(tc);
        let _guard = LinkTableGuard::push(table);
        match module.instantiate_module(tc, resolve_import) {
            Some(true) => Ok(()),
            _ => Err(ScriptError::from_try_catch(tc)),
        }
    }

    /// Evaluate a linked module and transfer its namespace object.
    pub fn evaluate(&self, scope: &mut RealmScope<'_, '_>) -> Result<JsValue, ScriptError> {
        let tc = &mut v8::TryCatch::new(scope.handle_scope());
        let module = self.module.deref(tc);
        if module.get_status() == v8::ModuleStatus::Uninstantiated {
            return Err(ScriptError::new(
                ErrorKind::ReferenceError,
                "ReferenceError",
                "module must be linked before evaluation",
            ));
        }

        let Some(completion) = module.evaluate(tc) else {
            return Err(ScriptError::from_try_catch(tc));
        };
        tc.perform_microtask_checkpoint();

        if module.get_status() == v8::ModuleStatus::Errored {
            let exception = v8::Local::new(tc, module.get_exception());
            return Err(ScriptError::from_exception(tc, exception));
        }
        if let Ok(promise) = v8::Local::<v8::Promise>::try_from(completion) {
            match promise.state() {
                v8::PromiseState::Pending => {
                    return Err(ScriptError::new(
                        ErrorKind::Error,
                        "Error",
                        "module evaluation did not settle",
                    ));
                }
                v8::PromiseState::Rejected => {
                    let reason = promise.result(tc);
                    return Err(ScriptError::from_exception(tc, reason));
                }
                v8::PromiseState::Fulfilled => {}
            }
        }

        let namespace = v8::Local::new(tc, module.get_module_namespace());
        JsValue::from_v8(tc, namespace).map_err(ScriptError::conversion)
    }
}

//! Execution contexts and the script-visible object tree.
//!
//! A [`Context`] owns one engine instance. All of its state that the engine
//! dispatches into — the global function map, the object registry, the error
//! sink — is confined to the engine owner thread and only ever touched from
//! there; the `Context` value held by callers is a cheap cloneable handle
//! that routes every operation through the affinity executor.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::binding::{FnBinding, IntoHostFn};
use crate::engine::{self, Dispatch, InstanceId, ObjectId, GLOBAL_SCOPE};
use crate::error::{Error, ErrorReport, Result};
use crate::executor;
use crate::proxy::{proxy_slots, PropertySlot};

/// Synthetic source identifier used for every eval/exec chunk. The engine's
/// error reporter is handed this exact string, so sink lookup is always an
/// exact match.
const EVAL_SOURCE: &str = "eval";

/// Sink bucket for failures that could not be attributed to a source.
const FATAL_SOURCE: &str = "__fatal__";

/// Captures uncaught engine errors until the evaluation that triggered them
/// consumes them.
#[derive(Default)]
struct ErrorSink {
    reports: HashMap<String, ErrorReport>,
}

impl ErrorSink {
    fn record(&mut self, source: &str, line: u32, message: &str) {
        self.reports.insert(
            source.to_string(),
            ErrorReport {
                source: source.to_string(),
                line,
                message: message.to_string(),
            },
        );
    }

    /// Remove and return the report for `source`, falling back to the fatal
    /// bucket.
    fn take(&mut self, source: &str) -> Option<ErrorReport> {
        self.reports
            .remove(source)
            .or_else(|| self.reports.remove(FATAL_SOURCE))
    }
}

#[derive(Default)]
struct ObjectState {
    funcs: HashMap<String, Rc<FnBinding>>,
    props: HashMap<String, Rc<PropertySlot>>,
}

#[derive(Default)]
struct ContextState {
    funcs: HashMap<String, Rc<FnBinding>>,
    objects: HashMap<ObjectId, ObjectState>,
    sink: ErrorSink,
}

thread_local! {
    static CONTEXTS: RefCell<HashMap<InstanceId, Rc<RefCell<ContextState>>>> =
        RefCell::new(HashMap::new());
}

fn state_of(id: InstanceId) -> Option<Rc<RefCell<ContextState>>> {
    CONTEXTS.with(|map| map.borrow().get(&id).cloned())
}

/// Routes engine callbacks to the owning context's state.
struct Router;

impl Dispatch for Router {
    fn call(
        &self,
        instance: InstanceId,
        scope: ObjectId,
        name: &str,
        args_json: &str,
    ) -> std::result::Result<String, String> {
        let Some(state) = state_of(instance) else {
            return Err("attempt to use context after destroy".to_string());
        };
        let binding = {
            let state = state.borrow();
            if scope == GLOBAL_SCOPE {
                state.funcs.get(name).cloned().ok_or_else(|| {
                    format!("attempt to call global function {name} that doesn't appear to exist")
                })?
            } else {
                let object = state.objects.get(&scope).ok_or_else(|| {
                    "attempt to use object that doesn't appear to exist".to_string()
                })?;
                object.funcs.get(name).cloned().ok_or_else(|| {
                    format!("attempt to call function {name} that doesn't appear to exist")
                })?
            }
        };
        // the borrow is released before invoking: the callable may define
        // further bindings on this same context
        binding.call(args_json).map_err(|err| err.to_string())
    }

    fn get_prop(
        &self,
        instance: InstanceId,
        scope: ObjectId,
        name: &str,
    ) -> std::result::Result<String, String> {
        let slot = prop_slot(instance, scope, name)?;
        slot.get().map_err(|err| err.to_string())
    }

    fn set_prop(
        &self,
        instance: InstanceId,
        scope: ObjectId,
        name: &str,
        value_json: &str,
    ) -> std::result::Result<String, String> {
        let slot = prop_slot(instance, scope, name)?;
        slot.set(value_json).map_err(|err| err.to_string())
    }

    fn report(&self, instance: InstanceId, source: &str, line: u32, message: &str) {
        let Some(state) = state_of(instance) else {
            return;
        };
        state.borrow_mut().sink.record(source, line, message);
    }
}

fn prop_slot(
    instance: InstanceId,
    scope: ObjectId,
    name: &str,
) -> std::result::Result<Rc<PropertySlot>, String> {
    let Some(state) = state_of(instance) else {
        return Err("attempt to use context after destroy".to_string());
    };
    let state = state.borrow();
    let object = state
        .objects
        .get(&scope)
        .ok_or_else(|| "attempt to use object that doesn't appear to exist".to_string())?;
    object.props.get(name).cloned().ok_or_else(|| {
        format!("attempt to use property {name} that doesn't appear to exist")
    })
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

struct ContextInner {
    id: InstanceId,
    valid: AtomicBool,
}

impl ContextInner {
    fn teardown(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            let id = self.id;
            executor::global().submit(move || {
                engine::destroy_instance(id);
                let state = CONTEXTS.with(|map| map.borrow_mut().remove(&id));
                drop(state);
                debug!(instance = id.0, "script context destroyed");
            });
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// One embedded script context: an engine instance plus its bindings.
///
/// Cloning yields another handle to the same context; handles may be used
/// from any thread. Call [`Context::destroy`] when done — dropping the last
/// handle destroys the context too, unless a binding captured its own
/// context, in which case only an explicit `destroy` breaks the cycle.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context with an empty global namespace.
    pub fn new() -> Self {
        let id = InstanceId(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed));
        executor::global().submit(move || {
            engine::create_instance(id, Rc::new(Router))
                .unwrap_or_else(|err| panic!("failed to create script context: {err}"));
            CONTEXTS.with(|map| {
                map.borrow_mut()
                    .insert(id, Rc::new(RefCell::new(ContextState::default())));
            });
            debug!(instance = id.0, "script context created");
        });
        Self {
            inner: Arc::new(ContextInner {
                id,
                valid: AtomicBool::new(true),
            }),
        }
    }

    /// Evaluate script source and decode the result into `T`.
    ///
    /// Scalars decode directly, script objects decode into structs/maps by
    /// member name, arrays into sequences; [`crate::Raw`] targets receive the
    /// result's exact JSON text.
    pub fn eval<T: DeserializeOwned>(&self, source: &str) -> Result<T> {
        let json = self.eval_json(source)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Execute script source, discarding any produced value.
    pub fn exec(&self, source: &str) -> Result<()> {
        self.ensure_valid();
        let id = self.inner.id;
        let source = source.to_string();
        executor::global().submit(move || {
            if engine::exec(id, &source, EVAL_SOURCE) {
                Ok(())
            } else {
                Err(failure(id, EVAL_SOURCE))
            }
        })
    }

    /// Execute script source read from `reader`.
    pub fn exec_from(&self, mut reader: impl Read) -> Result<()> {
        let mut source = String::new();
        reader.read_to_string(&mut source)?;
        self.exec(&source)
    }

    /// Execute a script file.
    pub fn exec_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::open(path)?;
        self.exec_from(file)
    }

    /// Define a global function callable from script.
    ///
    /// Redefining a name overwrites the previous binding.
    pub fn define_function<A, R, F>(&self, name: &str, function: F)
    where
        F: IntoHostFn<A, R>,
    {
        self.ensure_valid();
        define_function_at(self.inner.id, None, function.into_binding(name));
    }

    /// Define an empty namespace object in the global scope.
    pub fn define_object(&self, name: &str) -> Object {
        self.define_object_at(None, name, Vec::new())
    }

    /// Define a namespace object whose properties mirror `proxy`'s fields.
    ///
    /// Reads and writes from script go through the shared instance, so
    /// script-side writes are observable on `proxy` and vice versa.
    pub fn define_object_with<P>(&self, name: &str, proxy: &Arc<Mutex<P>>) -> Object
    where
        P: Serialize + DeserializeOwned + Send + 'static,
    {
        let slots = proxy_slots(proxy);
        self.define_object_at(None, name, slots)
    }

    /// Tear down the engine instance. Any later operation on this context
    /// panics.
    pub fn destroy(&self) {
        self.inner.teardown();
    }

    fn eval_json(&self, source: &str) -> Result<String> {
        self.ensure_valid();
        let id = self.inner.id;
        let source = source.to_string();
        executor::global().submit(move || match engine::eval_json(id, &source, EVAL_SOURCE) {
            Some(json) => Ok(json),
            None => Err(failure(id, EVAL_SOURCE)),
        })
    }

    fn define_object_at(
        &self,
        parent: Option<ObjectId>,
        name: &str,
        slots: Vec<PropertySlot>,
    ) -> Object {
        self.ensure_valid();
        let id = self.inner.id;
        let name = name.to_string();
        let object_id = executor::global().submit(move || {
            let object_id = engine::define_object(id, parent, &name)
                .unwrap_or_else(|err| panic!("failed to define object {name}: {err}"));
            let Some(state) = state_of(id) else {
                panic!("attempt to use context after destroy");
            };
            let mut object = ObjectState::default();
            for slot in slots {
                engine::define_property(id, object_id, slot.name()).unwrap_or_else(|err| {
                    panic!("failed to define property {}: {err}", slot.name())
                });
                object.props.insert(slot.name().to_string(), Rc::new(slot));
            }
            state.borrow_mut().objects.insert(object_id, object);
            object_id
        });
        Object {
            cx: self.clone(),
            id: object_id,
        }
    }

    fn ensure_valid(&self) {
        assert!(
            self.inner.valid.load(Ordering::SeqCst),
            "attempt to use context after destroy"
        );
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("instance", &self.inner.id.0)
            .field("valid", &self.inner.valid.load(Ordering::SeqCst))
            .finish()
    }
}

fn define_function_at(id: InstanceId, parent: Option<ObjectId>, binding: FnBinding) {
    let name = binding.name().to_string();
    executor::global().submit(move || {
        engine::define_function(id, parent, &name)
            .unwrap_or_else(|err| panic!("failed to define function {name}: {err}"));
        let Some(state) = state_of(id) else {
            panic!("attempt to use context after destroy");
        };
        let mut state = state.borrow_mut();
        match parent {
            None => {
                state.funcs.insert(name, Rc::new(binding));
            }
            Some(parent) => {
                let object = state
                    .objects
                    .get_mut(&parent)
                    .unwrap_or_else(|| panic!("unknown object handle {}", parent.0));
                object.funcs.insert(name, Rc::new(binding));
            }
        }
    });
}

fn failure(id: InstanceId, source: &str) -> Error {
    let report = state_of(id).and_then(|state| state.borrow_mut().sink.take(source));
    match report {
        Some(report) => {
            debug!(%report, "script evaluation failed");
            Error::Script(report)
        }
        None => {
            warn!(source, "script failed but no error report was captured");
            Error::NoReport
        }
    }
}

/// A script-visible namespace object; supports nesting and function bindings
/// of its own.
#[derive(Clone, Debug)]
pub struct Object {
    cx: Context,
    id: ObjectId,
}

impl Object {
    /// Define a function under this namespace.
    pub fn define_function<A, R, F>(&self, name: &str, function: F)
    where
        F: IntoHostFn<A, R>,
    {
        self.cx.ensure_valid();
        define_function_at(self.cx.inner.id, Some(self.id), function.into_binding(name));
    }

    /// Define a nested namespace object.
    pub fn define_object(&self, name: &str) -> Object {
        self.cx.define_object_at(Some(self.id), name, Vec::new())
    }

    /// Define a nested namespace object proxying `proxy`'s fields.
    pub fn define_object_with<P>(&self, name: &str, proxy: &Arc<Mutex<P>>) -> Object
    where
        P: Serialize + DeserializeOwned + Send + 'static,
    {
        let slots = proxy_slots(proxy);
        self.cx.define_object_at(Some(self.id), name, slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_takes_exact_match_once() {
        let mut sink = ErrorSink::default();
        sink.record("eval", 1, "boom");
        let report = sink.take("eval").unwrap();
        assert_eq!(report.line, 1);
        assert_eq!(report.message, "boom");
        assert!(sink.take("eval").is_none());
    }

    #[test]
    fn sink_falls_back_to_fatal_bucket() {
        let mut sink = ErrorSink::default();
        sink.record(FATAL_SOURCE, 0, "panic at the gates");
        let report = sink.take("eval").unwrap();
        assert_eq!(report.source, FATAL_SOURCE);
        assert!(sink.take("eval").is_none());
    }

    #[test]
    fn sink_overwrites_reports_per_source() {
        let mut sink = ErrorSink::default();
        sink.record("eval", 1, "first");
        sink.record("eval", 2, "second");
        let report = sink.take("eval").unwrap();
        assert_eq!(report.message, "second");
    }
}

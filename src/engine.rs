//! Low-level engine boundary.
//!
//! Everything the rest of the crate knows about the embedded Lua engine lives
//! here: instance create/destroy, evaluate-to-JSON under a source identifier,
//! and defining functions/objects/properties under a parent handle. Script
//! calls back into the host through the [`Dispatch`] callbacks, always as
//! JSON text. All functions in this module must run on the engine owner
//! thread; the instance table is thread-local to it.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use mlua::{Function, Lua, LuaSerdeExt, MultiValue, Table, Value as LuaValue};

/// Opaque engine instance handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct InstanceId(pub(crate) u64);

/// Opaque engine-assigned object handle, unique within an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObjectId(pub(crate) u64);

/// Scope handle naming the instance's global namespace
pub(crate) const GLOBAL_SCOPE: ObjectId = ObjectId(0);

/// Callbacks the engine raises back into the binding layer.
///
/// `Err` strings become script errors at the call site; `report` records an
/// uncaught failure under the source identifier the evaluation was given.
pub(crate) trait Dispatch: 'static {
    fn call(
        &self,
        instance: InstanceId,
        scope: ObjectId,
        name: &str,
        args_json: &str,
    ) -> std::result::Result<String, String>;

    fn get_prop(
        &self,
        instance: InstanceId,
        scope: ObjectId,
        name: &str,
    ) -> std::result::Result<String, String>;

    fn set_prop(
        &self,
        instance: InstanceId,
        scope: ObjectId,
        name: &str,
        value_json: &str,
    ) -> std::result::Result<String, String>;

    fn report(&self, instance: InstanceId, source: &str, line: u32, message: &str);
}

struct ObjectSlot {
    table: Table,
    props: Rc<RefCell<HashSet<String>>>,
}

struct Instance {
    lua: Lua,
    bind: Function,
    dispatch: Rc<dyn Dispatch>,
    objects: RefCell<HashMap<ObjectId, ObjectSlot>>,
    next_object: Cell<u64>,
}

thread_local! {
    static INSTANCES: RefCell<HashMap<InstanceId, Rc<Instance>>> = RefCell::new(HashMap::new());
}

// Object tables route property reads and writes through the host; anything
// that is not a registered property falls back to plain table storage.
const BIND_OBJECT: &str = r#"
return function(parent, name, getter, setter)
    local object = {}
    setmetatable(object, {
        __index = function(_, key)
            return getter(key)
        end,
        __newindex = function(tbl, key, value)
            if not setter(key, value) then
                rawset(tbl, key, value)
            end
        end,
    })
    rawset(parent, name, object)
    return object
end
"#;

fn instance(id: InstanceId) -> Rc<Instance> {
    INSTANCES
        .with(|map| map.borrow().get(&id).cloned())
        .unwrap_or_else(|| panic!("attempt to use context after destroy"))
}

/// Create a fresh engine instance under `id`.
pub(crate) fn create_instance(id: InstanceId, dispatch: Rc<dyn Dispatch>) -> mlua::Result<()> {
    let lua = Lua::new();
    let bind = lua.load(BIND_OBJECT).set_name("bootstrap").eval::<Function>()?;
    INSTANCES.with(|map| {
        map.borrow_mut().insert(
            id,
            Rc::new(Instance {
                lua,
                bind,
                dispatch,
                objects: RefCell::new(HashMap::new()),
                next_object: Cell::new(0),
            }),
        );
    });
    Ok(())
}

/// Tear down the instance; later use of its handle is a usage error.
pub(crate) fn destroy_instance(id: InstanceId) {
    let dropped = INSTANCES.with(|map| map.borrow_mut().remove(&id));
    drop(dropped);
}

/// Evaluate `source` under `chunk_name` and serialize the result to JSON.
///
/// `None` means the evaluation failed; the failure has already been handed to
/// [`Dispatch::report`] under the same `chunk_name`.
pub(crate) fn eval_json(id: InstanceId, source: &str, chunk_name: &str) -> Option<String> {
    let inst = instance(id);
    match inst.lua.load(source).set_name(chunk_name).eval::<LuaValue>() {
        Ok(value) => match inst.lua.from_value::<serde_json::Value>(value) {
            Ok(json) => Some(json.to_string()),
            Err(err) => {
                let message = format!("cannot serialize script result: {err}");
                inst.dispatch.report(id, chunk_name, 0, &message);
                None
            }
        },
        Err(err) => {
            let (line, message) = describe(&err);
            inst.dispatch.report(id, chunk_name, line, &message);
            None
        }
    }
}

/// Execute `source` under `chunk_name`, discarding any produced value.
pub(crate) fn exec(id: InstanceId, source: &str, chunk_name: &str) -> bool {
    let inst = instance(id);
    match inst.lua.load(source).set_name(chunk_name).exec() {
        Ok(()) => true,
        Err(err) => {
            let (line, message) = describe(&err);
            inst.dispatch.report(id, chunk_name, line, &message);
            false
        }
    }
}

/// Define a host-dispatched function named `name` under `parent`
/// (`None` = global scope). Calls are routed through [`Dispatch::call`]
/// with a JSON argument array and expect JSON (or an error string) back.
pub(crate) fn define_function(
    id: InstanceId,
    parent: Option<ObjectId>,
    name: &str,
) -> mlua::Result<()> {
    let inst = instance(id);
    let scope = parent.unwrap_or(GLOBAL_SCOPE);
    let dispatch = inst.dispatch.clone();
    let fn_name = name.to_string();
    let callback = inst.lua.create_function(move |lua, args: MultiValue| {
        let mut encoded = Vec::with_capacity(args.len());
        for value in args {
            encoded.push(lua.from_value::<serde_json::Value>(value)?);
        }
        let payload = serde_json::Value::Array(encoded).to_string();
        match dispatch.call(id, scope, &fn_name, &payload) {
            Ok(json) if json.is_empty() => Ok(LuaValue::Nil),
            Ok(json) => {
                let value: serde_json::Value =
                    serde_json::from_str(&json).map_err(mlua::Error::external)?;
                lua.to_value(&value)
            }
            Err(message) => Err(mlua::Error::RuntimeError(message)),
        }
    })?;
    match parent {
        Some(parent) => parent_table(&inst, parent)?.raw_set(name, callback),
        None => inst.lua.globals().raw_set(name, callback),
    }
}

/// Define a child object under `parent` and return its engine handle.
pub(crate) fn define_object(
    id: InstanceId,
    parent: Option<ObjectId>,
    name: &str,
) -> mlua::Result<ObjectId> {
    let inst = instance(id);
    let target = match parent {
        Some(parent) => parent_table(&inst, parent)?,
        None => inst.lua.globals(),
    };
    let object_id = ObjectId(inst.next_object.get() + 1);
    inst.next_object.set(object_id.0);

    let props: Rc<RefCell<HashSet<String>>> = Rc::new(RefCell::new(HashSet::new()));

    let getter = {
        let dispatch = inst.dispatch.clone();
        let props = props.clone();
        inst.lua.create_function(move |lua, key: LuaValue| {
            let LuaValue::String(key) = key else {
                return Ok(LuaValue::Nil);
            };
            let key = key.to_string_lossy().to_string();
            if !props.borrow().contains(&key) {
                return Ok(LuaValue::Nil);
            }
            match dispatch.get_prop(id, object_id, &key) {
                Ok(json) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&json).map_err(mlua::Error::external)?;
                    lua.to_value(&value)
                }
                Err(message) => Err(mlua::Error::RuntimeError(message)),
            }
        })?
    };

    let setter = {
        let dispatch = inst.dispatch.clone();
        let props = props.clone();
        inst.lua
            .create_function(move |lua, (key, value): (LuaValue, LuaValue)| {
                let LuaValue::String(key) = key else {
                    return Ok(false);
                };
                let key = key.to_string_lossy().to_string();
                if !props.borrow().contains(&key) {
                    return Ok(false);
                }
                let incoming = lua.from_value::<serde_json::Value>(value)?.to_string();
                match dispatch.set_prop(id, object_id, &key, &incoming) {
                    Ok(_) => Ok(true),
                    Err(message) => Err(mlua::Error::RuntimeError(message)),
                }
            })?
    };

    let table: Table = inst
        .bind
        .call((target, name.to_string(), getter, setter))?;
    inst.objects
        .borrow_mut()
        .insert(object_id, ObjectSlot { table, props });
    Ok(object_id)
}

/// Register `name` as a host-backed property of `object`.
pub(crate) fn define_property(id: InstanceId, object: ObjectId, name: &str) -> mlua::Result<()> {
    let inst = instance(id);
    let objects = inst.objects.borrow();
    let slot = objects.get(&object).ok_or_else(|| {
        mlua::Error::RuntimeError(format!("unknown object handle {}", object.0))
    })?;
    slot.props.borrow_mut().insert(name.to_string());
    Ok(())
}

fn parent_table(inst: &Instance, parent: ObjectId) -> mlua::Result<Table> {
    inst.objects
        .borrow()
        .get(&parent)
        .map(|slot| slot.table.clone())
        .ok_or_else(|| mlua::Error::RuntimeError(format!("unknown object handle {}", parent.0)))
}

/// Reduce an engine error to (line, message) for the error report.
fn describe(err: &mlua::Error) -> (u32, String) {
    match err {
        mlua::Error::CallbackError { cause, .. } => describe(cause.as_ref()),
        mlua::Error::SyntaxError { message, .. } => split_location(message),
        mlua::Error::RuntimeError(message) => split_location(message),
        other => (0, other.to_string()),
    }
}

// Engine messages lead with `chunk:line:` (or `[string "chunk"]:line:`);
// strip that off so the report carries a clean message plus the line.
fn split_location(message: &str) -> (u32, String) {
    let first = message.lines().next().unwrap_or(message);
    let mut pieces = first.splitn(3, ':');
    if let (Some(_), Some(line), Some(rest)) = (pieces.next(), pieces.next(), pieces.next()) {
        if let Ok(line) = line.trim().parse::<u32>() {
            return (line, rest.trim_start().to_string());
        }
    }
    (0, first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_chunk_and_line_prefixes() {
        assert_eq!(split_location("eval:1: ERROR1"), (1, "ERROR1".to_string()));
        assert_eq!(
            split_location("[string \"eval\"]:12: nope\nstack traceback:\n..."),
            (12, "nope".to_string())
        );
    }

    #[test]
    fn keeps_unprefixed_messages_whole() {
        assert_eq!(
            split_location("raise: BANG"),
            (0, "raise: BANG".to_string())
        );
        assert_eq!(split_location(""), (0, String::new()));
    }
}

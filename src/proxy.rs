//! Two-way property binding of a host struct's fields.
//!
//! A script object may mirror a shared host struct: each serialized field
//! becomes one [`PropertySlot`], and both get and set marshal the field value
//! through JSON. The struct lives behind `Arc<Mutex<_>>` so writes made from
//! script are observable on the original host instance.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::value::cast_to_kind;

type Getter = Box<dyn Fn() -> Result<String> + Send>;
type Setter = Box<dyn Fn(&str) -> Result<String> + Send>;

/// One proxied struct field, bound by name.
pub(crate) struct PropertySlot {
    name: String,
    get: Getter,
    set: Setter,
}

impl PropertySlot {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Current field value as JSON.
    pub(crate) fn get(&self) -> Result<String> {
        (self.get)()
    }

    /// Decode, cast to the field's kind, assign, and return the post-set
    /// value as JSON.
    pub(crate) fn set(&self, value_json: &str) -> Result<String> {
        (self.set)(value_json)
    }
}

impl std::fmt::Debug for PropertySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertySlot").field("name", &self.name).finish()
    }
}

/// Build one slot per serialized field of `proxy`.
///
/// Panics when the proxy does not serialize to a struct-like JSON object;
/// binding a non-struct is a definition-time programming error.
pub(crate) fn proxy_slots<P>(proxy: &Arc<Mutex<P>>) -> Vec<PropertySlot>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    let snapshot = {
        let guard = proxy
            .lock()
            .unwrap_or_else(|_| panic!("proxy instance lock poisoned"));
        serde_json::to_value(&*guard)
            .unwrap_or_else(|err| panic!("proxy object cannot be serialized: {err}"))
    };
    let Value::Object(fields) = snapshot else {
        panic!("proxy object must be a struct or a map, not a scalar");
    };

    fields
        .keys()
        .map(|field| PropertySlot {
            name: field.clone(),
            get: make_getter(proxy.clone(), field.clone()),
            set: make_setter(proxy.clone(), field.clone()),
        })
        .collect()
}

fn make_getter<P>(proxy: Arc<Mutex<P>>, field: String) -> Getter
where
    P: Serialize + Send + 'static,
{
    Box::new(move || {
        let guard = proxy
            .lock()
            .map_err(|_| Error::Proxy("proxy instance lock poisoned".to_string()))?;
        let whole = serde_json::to_value(&*guard)?;
        let value = whole.get(&field).cloned().unwrap_or(Value::Null);
        Ok(value.to_string())
    })
}

fn make_setter<P>(proxy: Arc<Mutex<P>>, field: String) -> Setter
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    Box::new(move |value_json| {
        let incoming: Value = serde_json::from_str(value_json)?;
        let mut guard = proxy
            .lock()
            .map_err(|_| Error::Proxy("proxy instance lock poisoned".to_string()))?;
        let mut whole = serde_json::to_value(&*guard)?;
        let fields = whole
            .as_object_mut()
            .ok_or_else(|| Error::Proxy("proxy no longer serializes to an object".to_string()))?;
        let current = fields.get(&field).cloned().unwrap_or(Value::Null);
        let cast = cast_to_kind(incoming, &current)?;
        fields.insert(field.clone(), cast);
        *guard = serde_json::from_value(whole).map_err(|_| Error::NotSettable(field.clone()))?;
        // re-read through the instance: deserialization may normalize the
        // field, and the caller gets what was actually stored
        let stored = serde_json::to_value(&*guard)?;
        let after = stored.get(&field).cloned().unwrap_or(Value::Null);
        Ok(after.to_string())
    })
}

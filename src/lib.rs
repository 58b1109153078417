//! Embed a scripting engine behind a thread-safe, JSON-marshalled API.
//!
//! The engine itself is single-threaded and non-reentrant, so every
//! [`Context`] operation is routed through one dedicated owner thread; the
//! handles exposed here are freely cloneable and usable from anywhere.
//! Values cross the boundary as JSON: script results decode into any
//! `serde`-deserializable type, and host functions declare plain Rust
//! signatures that are marshalled automatically.
//!
//! ```rust,ignore
//! use scriptapi::Context;
//!
//! let cx = Context::new();
//! cx.define_function("add", |a: i64, b: i64| a + b);
//! let sum: i64 = cx.eval("add(2, 3)")?;
//! assert_eq!(sum, 5);
//! cx.destroy();
//! ```

mod binding;
mod context;
mod engine;
mod error;
mod executor;
mod proxy;
mod value;

pub use binding::{FnBinding, IntoHostFn, IntoResults};
pub use context::{Context, Object};
pub use error::{Error, ErrorReport, Result};
pub use value::{FromScript, IntoScript, Json, Raw, Variadic};

pub use serde_json::Value;

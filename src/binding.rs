//! Host function bindings and the dynamic call path.
//!
//! A [`FnBinding`] wraps an arbitrary host closure behind a uniform
//! JSON-in/JSON-out call surface: decode the argument array, check arity,
//! cast each argument to the parameter type, invoke the closure with panics
//! intercepted, and encode the results. Bindings are built once at definition
//! time through [`IntoHostFn`], which is implemented for closures whose
//! parameters all implement [`FromScript`] — an unsupported parameter type is
//! rejected by the compiler rather than at bind time.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::value::{FromScript, IntoScript, Variadic};

/// Encoding of a host function's results into outgoing JSON fragments.
///
/// Zero results encode to an empty payload, one result to its own JSON,
/// several to a JSON array in declared order.
pub trait IntoResults {
    /// Encode each result as its own JSON fragment.
    fn into_results(self) -> Result<Vec<String>>;
}

impl<T: IntoScript> IntoResults for T {
    fn into_results(self) -> Result<Vec<String>> {
        Ok(vec![self.encode()?])
    }
}

impl IntoResults for () {
    fn into_results(self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

macro_rules! tuple_into_results {
    ($($r:ident),+) => {
        impl<$($r: IntoScript),+> IntoResults for ($($r,)+) {
            fn into_results(self) -> Result<Vec<String>> {
                #[allow(non_snake_case)]
                let ($($r,)+) = self;
                Ok(vec![$($r.encode()?),+])
            }
        }
    };
}

tuple_into_results!(R1, R2);
tuple_into_results!(R1, R2, R3);
tuple_into_results!(R1, R2, R3, R4);

type Invoke = Box<dyn Fn(Vec<Value>) -> Result<Vec<String>> + Send>;

/// One bound host callable: its name, reflected arity and the erased invoke.
pub struct FnBinding {
    name: String,
    arity: usize,
    variadic: bool,
    invoke: Invoke,
}

impl FnBinding {
    fn new(name: &str, arity: usize, variadic: bool, invoke: Invoke) -> Self {
        Self {
            name: name.to_string(),
            arity,
            variadic,
            invoke,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch one call: JSON argument array in, JSON result out.
    ///
    /// An empty return means the callable produced no results. Panics inside
    /// the callable surface as [`Error::Invocation`] carrying the bound name,
    /// and leave the binding usable.
    pub(crate) fn call(&self, args_json: &str) -> Result<String> {
        let args: Vec<Value> = serde_json::from_str(args_json)?;
        let got = args.len();
        let enough = if self.variadic {
            got >= self.arity
        } else {
            got == self.arity
        };
        if !enough {
            return Err(Error::Arity {
                expected: self.arity,
                got,
            });
        }
        let results = match catch_unwind(AssertUnwindSafe(|| (self.invoke)(args))) {
            Ok(outcome) => outcome?,
            Err(payload) => {
                return Err(Error::Invocation {
                    function: self.name.clone(),
                    message: panic_message(payload),
                })
            }
        };
        Ok(match results.len() {
            0 => String::new(),
            1 => results.into_iter().next().unwrap_or_default(),
            _ => format!("[{}]", results.join(",")),
        })
    }
}

impl std::fmt::Debug for FnBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBinding")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("variadic", &self.variadic)
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "host function panicked".to_string()
    }
}

/// Conversion of a host closure into a [`FnBinding`].
///
/// Implemented for closures of up to six parameters, each in the acceptable
/// [`FromScript`] set, optionally ending in a [`Variadic`] tail. The type
/// parameters only disambiguate the closure's signature.
pub trait IntoHostFn<A, R>: Send + 'static {
    /// Build the binding under its script-visible `name`.
    fn into_binding(self, name: &str) -> FnBinding;
}

impl<Fun, R> IntoHostFn<(), R> for Fun
where
    Fun: Fn() -> R + Send + 'static,
    R: IntoResults,
{
    fn into_binding(self, name: &str) -> FnBinding {
        FnBinding::new(
            name,
            0,
            false,
            Box::new(move |_args| self().into_results()),
        )
    }
}

impl<Fun, V, R> IntoHostFn<(Variadic<V>,), R> for Fun
where
    Fun: Fn(Variadic<V>) -> R + Send + 'static,
    V: FromScript,
    R: IntoResults,
{
    fn into_binding(self, name: &str) -> FnBinding {
        FnBinding::new(
            name,
            0,
            true,
            Box::new(move |args| {
                let tail = args
                    .into_iter()
                    .map(V::from_value)
                    .collect::<Result<Vec<V>>>()?;
                self(Variadic(tail)).into_results()
            }),
        )
    }
}

macro_rules! impl_into_host_fn {
    ($count:expr, $($a:ident),+) => {
        impl<Fun, $($a,)+ R> IntoHostFn<($($a,)+), R> for Fun
        where
            Fun: Fn($($a),+) -> R + Send + 'static,
            $($a: FromScript,)+
            R: IntoResults,
        {
            fn into_binding(self, name: &str) -> FnBinding {
                FnBinding::new(name, $count, false, Box::new(move |args| {
                    let given = args.len();
                    let mut args = args.into_iter();
                    #[allow(non_snake_case)]
                    {
                        $(
                            let $a = match args.next() {
                                Some(value) => <$a as FromScript>::from_value(value)?,
                                None => return Err(Error::Arity { expected: $count, got: given }),
                            };
                        )+
                        self($($a),+).into_results()
                    }
                }))
            }
        }

        impl<Fun, $($a,)+ V, R> IntoHostFn<($($a,)+ Variadic<V>), R> for Fun
        where
            Fun: Fn($($a,)+ Variadic<V>) -> R + Send + 'static,
            $($a: FromScript,)+
            V: FromScript,
            R: IntoResults,
        {
            fn into_binding(self, name: &str) -> FnBinding {
                FnBinding::new(name, $count, true, Box::new(move |args| {
                    let given = args.len();
                    let mut args = args.into_iter();
                    #[allow(non_snake_case)]
                    {
                        $(
                            let $a = match args.next() {
                                Some(value) => <$a as FromScript>::from_value(value)?,
                                None => return Err(Error::Arity { expected: $count, got: given }),
                            };
                        )+
                        let tail = args.map(V::from_value).collect::<Result<Vec<V>>>()?;
                        self($($a,)+ Variadic(tail)).into_results()
                    }
                }))
            }
        }
    };
}

impl_into_host_fn!(1, A1);
impl_into_host_fn!(2, A1, A2);
impl_into_host_fn!(3, A1, A2, A3);
impl_into_host_fn!(4, A1, A2, A3, A4);
impl_into_host_fn!(5, A1, A2, A3, A4, A5);
impl_into_host_fn!(6, A1, A2, A3, A4, A5, A6);

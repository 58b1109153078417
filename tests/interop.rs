//! End-to-end tests driving script contexts through the public API: host
//! function dispatch, namespace objects, property proxies, error reports and
//! cross-thread use of a single engine.

use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};

use scriptapi::{Context, Error, Json, Raw, Variadic};

fn trace() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn evaluates_scalars() {
    trace();
    let cx = Context::new();
    assert_eq!(cx.eval::<i64>("2 + 3").unwrap(), 5);
    assert_eq!(cx.eval::<f64>("1.5 * 2").unwrap(), 3.0);
    assert_eq!(cx.eval::<String>("'h' .. 'ello'").unwrap(), "hello");
    assert!(cx.eval::<bool>("2 > 1").unwrap());
    assert_eq!(cx.eval::<Option<i64>>("nil").unwrap(), None);
    cx.destroy();
}

#[test]
fn decodes_structured_results() {
    let cx = Context::new();
    let list: Vec<i64> = cx.eval("{1, 2, 3}").unwrap();
    assert_eq!(list, vec![1, 2, 3]);

    #[derive(Deserialize)]
    struct Point {
        x: i64,
        y: i64,
    }
    let point: Point = cx.eval("{x = 4, y = 5}").unwrap();
    assert_eq!(point.x, 4);
    assert_eq!(point.y, 5);
    cx.destroy();
}

#[test]
fn raw_captures_result_text_verbatim() {
    let cx = Context::new();
    let raw: Raw = cx.eval("{a = 1, b = 2}").unwrap();
    assert_eq!(raw.0, r#"{"a":1,"b":2}"#);
    cx.destroy();
}

#[test]
fn reports_carry_source_and_line() {
    let cx = Context::new();
    let err = cx.eval::<i64>("nosuchfunction()").unwrap_err();
    match err {
        Error::Script(report) => {
            assert_eq!(report.source, "eval");
            assert_eq!(report.line, 1);
            assert!(report.message.contains("nosuchfunction"), "{}", report.message);
        }
        other => panic!("expected a script error, got {other:?}"),
    }

    // multi-line sources keep their line numbers
    let err = cx.eval::<i64>("\n\nnosuchfunction()").unwrap_err();
    match err {
        Error::Script(report) => assert_eq!(report.line, 3),
        other => panic!("expected a script error, got {other:?}"),
    }
    cx.destroy();
}

#[test]
fn context_survives_script_failures() {
    let cx = Context::new();
    assert!(cx.exec("error('deliberate')").is_err());
    assert_eq!(cx.eval::<i64>("40 + 2").unwrap(), 42);
    cx.destroy();
}

#[test]
fn global_functions_dispatch_and_overwrite() {
    let cx = Context::new();
    cx.define_function("add", |a: i64, b: i64| a + b);
    assert_eq!(cx.eval::<i64>("add(2, 3)").unwrap(), 5);

    // redefinition replaces the binding
    cx.define_function("add", |a: i64, b: i64| a * b);
    assert_eq!(cx.eval::<i64>("add(3, 4)").unwrap(), 12);
    cx.destroy();
}

#[test]
fn arity_and_cast_failures_surface_as_errors() {
    let cx = Context::new();
    cx.define_function("add", |a: i64, b: i64| a + b);

    let err = cx.eval::<i64>("add(1)").unwrap_err();
    assert!(
        err.to_string()
            .contains("invalid number of arguments: expected 2 got 1"),
        "{err}"
    );

    let err = cx.eval::<i64>("add('x', 2)").unwrap_err();
    assert!(err.to_string().contains("cannot cast string to i64"), "{err}");
    cx.destroy();
}

#[test]
fn namespace_objects_hold_functions() {
    let cx = Context::new();
    let math = cx.define_object("math");
    math.define_function("add", |a: i64, b: i64| a + b);
    assert_eq!(cx.eval::<i64>("math.add(1, 2)").unwrap(), 3);
    // spread-call form
    assert_eq!(
        cx.eval::<i64>("math.add(table.unpack({3, 4}))").unwrap(),
        7
    );
    cx.destroy();
}

#[test]
fn objects_nest() {
    let cx = Context::new();
    let a = cx.define_object("a");
    let b = a.define_object("b");
    b.define_function("c", || "deep");
    assert_eq!(cx.eval::<String>("a.b.c()").unwrap(), "deep");
    cx.destroy();
}

#[test]
fn variadic_functions_take_any_tail() {
    let cx = Context::new();
    cx.define_function("sum", |values: Variadic<i64>| -> i64 {
        values.iter().sum()
    });
    assert_eq!(cx.eval::<i64>("sum()").unwrap(), 0);
    assert_eq!(cx.eval::<i64>("sum(1, 2, 3, 4)").unwrap(), 10);

    cx.define_function("join", |sep: String, parts: Variadic<String>| {
        parts.join(&sep)
    });
    assert_eq!(
        cx.eval::<String>("join('-', 'a', 'b', 'c')").unwrap(),
        "a-b-c"
    );
    let err = cx.eval::<String>("join()").unwrap_err();
    assert!(
        err.to_string()
            .contains("invalid number of arguments: expected 1 got 0"),
        "{err}"
    );
    cx.destroy();
}

#[test]
fn variadic_functions_work_at_namespace_scope() {
    let cx = Context::new();
    let fmt = cx.define_object("fmt");
    fmt.define_function("join", |sep: String, parts: Variadic<String>| {
        parts.join(&sep)
    });
    assert_eq!(
        cx.eval::<String>("fmt.join('/', 'usr', 'local', 'bin')").unwrap(),
        "usr/local/bin"
    );

    // same shape at deeper nesting
    let text = fmt.define_object("text");
    text.define_function("sum", |values: Variadic<i64>| -> i64 {
        values.iter().sum()
    });
    assert_eq!(cx.eval::<i64>("fmt.text.sum(1, 2, 3)").unwrap(), 6);
    assert_eq!(
        cx.eval::<i64>("fmt.text.sum(table.unpack({4, 5}))").unwrap(),
        9
    );
    cx.destroy();
}

#[test]
fn host_panics_are_recoverable() {
    let cx = Context::new();
    cx.define_function("raise", || -> i64 { panic!("BANG") });
    let err = cx.eval::<i64>("raise()").unwrap_err();
    let text = err.to_string();
    assert!(text.contains("raise"), "{text}");
    assert!(text.contains("BANG"), "{text}");

    // the context and the binding both stay usable
    assert_eq!(cx.eval::<i64>("1 + 1").unwrap(), 2);
    let err = cx.eval::<i64>("raise()").unwrap_err();
    assert!(err.to_string().contains("BANG"));
    cx.destroy();
}

#[test]
fn struct_arguments_decode_through_json() {
    #[derive(Serialize, Deserialize)]
    struct Sum {
        a: i64,
        b: i64,
    }
    let cx = Context::new();
    cx.define_function("jsum", |Json(sum): Json<Sum>| sum.a + sum.b);
    assert_eq!(cx.eval::<i64>("jsum({a = 1, b = 2})").unwrap(), 3);
    cx.destroy();
}

#[test]
fn multiple_results_become_an_array() {
    let cx = Context::new();
    cx.define_function("pair", || (1i64, "x"));
    let (n, s): (i64, String) = cx.eval("pair()").unwrap();
    assert_eq!(n, 1);
    assert_eq!(s, "x");
    cx.destroy();
}

#[test]
fn raw_results_pass_through_unencoded() {
    let cx = Context::new();
    cx.define_function("payload", || Raw::from(r#"{"a":1}"#));
    assert_eq!(cx.eval::<i64>("payload().a").unwrap(), 1);
    cx.destroy();
}

#[derive(Serialize, Deserialize)]
struct Person {
    name: String,
    age: i64,
}

#[test]
fn proxied_objects_share_state_with_the_host() {
    let cx = Context::new();
    let person = Arc::new(Mutex::new(Person {
        name: "ann".to_string(),
        age: 22,
    }));
    cx.define_object_with("person", &person);

    assert_eq!(cx.eval::<String>("person.name").unwrap(), "ann");
    assert_eq!(cx.eval::<i64>("person.age").unwrap(), 22);

    // script writes land on the host instance
    cx.exec("person.age = person.age + 1").unwrap();
    assert_eq!(person.lock().unwrap().age, 23);

    // host writes are visible to script
    person.lock().unwrap().name = "bob".to_string();
    assert_eq!(cx.eval::<String>("person.name").unwrap(), "bob");
    cx.destroy();
}

#[test]
fn proxied_fields_keep_their_kind() {
    let cx = Context::new();
    let person = Arc::new(Mutex::new(Person {
        name: "ann".to_string(),
        age: 22,
    }));
    cx.define_object_with("person", &person);

    let err = cx.exec("person.age = 'twenty'").unwrap_err();
    assert!(err.to_string().contains("cannot cast string to i64"), "{err}");
    assert_eq!(person.lock().unwrap().age, 22);
    cx.destroy();
}

#[test]
fn skipped_fields_are_not_proxied() {
    #[derive(Serialize, Deserialize)]
    struct Account {
        name: String,
        #[serde(skip)]
        secret: String,
    }

    let cx = Context::new();
    let account = Arc::new(Mutex::new(Account {
        name: "ann".to_string(),
        secret: "hunter2".to_string(),
    }));
    cx.define_object_with("account", &account);

    assert_eq!(cx.eval::<String>("account.name").unwrap(), "ann");
    // unproxied fields read as nil rather than erroring
    assert_eq!(cx.eval::<Option<String>>("account.secret").unwrap(), None);

    // writes to them stay script-side and never reach the host
    cx.exec("account.secret = 'leak'").unwrap();
    assert_eq!(account.lock().unwrap().secret, "hunter2");
    assert_eq!(
        cx.eval::<String>("account.secret").unwrap(),
        "leak"
    );
    cx.destroy();
}

#[test]
fn bindings_may_define_further_bindings() {
    let cx = Context::new();
    let handle = cx.clone();
    cx.define_function("mkfun", move |name: String| {
        handle.define_function(&name, || 7i64);
    });
    cx.exec("mkfun('seven')").unwrap();
    assert_eq!(cx.eval::<i64>("seven()").unwrap(), 7);
    cx.destroy();
}

#[test]
fn executes_sources_from_readers_and_files() {
    let cx = Context::new();
    cx.exec_from("y = 7\n".as_bytes()).unwrap();
    assert_eq!(cx.eval::<i64>("y").unwrap(), 7);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "x = 40 + 2").unwrap();
    cx.exec_file(file.path()).unwrap();
    assert_eq!(cx.eval::<i64>("x").unwrap(), 42);

    let mut broken = tempfile::NamedTempFile::new().unwrap();
    writeln!(broken, "this is not a script").unwrap();
    let err = cx.exec_file(broken.path()).unwrap_err();
    match err {
        Error::Script(report) => assert_eq!(report.line, 1),
        other => panic!("expected a script error, got {other:?}"),
    }
    cx.destroy();
}

#[test]
fn missing_files_fail_before_reaching_the_engine() {
    let cx = Context::new();
    let err = cx.exec_file("/no/such/script.lua").unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    cx.destroy();
}

#[test]
fn one_context_is_usable_from_many_threads() {
    let cx = Context::new();
    let hits = Arc::new(AtomicI64::new(0));
    let counter = hits.clone();
    cx.define_function("bump", move |n: i64| {
        counter.fetch_add(n, Ordering::SeqCst);
    });

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let cx = cx.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    cx.exec("bump(1)").unwrap();
                    assert_eq!(cx.eval::<i64>("2 + 2").unwrap(), 4);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 400);
    cx.destroy();
}

#[test]
fn contexts_are_isolated_from_each_other() {
    let workers: Vec<_> = (0..8i64)
        .map(|i| {
            thread::spawn(move || {
                let cx = Context::new();
                cx.define_function("id", move || i);
                assert_eq!(cx.eval::<i64>("id()").unwrap(), i);
                cx.exec("leak = 'local state'").unwrap();
                cx.destroy();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let cx = Context::new();
    assert_eq!(cx.eval::<Option<String>>("leak").unwrap(), None);
    cx.destroy();
}

#[test]
fn use_after_destroy_panics() {
    let cx = Context::new();
    cx.destroy();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        cx.eval::<i64>("1 + 1")
    }));
    assert!(outcome.is_err());
}

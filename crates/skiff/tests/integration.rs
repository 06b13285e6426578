use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use skiff::compiler::Compiler;
use skiff::object::CancelToken;
use skiff::{
    CompilerOptions, Error, HostFunction, ModuleMap, RuntimeError, SourceFileSet, SymbolTable,
    Value, Vm, VmConfig,
};

/// Compile, run and return the value of global `name`.
fn eval_with(
    source: &str,
    name: &str,
    modules: ModuleMap,
    options: CompilerOptions,
    config: VmConfig,
) -> Result<Value, Error> {
    let mut file_set = SourceFileSet::new();
    let file_id = file_set.add_file("test.skf", source);
    let file = skiff::parser::parse(source, file_id).map_err(|errors| Error::Parse {
        errors,
        file_set: file_set.clone(),
    })?;

    let mut compiler = Compiler::new(file_set)
        .with_module_map(modules)
        .with_options(options);
    if let Err(error) = compiler.compile(&file) {
        let file_set = compiler.file_set().clone();
        return Err(Error::Compile { error, file_set });
    }
    let (mut bytecode, mut symbols) = compiler.into_parts();
    bytecode.remove_duplicates();

    let mut vm = Vm::with_config(bytecode, None, config);
    vm.run()?;

    let (id, _) = symbols
        .resolve(name, false)
        .unwrap_or_else(|| panic!("no global named {name}"));
    Ok(vm.globals()[symbols.symbol(id).index].clone())
}

fn eval(source: &str, name: &str) -> Result<Value, Error> {
    eval_with(
        source,
        name,
        ModuleMap::new(),
        CompilerOptions::default(),
        VmConfig::default(),
    )
}

fn eval_ok(source: &str, name: &str) -> Value {
    eval(source, name).unwrap_or_else(|e| panic!("{e}"))
}

fn runtime_error(result: Result<Value, Error>) -> RuntimeError {
    match result {
        Err(Error::Runtime(e)) => e.error,
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn test_hello_world() {
    assert_eq!(eval_ok("out := \"hello\" + \" \" + \"world\"", "out"), Value::from("hello world"));
}

#[test]
fn test_program_with_functions_and_loops() {
    let source = r#"
        sort := func(arr) {
            n := len(arr)
            for i := 0; i < n; i++ {
                for j := 0; j < n - 1 - i; j++ {
                    if arr[j] > arr[j + 1] {
                        tmp := arr[j]
                        arr[j] = arr[j + 1]
                        arr[j + 1] = tmp
                    }
                }
            }
            return arr
        }
        out := format("%v", sort([5, 3, 9, 1, 4]))
    "#;
    assert_eq!(eval_ok(source, "out"), Value::from("[1, 3, 4, 5, 9]"));
}

#[test]
fn test_fizzbuzz() {
    let source = r#"
        out := []
        for i in range(1, 16) {
            if i % 15 == 0 {
                out = append(out, "FizzBuzz")
            } else if i % 3 == 0 {
                out = append(out, "Fizz")
            } else if i % 5 == 0 {
                out = append(out, "Buzz")
            } else {
                out = append(out, i)
            }
        }
        last := out[14]
        count := len(out)
    "#;
    assert_eq!(eval_ok(source, "last"), Value::from("FizzBuzz"));
    assert_eq!(eval_ok(source, "count"), Value::Int(15));
}

#[test]
fn test_compilation_is_deterministic() {
    let source = r#"
        m := import("helpers")
        adder := func(x) { return func(y) { return x + y + m.base } }
        out := adder(1)(2)
    "#;
    let compile = || {
        let mut modules = ModuleMap::new();
        modules.add_source_module("helpers", "export {base: 10}");
        skiff::compile("main", source, CompilerOptions::default(), modules)
            .unwrap()
            .disassemble()
    };
    assert_eq!(compile(), compile());
}

#[test]
fn test_remove_duplicates_is_idempotent() {
    let source = "a := 7\nb := 7\nc := \"s\"\nd := \"s\"\ne := a + b";
    let bytecode = skiff::compile("main", source, CompilerOptions::default(), ModuleMap::new())
        .unwrap();
    assert_eq!(bytecode.constants.len(), 2);

    let mut again = bytecode.clone();
    again.remove_duplicates();
    assert_eq!(again.constants.len(), 2);
    assert_eq!(again.disassemble(), bytecode.disassemble());

    let mut vm = Vm::new(again, None, -1);
    vm.run().unwrap();
    assert_eq!(vm.globals()[4], Value::Int(14));
}

#[test]
fn test_tail_recursion_beyond_frame_limit() {
    let config = VmConfig {
        max_frames: 16,
        ..VmConfig::default()
    };
    let tail = r#"
        countdown := func(n) {
            if n == 0 { return "done" }
            return countdown(n - 1)
        }
        out := countdown(1000)
    "#;
    let result = eval_with(tail, "out", ModuleMap::new(), CompilerOptions::default(), config.clone());
    assert_eq!(result.unwrap(), Value::from("done"));

    let non_tail = r#"
        depth := func(n) { return n == 0 ? 0 : 1 + depth(n - 1) }
        out := depth(100)
    "#;
    let result = eval_with(non_tail, "out", ModuleMap::new(), CompilerOptions::default(), config);
    assert_eq!(runtime_error(result), RuntimeError::StackOverflow);
}

#[test]
fn test_closures_capture_variables() {
    let source = r#"
        adder := func(x) { return func(y) { return x + y } }
        add5 := adder(5)
        out := add5(10) + adder(1)(1)
    "#;
    assert_eq!(eval_ok(source, "out"), Value::Int(17));

    let shared = r#"
        make := func() {
            n := 0
            inc := func() { n++ }
            get := func() { return n }
            return [inc, get]
        }
        pair := make()
        pair[0]()
        pair[0]()
        pair[0]()
        out := pair[1]()
    "#;
    assert_eq!(eval_ok(shared, "out"), Value::Int(3));
}

#[test]
fn test_containers_are_shared_by_reference() {
    let source = r#"
        m := {}
        set := func(t) { t.k = 1 }
        set(m)
        out := m.k
    "#;
    assert_eq!(eval_ok(source, "out"), Value::Int(1));

    let copied = r#"
        a := {list: [1, 2]}
        b := copy(a)
        b.list[0] = 99
        out := a.list[0]
    "#;
    assert_eq!(eval_ok(copied, "out"), Value::Int(1));
}

#[test]
fn test_immutable_values() {
    let err = runtime_error(eval("a := immutable({x: 1})\na.x = 2", "a"));
    assert_eq!(err, RuntimeError::NotIndexAssignable("immutable-map"));

    let nested = r#"
        inner := [1]
        outer := immutable([inner])
        inner[0] = 5
        out := outer[0][0]
    "#;
    assert_eq!(eval_ok(nested, "out"), Value::Int(5));
}

#[test]
fn test_allocation_budget() {
    let source = "out := []\nfor i := 0; i < 1000; i++ { out = append(out, i) }";
    let err = skiff::run(source, 50).unwrap_err();
    match err {
        Error::Runtime(e) => {
            assert_eq!(e.error, RuntimeError::AllocationLimitExceeded);
            assert!(e.error.is_resource_limit());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(skiff::run(source, -1).is_ok());
}

#[test]
fn test_allocation_budget_is_exact() {
    // Two array literals and one binary operation.
    let source = "a := [1]\nb := [2]\nc := 1 + 2";
    assert!(skiff::run(source, 3).is_ok());
    assert!(skiff::run(source, 4).is_ok());
    for budget in [0, 1, 2] {
        match skiff::run(source, budget) {
            Err(Error::Runtime(e)) => assert_eq!(e.error, RuntimeError::AllocationLimitExceeded),
            other => panic!("budget {budget}: unexpected {other:?}"),
        }
    }
}

#[test]
fn test_spawned_routines_share_allocation_budget() {
    // Each call of `work` costs 31 allocations.
    let work = "work := func() { a := 0; for i := 0; i < 10; i++ { a = [i] } }\n";
    let once = format!("{work}r := spawn(work)\nr.wait()\nout := r.result()");
    assert!(skiff::run(&once, 45).is_ok());

    let thrice = format!(
        "{work}r1 := spawn(work)\nr1.wait()\nr2 := spawn(work)\nr2.wait()\nr3 := spawn(work)\nr3.wait()"
    );
    match skiff::run(&thrice, 45) {
        Err(Error::Runtime(e)) => assert_eq!(e.error, RuntimeError::AllocationLimitExceeded),
        other => panic!("unexpected {other:?}"),
    }
    assert!(skiff::run(&thrice, -1).is_ok());
}

#[test]
fn test_runtime_error_carries_call_stack() {
    let source = "inner := func() {\n  return 1 / 0\n}\nouter := func() {\n  return inner() + 1\n}\nouter()";
    let err = skiff::run(source, -1).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Runtime Error: division by zero\n\tat main:2:10\n\tat main:5:10\n\tat main:7:1"
    );
}

#[test]
fn test_spawn_and_result() {
    let source = r#"
        r := spawn(func(a, b) { return a * b }, 6, 7)
        out := r.result()
    "#;
    assert_eq!(eval_ok(source, "out"), Value::Int(42));
}

#[test]
fn test_failed_routine_yields_error_value() {
    let source = r#"
        r := spawn(func() { return 1 / 0 })
        res := r.result()
        out := is_error(res)
    "#;
    assert_eq!(eval_ok(source, "out"), Value::Bool(true));
}

#[test]
fn test_unbuffered_channel_exchange() {
    let source = r#"
        ch := make_channel()
        producer := func(c) {
            for i := 1; i <= 4; i++ { c.send(i) }
            c.close()
        }
        r := spawn(producer, ch)
        out := 0
        for {
            v := ch.recv()
            if is_undefined(v) { break }
            out += v
        }
        r.wait()
    "#;
    assert_eq!(eval_ok(source, "out"), Value::Int(10));
}

#[test]
fn test_send_on_closed_channel() {
    let source = "ch := make_channel(1)\nch.close()\nch.send(1)";
    assert_eq!(runtime_error(eval(source, "ch")), RuntimeError::SendOnClosedChannel);

    let drained = "ch := make_channel(1)\nch.send(1)\nch.close()\na := ch.recv()\nb := ch.recv()";
    assert_eq!(eval_ok(drained, "a"), Value::Int(1));
    assert_eq!(eval_ok(drained, "b"), Value::Undefined);
}

#[test]
fn test_abort_routine() {
    let source = r#"
        r := spawn(func() { for {} })
        early := r.wait(0.05)
        r.abort()
        done := r.wait()
        failed := is_error(r.result())
    "#;
    assert_eq!(eval_ok(source, "early"), Value::Bool(false));
    assert_eq!(eval_ok(source, "done"), Value::Bool(true));
    assert_eq!(eval_ok(source, "failed"), Value::Bool(true));
}

#[test]
fn test_host_cancels_running_vm() {
    let bytecode = skiff::compile("main", "for {}", CompilerOptions::default(), ModuleMap::new())
        .unwrap();
    let mut vm = Vm::new(bytecode, None, -1);
    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.cancel();
        })
    };
    let err = vm.run_with_cancel(&token).unwrap_err();
    assert_eq!(err.error, RuntimeError::Aborted);
    canceller.join().unwrap();
}

fn native_modules(calls: Arc<AtomicUsize>) -> ModuleMap {
    let mut attrs = IndexMap::new();
    attrs.insert(
        "scale".to_string(),
        Value::from(HostFunction::new("scale", move |args, kwargs| {
            calls.fetch_add(1, Ordering::SeqCst);
            let factor = match kwargs.get("by") {
                Some(Value::Int(n)) => *n,
                _ => 2,
            };
            match args {
                [Value::Int(x)] => Ok(Value::Int(x * factor)),
                _ => Err(RuntimeError::WrongNumArguments {
                    want: 1,
                    got: args.len(),
                }),
            }
        })),
    );
    attrs.insert(
        "soft".to_string(),
        Value::from(HostFunction::new("soft", |_, _| {
            Ok(Value::error_message("soft failure"))
        })),
    );
    attrs.insert("answer".to_string(), Value::Int(42));

    let mut modules = ModuleMap::new();
    modules.add_builtin_module("host", attrs);
    modules
}

#[test]
fn test_native_module() {
    let calls = Arc::new(AtomicUsize::new(0));
    let source = r#"
        h := import("host")
        a := h.scale(4)
        b := h.scale(4, by=10)
        c := h.answer
        d := is_error(h.soft())
    "#;
    let get = |name: &str| {
        eval_with(
            source,
            name,
            native_modules(calls.clone()),
            CompilerOptions::default(),
            VmConfig::default(),
        )
        .unwrap()
    };
    assert_eq!(get("a"), Value::Int(8));
    assert_eq!(get("b"), Value::Int(40));
    assert_eq!(get("c"), Value::Int(42));
    assert_eq!(get("d"), Value::Bool(true));
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}

#[test]
fn test_native_module_exposes_only_its_attributes() {
    let source = r#"
        h := import("host")
        keys := []
        for k, _ in h { keys = append(keys, k) }
        out := format("%d %v", len(h), keys)
        same := import("host") == h
    "#;
    let get = |name: &str| {
        eval_with(
            source,
            name,
            native_modules(Arc::new(AtomicUsize::new(0))),
            CompilerOptions::default(),
            VmConfig::default(),
        )
        .unwrap()
    };
    assert_eq!(get("out"), Value::from(r#"3 ["scale", "soft", "answer"]"#));
    assert_eq!(get("same"), Value::Bool(true));
}

#[test]
fn test_host_error_is_fatal() {
    let calls = Arc::new(AtomicUsize::new(0));
    let result = eval_with(
        "h := import(\"host\")\nh.scale(1, 2)",
        "h",
        native_modules(calls),
        CompilerOptions::default(),
        VmConfig::default(),
    );
    assert_eq!(
        runtime_error(result),
        RuntimeError::WrongNumArguments { want: 1, got: 2 }
    );
}

#[test]
fn test_source_module() {
    let mut modules = ModuleMap::new();
    modules.add_source_module("greet", "prefix := \"hi \"\nexport func(n) { return prefix + n }");
    let out = eval_with(
        "g := import(\"greet\")\nout := g(\"there\")",
        "out",
        modules,
        CompilerOptions::default(),
        VmConfig::default(),
    );
    assert_eq!(out.unwrap(), Value::from("hi there"));
}

#[test]
fn test_missing_module_is_compile_error() {
    let err = eval("m := import(\"nowhere\")", "m").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Compile Error: module 'nowhere' not found\n\tat test.skf:1:6"
    );
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("skiff-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_file_import() {
    let dir = temp_dir("import");
    std::fs::write(
        dir.join("util.skf"),
        "export {triple: func(x) { return x * 3 }}",
    )
    .unwrap();

    let options = CompilerOptions {
        allow_file_import: true,
        import_dir: dir.clone(),
        ..CompilerOptions::default()
    };
    let out = eval_with(
        "u := import(\"util\")\nout := u.triple(5)",
        "out",
        ModuleMap::new(),
        options,
        VmConfig::default(),
    );
    std::fs::remove_dir_all(&dir).unwrap();
    assert_eq!(out.unwrap(), Value::Int(15));
}

#[test]
fn test_host_exchanges_globals_between_runs() {
    let source = "counter += 1";
    let mut symbols = SymbolTable::with_builtins();
    symbols.define("counter");

    let mut file_set = SourceFileSet::new();
    let file_id = file_set.add_file("main", source);
    let file = skiff::parser::parse(source, file_id).unwrap();
    let mut compiler = Compiler::new(file_set).with_symbol_table(symbols);
    compiler.compile(&file).unwrap();

    let mut vm = Vm::new(compiler.bytecode(), Some(vec![Value::Int(10)]), -1);
    vm.run().unwrap();
    assert_eq!(vm.globals()[0], Value::Int(11));
    vm.run().unwrap();
    assert_eq!(vm.globals()[0], Value::Int(12));

    vm.globals_mut()[0] = Value::Int(100);
    vm.run().unwrap();
    assert_eq!(vm.globals()[0], Value::Int(101));
}

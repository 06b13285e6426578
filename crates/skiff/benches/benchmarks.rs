use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use skiff::compiler::Compiler;
use skiff::lexer::{Lexer, SourceFileSet};
use skiff::parser::{parse, File};
use skiff::{Bytecode, Vm};

const FIB: &str = r#"
fib := func(n) {
    if n < 2 { return n }
    return fib(n - 1) + fib(n - 2)
}
out := fib(15)
"#;

fn parse_ok(source: &str) -> File {
    match parse(source, 0) {
        Ok(file) => file,
        Err(errors) => panic!("parse errors: {:?}", errors),
    }
}

fn compile(source: &str) -> Bytecode {
    let file = parse_ok(source);
    let mut files = SourceFileSet::new();
    files.add_file("bench", source);
    let mut compiler = Compiler::new(files);
    compiler.compile(&file).expect("compile error");
    let mut bytecode = compiler.bytecode();
    bytecode.remove_duplicates();
    bytecode
}

// ---
// Lexer Benchmarks
// ---

fn bench_lexer(c: &mut Criterion) {
    c.bench_function("lexer/fibonacci", |b| {
        b.iter(|| {
            let mut lexer = Lexer::new(black_box(FIB), 0);
            black_box(lexer.collect_all())
        })
    });

    let mut group = c.benchmark_group("lexer/size");
    for size in [10, 100, 1000] {
        let source = "x := 1 + 2 * 3 - 4 / 5\n".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &source, |b, src| {
            b.iter(|| {
                let mut lexer = Lexer::new(black_box(src), 0);
                black_box(lexer.collect_all())
            })
        });
    }
    group.finish();
}

// ---
// Parser Benchmarks
// ---

fn bench_parser(c: &mut Criterion) {
    c.bench_function("parser/fibonacci", |b| {
        b.iter(|| black_box(parse(black_box(FIB), 0)))
    });

    let expr = "out := 1 + 2 * 3 - 4 / 5 + 6 * (7 + 8) - 9 > 3 ? \"a\" : \"b\"";
    c.bench_function("parser/complex_expr", |b| {
        b.iter(|| black_box(parse(black_box(expr), 0)))
    });
}

// ---
// Compiler Benchmarks
// ---

fn bench_compiler(c: &mut Criterion) {
    let closures = r#"
make_adder := func(x) { return func(y) { return x + y } }
add5 := make_adder(5)
out := add5(10)
"#;

    for (name, source) in [("compiler/fibonacci", FIB), ("compiler/closures", closures)] {
        let file = parse_ok(source);
        c.bench_function(name, |b| {
            b.iter(|| {
                let mut files = SourceFileSet::new();
                files.add_file("bench", source);
                let mut compiler = Compiler::new(files);
                let result = compiler.compile(black_box(&file));
                black_box(result.map(|_| compiler.bytecode()))
            })
        });
    }
}

// ---
// VM Benchmarks
// ---

fn bench_vm(c: &mut Criterion) {
    let programs = [
        ("vm/fibonacci_15", FIB),
        (
            "vm/loop_1000",
            "sum := 0\nfor i := 0; i < 1000; i++ { sum += i }",
        ),
        (
            "vm/arithmetic_100",
            "r := 0\nfor i := 0; i < 100; i++ { r = r + i * 2 - i / 2 }",
        ),
        (
            "vm/tail_call_10000",
            "count := func(n, acc) { if n == 0 { return acc }; return count(n - 1, acc + 1) }\nout := count(10000, 0)",
        ),
        (
            "vm/map_and_array",
            "m := {}\nfor i := 0; i < 200; i++ { m[string(i)] = [i, i * 2] }\nt := 0\nfor k, v in m { t += v[1] }",
        ),
    ];

    for (name, source) in programs {
        let bytecode = compile(source);
        c.bench_function(name, |b| {
            b.iter(|| {
                let mut vm = Vm::new(bytecode.clone(), None, -1);
                black_box(vm.run())
            })
        });
    }
}

fn bench_spawn(c: &mut Criterion) {
    let source = r#"
ch := make_channel()
worker := func(c, n) { for i := 0; i < n; i++ { c.send(i) }; c.close() }
spawn(worker, ch, 100)
total := 0
for {
    v := ch.recv()
    if is_undefined(v) { break }
    total += v
}
"#;
    let bytecode = compile(source);
    c.bench_function("vm/channel_100", |b| {
        b.iter(|| {
            let mut vm = Vm::new(bytecode.clone(), None, -1);
            black_box(vm.run())
        })
    });
}

criterion_group!(
    benches,
    bench_lexer,
    bench_parser,
    bench_compiler,
    bench_vm,
    bench_spawn
);
criterion_main!(benches);

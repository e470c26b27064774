//! End-to-end interpreter scenarios
//!
//! Each test runs source through the full pipeline (scanner → compiler →
//! VM) and checks printed output, result status, and post-run VM state.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use stoat_engine::{Engine, InterpretError, VmConfig};

/// A `print` sink tests can read back.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn engine_with_buffer(config: VmConfig) -> (Engine, SharedBuf) {
    let buf = SharedBuf::default();
    let engine = Engine::with_output(config, Box::new(buf.clone()));
    (engine, buf)
}

/// Run source, expect success, return what it printed.
fn run(source: &str) -> String {
    let (mut engine, buf) = engine_with_buffer(VmConfig::default());
    engine.interpret(source).expect("program should run");
    assert!(engine.vm().is_settled(), "VM left unsettled after a run");
    buf.contents()
}

/// Run source, expect a runtime error, return its message.
fn run_runtime_error(source: &str) -> String {
    let (mut engine, _buf) = engine_with_buffer(VmConfig::default());
    match engine.interpret(source) {
        Err(InterpretError::Runtime(error)) => {
            assert!(engine.vm().is_settled(), "VM left unsettled after an error");
            error.message().to_string()
        }
        Err(InterpretError::Compile(errors)) => {
            panic!("expected runtime error, got compile errors: {errors}")
        }
        Ok(()) => panic!("expected runtime error, program succeeded"),
    }
}

// ---- Positive scenarios ----------------------------------------------------

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run("var a = \"hi\"; var b = \"!\"; print a + b;"), "hi!\n");
}

#[test]
fn closure_counter() {
    let source = "
        fun makeCounter() {
            var i = 0;
            fun count() { i = i + 1; return i; }
            return count;
        }
        var c = makeCounter();
        print c();
        print c();
        print c();
    ";
    assert_eq!(run(source), "1\n2\n3\n");
}

#[test]
fn inheritance_and_super() {
    let source = "
        class A { greet() { return \"hi\"; } }
        class B < A { greet() { return super.greet() + \"!\"; } }
        print B().greet();
    ";
    assert_eq!(run(source), "hi!\n");
}

#[test]
fn initializer_stores_fields() {
    let source = "
        class P { init(x) { this.x = x; } }
        var p = P(42);
        print p.x;
    ";
    assert_eq!(run(source), "42\n");
}

#[test]
fn continue_skips_an_iteration() {
    let source = "
        for (var i = 0; i < 3; i = i + 1) {
            if (i == 1) continue;
            print i;
        }
    ";
    assert_eq!(run(source), "0\n2\n");
}

// ---- Negative scenarios ----------------------------------------------------

#[test]
fn adding_number_and_string_fails() {
    let message = run_runtime_error("print 1 + \"a\";");
    assert!(message.contains("Operands must be two numbers or two strings."));
}

#[test]
fn calling_a_non_callable_fails() {
    let message = run_runtime_error("var x; x();");
    assert!(message.contains("Can only call functions and classes."));
}

#[test]
fn unknown_property_fails() {
    let message = run_runtime_error("class C {} print C().nope;");
    assert!(message.contains("Undefined property 'nope'."));
}

#[test]
fn undefined_global_fails() {
    let message = run_runtime_error("print missing;");
    assert!(message.contains("Undefined variable 'missing'."));
}

#[test]
fn wrong_arity_fails() {
    let message = run_runtime_error("fun two(a, b) {} two(1);");
    assert!(message.contains("Expected 2 arguments but got 1."));
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let message = run_runtime_error("fun f() { f(); } f();");
    assert!(message.contains("Stack overflow."));
}

#[test]
fn division_by_zero_fails() {
    let message = run_runtime_error("print 1 / 0;");
    assert!(message.contains("Division by zero."));
}

#[test]
fn fractional_modulus_fails() {
    let message = run_runtime_error("print 7.5 % 2;");
    assert!(message.contains("Operands must be integers."));
}

// ---- Language behavior -----------------------------------------------------

#[test]
fn logic_operators_short_circuit() {
    assert_eq!(
        run("print false and missing(); print true or missing();"),
        "false\ntrue\n"
    );
}

#[test]
fn ternary_selects_branches() {
    assert_eq!(run("print 1 < 2 ? \"yes\" : \"no\";"), "yes\n");
    assert_eq!(run("print nil ? \"yes\" : \"no\";"), "no\n");
}

#[test]
fn equality_is_type_strict() {
    assert_eq!(
        run("print 1 == 1; print 1 == \"1\"; print nil == nil; print nil == false;"),
        "true\nfalse\ntrue\nfalse\n"
    );
}

#[test]
fn interning_makes_content_equal_strings_identical() {
    assert_eq!(run("print \"ab\" == \"a\" + \"b\";"), "true\n");
}

#[test]
fn while_loop_counts() {
    assert_eq!(
        run("var i = 0; while (i < 3) { print i; i = i + 1; }"),
        "0\n1\n2\n"
    );
}

#[test]
fn switch_selects_a_case() {
    let source = "
        switch (2) {
            case 1: print \"one\";
            case 2: print \"two\";
            default: print \"many\";
        }
    ";
    assert_eq!(run(source), "two\n");
}

#[test]
fn switch_falls_back_to_default() {
    let source = "
        switch (9) {
            case 1: print \"one\";
            default: print \"many\";
        }
    ";
    assert_eq!(run(source), "many\n");
}

#[test]
fn switch_without_match_or_default_prints_nothing() {
    let source = "
        switch (9) {
            case 1: print \"one\";
        }
        print \"after\";
    ";
    assert_eq!(run(source), "after\n");
}

#[test]
fn continue_works_in_while_loops() {
    let source = "
        var i = 0;
        while (i < 4) {
            i = i + 1;
            if (i == 2) continue;
            print i;
        }
    ";
    assert_eq!(run(source), "1\n3\n4\n");
}

#[test]
fn upvalue_reads_and_writes_stay_consistent() {
    // Writing through the closure and reading the stack-resident local
    // observe the same storage while the frame is live; after it returns,
    // the closed-over value is the local's last value.
    let source = "
        var read;
        var write;
        fun scope() {
            var shared = \"initial\";
            fun get() { return shared; }
            fun set(v) { shared = v; }
            read = get;
            write = set;
            write(\"updated\");
            print shared;
        }
        scope();
        print read();
    ";
    assert_eq!(run(source), "updated\nupdated\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let source = "
        fun pair() {
            var n = 0;
            fun bump() { n = n + 1; return n; }
            fun peek() { return n; }
            bump();
            bump();
            print peek();
        }
        pair();
    ";
    assert_eq!(run(source), "2\n");
}

#[test]
fn fields_shadow_methods_on_invoke() {
    let source = "
        class C { m() { return \"method\"; } }
        fun shadow() { return \"field\"; }
        var c = C();
        print c.m();
        c.m = shadow;
        print c.m();
    ";
    assert_eq!(run(source), "method\nfield\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let source = "
        class C {
            init(tag) { this.tag = tag; }
            show() { return this.tag; }
        }
        var m = C(\"bound\").show;
        print m();
    ";
    assert_eq!(run(source), "bound\n");
}

#[test]
fn inherited_methods_are_copied_down() {
    let source = "
        class A { hello() { return \"hello\"; } }
        class B < A {}
        print B().hello();
    ";
    assert_eq!(run(source), "hello\n");
}

#[test]
fn subclass_initializer_is_inherited() {
    let source = "
        class A { init(x) { this.x = x; } }
        class B < A {}
        print B(7).x;
    ";
    assert_eq!(run(source), "7\n");
}

#[test]
fn delete_field_removes_a_field() {
    let source = "
        class C {}
        var c = C();
        c.x = 1;
        deleteField(c, \"x\");
        print c.x;
    ";
    let message = run_runtime_error(source);
    assert!(message.contains("Undefined property 'x'."));
}

#[test]
fn clock_is_monotonic_enough() {
    assert_eq!(run("var t = clock(); print t >= 0;"), "true\n");
}

#[test]
fn numeric_literals_round_trip() {
    assert_eq!(run("print 0.5; print 1234; print 3.75;"), "0.5\n1234\n3.75\n");
}

#[test]
fn block_comments_span_lines() {
    assert_eq!(run("/* one\ntwo */ print \"ok\";"), "ok\n");
}

// ---- Engine state ----------------------------------------------------------

#[test]
fn globals_persist_across_interpret_calls() {
    let (mut engine, buf) = engine_with_buffer(VmConfig::default());
    engine.interpret("var x = 41;").expect("define");
    engine.interpret("print x + 1;").expect("use");
    assert_eq!(buf.contents(), "42\n");
}

#[test]
fn engine_recovers_after_a_runtime_error() {
    let (mut engine, buf) = engine_with_buffer(VmConfig::default());
    assert!(engine.interpret("print 1 + nil;").is_err());
    assert!(engine.vm().is_settled());
    engine.interpret("print \"still alive\";").expect("recovered");
    assert_eq!(buf.contents(), "still alive\n");
}

#[test]
fn compile_errors_do_not_execute_anything() {
    let (mut engine, buf) = engine_with_buffer(VmConfig::default());
    let result = engine.interpret("print \"before\"; var = broken;");
    assert!(matches!(result, Err(InterpretError::Compile(_))));
    assert_eq!(buf.contents(), "");
}

#[test]
fn interpretation_is_deterministic() {
    let source = "
        fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
        print fib(12);
    ";
    let first = run(source);
    let second = run(source);
    assert_eq!(first, "144\n");
    assert_eq!(first, second);
}

// ---- GC stress -------------------------------------------------------------

#[test]
fn programs_survive_gc_stress_mode() {
    let config = VmConfig {
        gc_stress: true,
        ..VmConfig::default()
    };
    let (mut engine, buf) = engine_with_buffer(config);
    let source = "
        class Node { init(value) { this.value = value; this.next = nil; } }
        var head = nil;
        for (var i = 0; i < 20; i = i + 1) {
            var n = Node(i);
            n.next = head;
            head = n;
        }
        var sum = 0;
        while (head != nil) { sum = sum + head.value; head = head.next; }
        print sum;
        print \"gc\" + \"-\" + \"ok\";
    ";
    engine.interpret(source).expect("program runs under stress");
    assert_eq!(buf.contents(), "190\ngc-ok\n");
    assert!(engine.vm().is_settled());
}

#[test]
fn garbage_is_actually_reclaimed() {
    let config = VmConfig {
        gc_threshold: 0,
        ..VmConfig::default()
    };
    let (mut engine, _buf) = engine_with_buffer(config);
    // Churn through temporaries; the heap should stay bounded rather than
    // retaining every concatenation.
    let source = "
        var s = \"\";
        for (var i = 0; i < 50; i = i + 1) {
            s = \"x\" + \"y\";
        }
        print s;
    ";
    engine.interpret(source).expect("program runs");
    let live = engine.vm().heap().object_count();
    assert!(live < 100, "heap retained {live} objects");
}

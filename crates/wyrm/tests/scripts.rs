//! End-to-end language tests: parse, run, observe output.

use pretty_assertions::assert_eq;
use wyrm::{CollectStringPrint, Engine, VmError, VmErrorKind};

fn run(source: &str) -> String {
    let mut engine = Engine::new();
    let (_, module) = engine.parse("script.wy", source).expect("script parses");
    let mut print = CollectStringPrint::new();
    engine.run_module(&module, &mut print).expect("script runs");
    print.into_output()
}

fn run_err(source: &str) -> VmError {
    let mut engine = Engine::new();
    let (_, module) = engine.parse("script.wy", source).expect("script parses");
    let mut print = CollectStringPrint::new();
    engine
        .run_module(&module, &mut print)
        .expect_err("script is expected to fail")
}

#[test]
fn factorial_recursion() {
    let output = run("fn fact(n) { if (n == 0) return 1; return n * fact(n - 1); }\nprint(fact(6));");
    assert_eq!(output, "720\n");
}

#[test]
fn closure_captures_its_scope() {
    let output = run(
        "fn make() { let c = 0; fn inc() { c = c + 1; return c; }; return inc; }\n\
         let i = make();\n\
         print(i(), i(), i());",
    );
    assert_eq!(output, "123\n");
}

#[test]
fn closures_from_separate_calls_are_independent() {
    let output = run(
        "fn make() { let c = 0; fn inc() { c = c + 1; return c; }; return inc; }\n\
         let a = make();\n\
         let b = make();\n\
         print(a(), a(), b());",
    );
    assert_eq!(output, "121\n");
}

#[test]
fn prototype_inheritance_with_shadowing() {
    let output = run("let a = { x = 1 }; let b = new a { x = 2 }; print(a.x, b.x);");
    assert_eq!(output, "12\n");
}

#[test]
fn shadowing_assignment_leaves_the_prototype_alone() {
    let output = run("let a = { x = 1 }; let b = new a; b.x = 5; print(a.x, b.x);");
    assert_eq!(output, "15\n");
}

#[test]
fn inherited_reads_walk_the_chain() {
    let output = run("let a = { x = 7 }; let b = new a; print(b.x);");
    assert_eq!(output, "7\n");
}

#[test]
fn const_rebinding_is_a_runtime_error() {
    let err = run_err("const k = 1; k = 2;");
    assert!(
        matches!(err.kind(), VmErrorKind::AssignKeyNotFound(key) if key == "k"),
        "{err}"
    );
}

#[test]
fn const_still_reads_back() {
    let output = run("const k = 6; print(k * 7);");
    assert_eq!(output, "42\n");
}

#[test]
fn array_round_trip() {
    let output = run("let a = [10, 20, 30]; a.push(40); print(a.length, a[3]);");
    assert_eq!(output, "440\n");
}

#[test]
fn array_pop_and_index_assign() {
    let output = run("let a = [1, 2, 3]; a[0] = 9; print(a.pop(), a[0], a.length);");
    assert_eq!(output, "392\n");
}

#[test]
fn array_out_of_bounds_reports() {
    let err = run_err("let a = [1]; print(a[5]);");
    assert!(err.to_string().contains("array index out of bounds"), "{err}");
}

#[test]
fn string_concatenation() {
    let output = run("print(\"a\" + \"b\");");
    assert_eq!(output, "ab\n");
}

#[test]
fn string_equality() {
    let output = run("print(\"ab\" == \"ab\", \"ab\" == \"cd\");");
    assert_eq!(output, "truefalse\n");
}

#[test]
fn arithmetic_coercion_matrix() {
    // int op int stays int; any float operand produces float
    assert_eq!(run("print(7 / 2);"), "3\n");
    assert_eq!(run("print(1 + 0.5);"), "1.5\n");
    assert_eq!(run("print(0.5 + 1);"), "1.5\n");
    assert_eq!(run("print(0.5 + 0.25);"), "0.75\n");
}

#[test]
fn mixed_comparisons() {
    assert_eq!(run("print(1 < 1.5, 2.5 > 2);"), "truetrue\n");
}

#[test]
fn negated_comparisons() {
    assert_eq!(run("print(1 != 2, 3 !< 2, 2 !>= 5);"), "truetruetrue\n");
}

#[test]
fn unary_minus() {
    assert_eq!(run("let a = 3; print(-a + 5);"), "2\n");
}

#[test]
fn division_by_zero_reports() {
    let err = run_err("print(1 / 0);");
    assert!(err.to_string().contains("division by zero"), "{err}");
}

#[test]
fn while_loop_accumulates() {
    let output = run("let i = 0, sum = 0; while (i < 5) { sum = sum + i; i = i + 1; } print(sum);");
    assert_eq!(output, "10\n");
}

#[test]
fn for_loop_runs_its_step() {
    let output = run("for (let j = 0; j < 3; j = j + 1) { print(j); }");
    assert_eq!(output, "0\n1\n2\n");
}

#[test]
fn postfix_yields_the_prior_value() {
    let output = run("let i = 0; print(i++); print(i); print(i--); print(i);");
    assert_eq!(output, "0\n1\n1\n0\n");
}

#[test]
fn compound_assignment() {
    let output = run("let a = 10; a += 5; a -= 3; a *= 2; a /= 4; print(a);");
    assert_eq!(output, "6\n");
}

#[test]
fn methods_bind_this() {
    let output = run("let obj = { x = 1, bump = method(d) { return this.x + d; } }; print(obj.bump(2));");
    assert_eq!(output, "3\n");
}

#[test]
fn user_objects_overload_operators() {
    let output = run("let v = { n = 2, \"+\" = method(o) { return this.n + o; } }; print(v + 3);");
    assert_eq!(output, "5\n");
}

#[test]
fn truthiness_rules() {
    assert_eq!(run("if (0) print(1); else print(2);"), "2\n");
    assert_eq!(run("if (3) print(1); else print(2);"), "1\n");
    assert_eq!(run("if (1 == 1) print(1); else print(2);"), "1\n");
    // any non-null object is truthy
    assert_eq!(run("let o = {}; if (o) print(1); else print(2);"), "1\n");
    // null is falsy
    assert_eq!(run("if (null) print(1); else print(2);"), "2\n");
}

#[test]
fn missing_property_reports_key() {
    let err = run_err("let o = {}; print(o.nope);");
    assert!(
        matches!(err.kind(), VmErrorKind::KeyNotFound(key) if key == "nope"),
        "{err}"
    );
}

#[test]
fn calling_a_non_callable_reports() {
    let err = run_err("let o = {}; o();");
    assert!(matches!(err.kind(), VmErrorKind::NotCallable), "{err}");
}

#[test]
fn assigning_an_unknown_variable_reports() {
    let err = run_err("nope = 1;");
    assert!(
        matches!(err.kind(), VmErrorKind::AssignKeyNotFound(key) if key == "nope"),
        "{err}"
    );
}

#[test]
fn ackermann_exercises_deep_recursion() {
    let output = run(
        "fn ack(m, n) {\n\
         if (m == 0) return n + 1;\n\
         if (n == 0) return ack(m - 1, 1);\n\
         return ack(m - 1, ack(m, n - 1));\n\
         }\n\
         print(ack(2, 3));",
    );
    assert_eq!(output, "9\n");
}

#[test]
fn allocation_churn_survives_collections() {
    // enough short-lived scopes to cross the collection threshold many
    // times; correctness here means the collector never freed a live root
    let output = run("let i = 0; while (i < 20000) { let tmp = { a = i }; i = tmp.a + 1; } print(i);");
    assert_eq!(output, "20000\n");
}

#[test]
fn module_scope_values_survive_into_the_host() {
    let mut engine = Engine::new();
    let (_, module) = engine
        .parse("host.wy", "let label = \"pi\"; let value = 3.5; let flag = 1 == 1;")
        .unwrap();
    let mut print = CollectStringPrint::new();
    let scope = engine.run_module(&module, &mut print).unwrap();

    let label = engine.lookup(scope, "label").unwrap();
    assert_eq!(engine.string_value(label), Some("pi"));
    let value = engine.lookup(scope, "value").unwrap();
    assert_eq!(engine.float_value(value), Some(3.5));
    let flag = engine.lookup(scope, "flag").unwrap();
    assert_eq!(engine.bool_value(flag), Some(true));
}

#[test]
fn same_module_runs_twice() {
    let mut engine = Engine::new();
    let (_, module) = engine.parse("twice.wy", "print(\"run\");").unwrap();
    let mut print = CollectStringPrint::new();
    engine.run_module(&module, &mut print).unwrap();
    engine.run_module(&module, &mut print).unwrap();
    assert_eq!(print.output(), "run\nrun\n");
}

#[test]
fn nested_data_structures() {
    let output = run(
        "let grid = [[1, 2], [3, 4]];\n\
         print(grid[0][1], grid[1][0]);",
    );
    assert_eq!(output, "23\n");
}

#[test]
fn comments_are_filler() {
    let output = run(
        "// leading comment\n\
         let a = 1; /* inline */ let b = 2;\n\
         /* nested /* comment */ still here */\n\
         print(a + b);",
    );
    assert_eq!(output, "3\n");
}

#[test]
fn hex_and_negative_literals() {
    assert_eq!(run("print(0x10, -3);"), "16-3\n");
}

#[test]
fn strings_pass_utf8_through() {
    assert_eq!(run("print(\"héllo → wörld\");"), "héllo → wörld\n");
}

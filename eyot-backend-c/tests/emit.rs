//! Emission tests: run sources through the full front end and assert on
//! the generated C text.

use std::fs;

use eyot_ast::Errors;
use eyot_backend_c::write_program;
use eyot_core::{Environment, Program};
use tempfile::TempDir;

const STUB_COMMON_HEADER: &str = "/* eyot common runtime header */\n";

fn emit(source: &str) -> String {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("main.ey"), source).expect("write source");

    let env = Environment::with_roots(vec![dir.path().to_path_buf()]);
    let mut program = Program::new(env);
    let mut errors = Errors::new();
    program.parse_root("main", &mut errors);
    assert!(errors.clean(), "analysis failed:\n{}", errors.render());

    write_program(&program, STUB_COMMON_HEADER)
}

#[test]
fn hello_world_emits_one_string_pool_entry() {
    let c = emit("fn main() {\n    print_ln(\"hi\")\n}\n");

    assert!(c.contains("#include \"eyot-runtime-cpu.h\""));
    assert!(c.contains("ey_string_pool_raw_u32_0"));
    assert!(!c.contains("ey_string_pool_raw_u32_1"));

    // "hi" as UTF-32 code points.
    assert!(c.contains("104 , 105 , 0 }"));

    assert!(c.contains("ey_print_string"));
    assert!(c.contains("ey_print_nl"));
    assert!(c.contains("ey_generated_main"));
    assert!(c.contains("ey_function_main___unbound___main ( ctx )"));

    // No GPU: the device unit constant is null.
    assert!(c.contains("const char * ey_runtime_cl_src = 0"));
    assert!(!c.contains("__kernel"));
}

#[test]
fn zero_parameter_functions_get_shims_and_dispatch() {
    let c = emit("fn main() {\n    print_ln(\"x\")\n}\n");

    assert!(c.contains("ey_function_caller_main___unbound___main"));
    assert!(c.contains("ey_functioncaller"));
    assert!(c.contains("ey_generated_closure_arg_size"));
    assert!(c.contains("case k_ey_function_main___unbound___main :"));
}

#[test]
fn gpu_program_embeds_a_device_unit() {
    let source = "fn square(v i64) i64 {\n    return v * v\n}\n\ncpu fn main() {\n    let w = gpu square\n    send(w, [i64]{1, 2, 3, 4})\n    for v: drain(w) {\n        print_ln(v)\n    }\n}\n";
    let c = emit(source);

    // The device unit is a string constant of escaped lines.
    assert!(c.contains("const char * ey_runtime_cl_src ="));
    assert!(c.contains("__kernel"));
    assert!(c.contains("#define EYOT_RUNTIME_GPU"));
    assert!(c.contains(STUB_COMMON_HEADER.trim()));

    // The kernel body reads its work item and guards the range.
    assert!(c.contains("get_global_id"));
    assert!(c.contains("if (i < count) {"));

    // Worker creation names the kernel symbol.
    assert!(c.contains("ey_worker_create_opencl"));
    assert!(c.contains("ey_function_main___unbound___ey_generated_kernel_"));

    // The host side drives the pipe.
    assert!(c.contains("->send("));
    assert!(c.contains("->drain("));
}

#[test]
fn function_ids_agree_between_host_and_device() {
    let source = "fn square(v i64) i64 {\n    return v * v\n}\n\ncpu fn main() {\n    let w = gpu square\n    send(w, [i64]{1})\n    for v: drain(w) {\n        print_ln(v)\n    }\n}\n";
    let c = emit(source);

    // Pull out every assignment of the square enum constant; the host
    // unit and the embedded device unit must agree on the value.
    let needle = "k_ey_function_main___unbound___square =";
    let values: Vec<&str> = c
        .match_indices(needle)
        .map(|(at, _)| {
            let rest = &c[at + needle.len()..];
            rest.split(',').next().unwrap_or("").trim()
        })
        .collect();

    assert!(values.len() >= 2, "expected the id in both units");
    assert!(
        values.iter().all(|v| *v == values[0]),
        "enum ids diverged: {values:?}"
    );
}

#[test]
fn emission_is_bitwise_deterministic() {
    let source = "fn a() i64 {\n    return 1\n}\n\nfn b() i64 {\n    return 2\n}\n\nfn main() {\n    print_ln(a(), b(), \"x\", \"y\")\n}\n";
    let first = emit(source);
    let second = emit(source);
    assert_eq!(first, second);
}

#[test]
fn partial_application_emits_closure_creation() {
    let source = "fn multiply(a, b i64) i64 {\n    return a * b\n}\n\ncpu fn main() {\n    let dbl = partial multiply(_, 2)\n    print_ln(dbl(3))\n}\n";
    let c = emit(source);

    assert!(c.contains("ey_closure_create ( k_ey_function_main___unbound___multiply"));
    assert!(c.contains("ey_closure_call"));
    assert!(c.contains("EyClosure"));

    // The placeholder slot is a null entry in the packed address array.
    assert!(c.contains("{ 0 , &"));
}

#[test]
fn typed_vector_append_helper_is_generated_and_used() {
    let source = "cpu fn main() {\n    let v = [i64]{}\n    v.append(7)\n    print_ln(v.length())\n}\n";
    let c = emit(source);

    // Helper definition plus the rewritten call.
    assert!(c.contains("void ey_vector_append_i ("));
    assert!(c.contains("ey_vector_append_i(ey_execution_context, v, 7)"));
    assert!(c.contains("ey_vector_length"));
    assert!(c.contains("ey_vector_create"));
}

#[test]
fn empty_vector_literal_compiles_and_lengths_work() {
    let source = "cpu fn main() {\n    let v = [f32]{}\n    print_ln(v.length())\n}\n";
    let c = emit(source);

    assert!(c.contains("ey_vector_create(ey_execution_context, sizeof(EyFloat32))"));
    assert!(c.contains("ey_vector_length"));
}

#[test]
fn empty_string_pool_is_a_null_pointer() {
    let source = "fn main() {\n    let x = 1\n    print_ln(x)\n}\n";
    let c = emit(source);

    assert!(c.contains("EyStringS * ey_string_pool_raw = 0 ;"));
}

#[test]
fn tuple_types_are_emitted_once() {
    let source = "fn pair() (i64, i64) {\n    return 1, 2\n}\n\nfn both() (i64, i64) {\n    return 3, 4\n}\n\nfn main() {\n    let a, b = pair()\n    let c, d = both()\n    print_ln(a + b + c + d)\n}\n";
    let c = emit(source);

    let definitions = c.matches("} ey_tuple_ii ;").count();
    assert_eq!(definitions, 1, "tuple struct should be defined exactly once");

    assert!(c.contains("typedef struct ey_tuple_ii"));
    assert!(c.contains(".f0"));
    assert!(c.contains(".f1"));
}

#[test]
fn pinned_pointers_are_remembered_and_forgotten() {
    let source = "cpu fn main() {\n    let p = new 5\n    print_ln(*p)\n}\n";
    let c = emit(source);

    assert!(c.contains("ey_runtime_gc_remember_root_pointer"));
    assert!(c.contains("ey_runtime_gc_forget_root_pointer"));
    assert!(c.contains("ey_runtime_gc_alloc(ey_runtime_gc(ey_execution_context), sizeof(EyInteger), 0)"));
}

#[test]
fn struct_definitions_and_methods_emit() {
    let source = "struct Point {\n    x, y i64\n\n    fn sum() i64 {\n        return self.x + self.y\n    }\n}\n\nfn main() {\n    let p = Point { x: 1, y: 2 }\n    print_ln(p.sum())\n}\n";
    let c = emit(source);

    assert!(c.contains("typedef struct ey_struct_main__Point"));
    assert!(c.contains("ey_function_main__Point___bound___sum"));
    assert!(c.contains("ey_self"));

    // The receiver goes in by address.
    assert!(c.contains("&p"));

    // Defaulted literal emission uses designated initializers.
    assert!(c.contains(".x = 1"));
    assert!(c.contains(".y = 2"));
}

#[test]
fn string_assignments_route_through_the_literal_helper() {
    let source = "fn main() {\n    let s = \"hello\" + \"world\"\n    print_ln(s)\n}\n";
    let c = emit(source);

    assert!(c.contains("ey_runtime_string_use_literal"));
    assert!(c.contains("ey_runtime_string_join"));
    assert!(c.contains("ey_runtime_string_get ( ey_execution_context , 0 )"));
    assert!(c.contains("ey_runtime_string_get ( ey_execution_context , 1 )"));
}

#[test]
fn range_loops_emit_the_iteration_helper() {
    let source = "cpu fn main() {\n    for i: range(4) {\n        print_ln(i)\n    }\n}\n";
    let c = emit(source);

    assert!(c.contains("ey_runtime_continue_iterating("));
    assert!(c.contains("for ( EyInteger i ="));
}

#[test]
fn while_and_modify_statements_emit() {
    let source = "fn main() {\n    let x = 0\n    while x < 10 {\n        x += 3\n    }\n    print_ln(x)\n}\n";
    let c = emit(source);

    assert!(c.contains("while ("));
    assert!(c.contains("x += 3"));
}

#[test]
fn float_literals_keep_their_leading_zeros() {
    let source = "fn main() {\n    let x = 0.007\n    print_ln(x)\n}\n";
    let c = emit(source);

    assert!(c.contains("0.007"));
    assert!(c.contains("EyFloat64"));
}

#[test]
fn cpu_worker_creation_casts_the_wrapper() {
    let source = "fn double(v i64) i64 {\n    return v + v\n}\n\ncpu fn main() {\n    let w = cpu double\n    send(w, [i64]{1, 2})\n    for v: drain(w) {\n        print_ln(v)\n    }\n}\n";
    let c = emit(source);

    assert!(c.contains("ey_worker_create_cpu ( ( EyWorkerFunction )"));
    assert!(c.contains("generated_wrapper_"));
    assert!(c.contains("typed_input"));
    assert!(c.contains("typed_output"));
    // No device unit for a CPU-only pipeline.
    assert!(c.contains("const char * ey_runtime_cl_src = 0"));
}

#[test]
fn pipeline_creation_emits_the_runtime_call() {
    let source = "fn double(v i64) i64 {\n    return v + v\n}\n\nfn inc(v i64) i64 {\n    return v + 1\n}\n\ncpu fn main() {\n    let w = pipeline cpu double cpu inc\n    send(w, [i64]{1})\n    for v: drain(w) {\n        print_ln(v)\n    }\n}\n";
    let c = emit(source);

    assert!(c.contains("ey_worker_create_pipeline"));
    assert!(c.matches("ey_worker_create_cpu").count() >= 2);
}

// Error raising and recovery: pcall/xpcall, message formats with
// chunk/line positions, symbolic operand names, and handler rules.

use crate::test::{new_vm, run};

#[test]
fn pcall_catches_and_formats_position() {
    let mut vm = new_vm();
    let out = vm
        .execute_string(r#"return pcall(function() error("boom") end)"#)
        .expect("chunk runs");
    assert_eq!(out[0].as_boolean(), Some(false));
    let msg = vm.value_display(&out[1]);
    assert!(msg.ends_with(":1: boom"), "got: {}", msg);
}

#[test]
fn error_with_level_zero_is_raw() {
    let mut vm = new_vm();
    let out = vm
        .execute_string(r#"return pcall(function() error("plain", 0) end)"#)
        .expect("chunk runs");
    assert_eq!(vm.value_display(&out[1]), "plain");
}

#[test]
fn error_values_can_be_any_type() {
    run(r#"
        local ok, err = pcall(function() error({code = 42}) end)
        assert(ok == false)
        assert(type(err) == "table")
        assert(err.code == 42)
    "#);
}

#[test]
fn runtime_type_errors() {
    let mut vm = new_vm();
    let out = vm
        .execute_string(r#"return pcall(function() return {} + 1 end)"#)
        .expect("chunk runs");
    assert_eq!(out[0].as_boolean(), Some(false));
    let msg = vm.value_display(&out[1]);
    assert!(
        msg.contains("attempt to perform arithmetic"),
        "got: {}",
        msg
    );
}

#[test]
fn index_error_names_the_global() {
    let mut vm = new_vm();
    let out = vm
        .execute_string(r#"return pcall(function() return missing_global.field end)"#)
        .expect("chunk runs");
    assert_eq!(out[0].as_boolean(), Some(false));
    let msg = vm.value_display(&out[1]);
    assert!(msg.contains("attempt to index"), "got: {}", msg);
    assert!(msg.contains("missing_global"), "got: {}", msg);
}

#[test]
fn call_error_on_non_function() {
    run(r#"
        local ok, err = pcall(function()
            local x = 5
            x()
        end)
        assert(ok == false)
    "#);
}

#[test]
fn xpcall_runs_handler_at_throw_point() {
    run(r#"
        local seen
        local ok, res = xpcall(function()
            error("original")
        end, function(msg)
            seen = msg
            return "handled"
        end)
        assert(ok == false)
        assert(res == "handled")
        assert(seen ~= nil)
    "#);
}

#[test]
fn handler_error_reports_cascade() {
    let mut vm = new_vm();
    let out = vm
        .execute_string(
            r#"return xpcall(function() error("a") end, function() error("b") end)"#,
        )
        .expect("chunk runs");
    assert_eq!(out[0].as_boolean(), Some(false));
    let msg = vm.value_display(&out[1]);
    assert!(msg.contains("error in error handling"), "got: {}", msg);
}

#[test]
fn nested_pcall_recovers_independently() {
    run(r#"
        local outer_ok, inner_report = pcall(function()
            local ok, err = pcall(error, "deep")
            assert(ok == false)
            return "survived"
        end)
        assert(outer_ok == true)
        assert(inner_report == "survived")
    "#);
}

#[test]
fn assert_failures() {
    run(r#"
        local ok, err = pcall(function() assert(false, "custom") end)
        assert(ok == false and err == "custom")
        local ok2, err2 = pcall(function() assert(nil) end)
        assert(ok2 == false)
        -- assert passes values through
        local a, b = assert(1, 2)
        assert(a == 1 and b == 2)
    "#);
}

#[test]
fn uncaught_error_reaches_the_host() {
    let mut vm = new_vm();
    let r = vm.execute_string("error('top level')");
    assert!(r.is_err());
    assert!(vm.error_message().contains("top level"));
}

#[test]
fn for_loop_type_errors() {
    run(r#"
        local ok = pcall(function()
            for i = "a", 10 do end
        end)
        assert(ok == false)
    "#);
}

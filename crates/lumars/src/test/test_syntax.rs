// Parser and lexer coverage: statements, scoping, literals, escapes,
// and syntax-error reporting.

use crate::test::{new_vm, run};

#[test]
fn locals_and_assignment() {
    run(r#"
        local a = 1
        local b, c = 2, 3
        local d, e = 4
        assert(a == 1 and b == 2 and c == 3 and d == 4 and e == nil)
        a, b = b, a
        assert(a == 2 and b == 1)
    "#);
}

#[test]
fn if_elseif_else() {
    run(r#"
        local function pick(n)
            if n < 0 then
                return "neg"
            elseif n == 0 then
                return "zero"
            else
                return "pos"
            end
        end
        assert(pick(-3) == "neg")
        assert(pick(0) == "zero")
        assert(pick(7) == "pos")
    "#);
}

#[test]
fn while_and_repeat() {
    run(r#"
        local n, sum = 0, 0
        while n < 10 do
            n = n + 1
            sum = sum + n
        end
        assert(sum == 55)
        local i = 0
        repeat
            i = i + 1
            local done = i >= 5
        until done
        assert(i == 5)
    "#);
}

#[test]
fn numeric_for() {
    run(r#"
        local sum = 0
        for i = 1, 10 do sum = sum + i end
        assert(sum == 55)
        sum = 0
        for i = 10, 1, -2 do sum = sum + i end
        assert(sum == 30)
        local steps = 0
        for i = 1, 0 do steps = steps + 1 end
        assert(steps == 0)
    "#);
}

#[test]
fn generic_for() {
    run(r#"
        local t = {10, 20, 30}
        local sum = 0
        for i, v in ipairs(t) do sum = sum + i * v end
        assert(sum == 10 + 40 + 90)
    "#);
}

#[test]
fn goto_and_labels() {
    run(r#"
        local n = 0
        for i = 1, 10 do
            if i % 2 == 0 then goto continue end
            n = n + i
            ::continue::
        end
        assert(n == 25)
    "#);
}

#[test]
fn break_leaves_innermost_loop() {
    run(r#"
        local hits = 0
        for i = 1, 3 do
            for j = 1, 10 do
                if j > i then break end
                hits = hits + 1
            end
        end
        assert(hits == 1 + 2 + 3)
    "#);
}

#[test]
fn string_literals_and_escapes() {
    run(r#"
        assert("a\tb" ~= "a b")
        assert("\65\66\67" == "ABC")
        assert("\x41" == "A")
        assert("line1\
line2" == "line1\nline2")
        local long = [[
alpha
beta]]
        assert(long == "alpha\nbeta")
        assert([==[x]==] == "x")
        assert("a\z
               b" == "ab")
    "#);
}

#[test]
fn comments() {
    run(r#"
        -- short comment
        local a = 1 -- trailing
        --[[ long
             comment ]]
        local b = 2
        --[==[ leveled ]==]
        assert(a + b == 3)
    "#);
}

#[test]
fn number_literals() {
    run(r#"
        assert(0xFF == 255)
        assert(0x10 == 16)
        assert(1e2 == 100)
        assert(.5 == 0.5)
        assert(0x1p4 == 16)
    "#);
}

#[test]
fn multiple_results_spread_and_truncate() {
    run(r#"
        local function three() return 1, 2, 3 end
        local a, b = three()
        assert(a == 1 and b == 2)
        local t = {three()}
        assert(#t == 3)
        local u = {three(), 10}
        assert(#u == 2 and u[1] == 1 and u[2] == 10)
    "#);
}

#[test]
fn vararg_functions() {
    run(r#"
        local function count(...) return select('#', ...) end
        assert(count() == 0)
        assert(count(1, nil, 3) == 3)
        local function tail(...) local _, b = ... return b end
        assert(tail(7, 8, 9) == 8)
    "#);
}

#[test]
fn syntax_errors_are_reported() {
    let mut vm = new_vm();
    assert!(vm.execute_string("local = 5").is_err());
    assert!(vm.execute_string("if true then").is_err());
    assert!(vm.execute_string("return 1 +").is_err());
    assert!(vm.execute_string("goto nowhere").is_err());
    let err = vm.error_message();
    assert!(err.contains("nowhere"), "unexpected message: {}", err);
}

#[test]
fn shebang_is_skipped() {
    let mut vm = new_vm();
    let r = vm.execute_string("#!/usr/bin/env lua\nreturn 42");
    let out = r.expect("shebang chunk runs");
    assert_eq!(out[0].as_number(), Some(42.0));
}

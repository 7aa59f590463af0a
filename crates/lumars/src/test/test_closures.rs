// Closures and upvalues: capture, sharing, closing on scope exit, and
// recursion through local functions.

use crate::test::run;

#[test]
fn counter_keeps_state() {
    run(r#"
        local function make()
            local n = 0
            return function()
                n = n + 1
                return n
            end
        end
        local c1, c2 = make(), make()
        assert(c1() == 1 and c1() == 2 and c1() == 3)
        assert(c2() == 1)
    "#);
}

#[test]
fn sibling_closures_share_one_cell() {
    run(r#"
        local function pair()
            local v = 0
            local function get() return v end
            local function set(x) v = x end
            return get, set
        end
        local get, set = pair()
        set(99)
        assert(get() == 99)
    "#);
}

#[test]
fn upvalues_close_on_scope_exit() {
    run(r#"
        local fns = {}
        for i = 1, 3 do
            local captured = i * 10
            fns[i] = function() return captured end
        end
        assert(fns[1]() == 10)
        assert(fns[2]() == 20)
        assert(fns[3]() == 30)
    "#);
}

#[test]
fn loop_variable_is_fresh_per_iteration() {
    run(r#"
        local fns = {}
        for i = 1, 3 do
            fns[i] = function() return i end
        end
        assert(fns[1]() == 1 and fns[2]() == 2 and fns[3]() == 3)
    "#);
}

#[test]
fn local_function_recursion() {
    run(r#"
        local function fib(n)
            if n < 2 then return n end
            return fib(n - 1) + fib(n - 2)
        end
        assert(fib(15) == 610)
    "#);
}

#[test]
fn nested_capture_through_levels() {
    run(r#"
        local a = "outer"
        local function level1()
            local b = "mid"
            local function level2()
                return a .. "/" .. b
            end
            return level2()
        end
        assert(level1() == "outer/mid")
    "#);
}

#[test]
fn methods_and_self() {
    run(r#"
        local obj = {count = 0}
        function obj:bump(n)
            self.count = self.count + (n or 1)
            return self.count
        end
        assert(obj:bump() == 1)
        assert(obj:bump(10) == 11)
        assert(obj.bump(obj, 4) == 15)
    "#);
}

#[test]
fn break_closes_upvalues() {
    run(r#"
        local saved
        for i = 1, 5 do
            local x = i
            saved = function() return x end
            if i == 2 then break end
        end
        assert(saved() == 2)
    "#);
}

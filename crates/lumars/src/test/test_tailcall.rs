// Tail calls must reuse the caller's frame: deep recursion runs in
// constant stack space.

use crate::test::run;

#[test]
fn tail_recursion_to_one_million() {
    run(r#"
        local function f(n)
            if n == 0 then return 0 end
            return f(n - 1)
        end
        assert(f(1000000) == 0)
    "#);
}

#[test]
fn mutual_tail_recursion() {
    run(r#"
        local even, odd
        function even(n)
            if n == 0 then return true end
            return odd(n - 1)
        end
        function odd(n)
            if n == 0 then return false end
            return even(n - 1)
        end
        assert(even(100000) == true)
        assert(odd(100001) == true)
    "#);
}

#[test]
fn tail_call_passes_all_results() {
    run(r#"
        local function three() return 1, 2, 3 end
        local function forward() return three() end
        local a, b, c = forward()
        assert(a == 1 and b == 2 and c == 3)
    "#);
}

#[test]
fn non_tail_recursion_overflows_cleanly() {
    run(r#"
        local function deep(n)
            if n == 0 then return 0 end
            return 1 + deep(n - 1)
        end
        local ok = pcall(deep, 1000000)
        assert(ok == false)
    "#);
}

#[test]
fn tail_call_to_host_function() {
    run(r#"
        local function pick(...) return select('#', ...) end
        local function via(...) return pick(...) end
        assert(via(1, 2, 3) == 3)
    "#);
}

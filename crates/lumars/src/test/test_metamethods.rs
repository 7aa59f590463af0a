// Metamethod dispatch: index/newindex chains, operators, equality and
// ordering fallbacks, length, call, and metatable protection.

use crate::test::run;

#[test]
fn index_function_chain() {
    run(r#"
        local a = setmetatable({}, {__index = function(_, k) return k .. k end})
        assert(a.foo == "foofoo")
        assert(a["x"] == "xx")
    "#);
}

#[test]
fn index_table_chain_restarts_lookup() {
    run(r#"
        local base = {greet = "hello"}
        local mid = setmetatable({}, {__index = base})
        local top = setmetatable({}, {__index = mid})
        assert(top.greet == "hello")
        top.greet = "own"
        assert(top.greet == "own")
        assert(base.greet == "hello")
    "#);
}

#[test]
fn newindex_function_and_existing_entry_suppression() {
    run(r#"
        local log = {}
        local t = setmetatable({present = 1}, {
            __newindex = function(t, k, v) rawset(log, k, v) end,
        })
        t.fresh = "caught"
        assert(log.fresh == "caught")
        assert(rawget(t, "fresh") == nil)
        -- existing entries bypass __newindex
        t.present = 2
        assert(rawget(t, "present") == 2)
        assert(log.present == nil)
    "#);
}

#[test]
fn newindex_table_redirects() {
    run(r#"
        local store = {}
        local t = setmetatable({}, {__newindex = store})
        t.a = 5
        assert(rawget(t, "a") == nil)
        assert(store.a == 5)
    "#);
}

#[test]
fn arithmetic_metamethods() {
    run(r#"
        local mt = {
            __add = function(a, b) return a.v + b.v end,
            __mul = function(a, b) return a.v * b.v end,
            __unm = function(a) return -a.v end,
        }
        local x = setmetatable({v = 6}, mt)
        local y = setmetatable({v = 7}, mt)
        assert(x + y == 13)
        assert(x * y == 42)
        assert(-x == -6)
    "#);
}

#[test]
fn arith_metamethod_on_second_operand() {
    run(r#"
        local mt = {__add = function(a, b)
            local an = type(a) == "number" and a or a.v
            local bn = type(b) == "number" and b or b.v
            return an + bn
        end}
        local x = setmetatable({v = 10}, mt)
        assert(1 + x == 11)
        assert(x + 1 == 11)
    "#);
}

#[test]
fn eq_requires_same_type_and_shared_handler() {
    run(r#"
        local mt = {__eq = function(a, b) return a.id == b.id end}
        local a = setmetatable({id = 1}, mt)
        local b = setmetatable({id = 1}, mt)
        local c = setmetatable({id = 2}, mt)
        assert(a == b)
        assert(a ~= c)
        assert(a ~= 1)
        -- identity short-circuits the metamethod
        assert(a == a)
    "#);
}

#[test]
fn ordering_with_le_fallback() {
    run(r#"
        local mt = {__lt = function(a, b) return a.v < b.v end}
        local a = setmetatable({v = 1}, mt)
        local b = setmetatable({v = 2}, mt)
        assert(a < b)
        assert(not (b < a))
        -- __le missing: a <= b becomes not (b < a)
        assert(a <= b)
        assert(not (b <= a))
    "#);
}

#[test]
fn len_and_concat() {
    run(r#"
        local t = setmetatable({1, 2, 3}, {__len = function() return 42 end})
        assert(#t == 42)
        local c = setmetatable({}, {__concat = function(a, b)
            return "joined"
        end})
        assert((c .. "x") == "joined")
        assert(("x" .. c) == "joined")
    "#);
}

#[test]
fn call_metamethod() {
    run(r#"
        local f = setmetatable({}, {__call = function(self, a, b) return a + b end})
        assert(f(2, 3) == 5)
    "#);
}

#[test]
fn tostring_metamethod() {
    run(r#"
        local t = setmetatable({}, {__tostring = function() return "custom" end})
        assert(tostring(t) == "custom")
    "#);
}

#[test]
fn protected_metatable() {
    run(r#"
        local t = setmetatable({}, {__metatable = "locked"})
        assert(getmetatable(t) == "locked")
        local ok = pcall(setmetatable, t, {})
        assert(ok == false)
    "#);
}

#[test]
fn index_loop_is_bounded() {
    run(r#"
        local a, b = {}, {}
        setmetatable(a, {__index = b})
        setmetatable(b, {__index = a})
        local ok = pcall(function() return a.missing end)
        assert(ok == false)
    "#);
}

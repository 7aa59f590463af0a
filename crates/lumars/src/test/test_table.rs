// Table semantics through the VM: constructors, borders, iteration,
// raw access, and the store/lookup contract.

use crate::test::{new_vm, run};

#[test]
fn constructors() {
    run(r#"
        local t = {1, 2, 3, x = "a", [10] = "b", ["k e y"] = "c"}
        assert(t[1] == 1 and t[2] == 2 and t[3] == 3)
        assert(t.x == "a")
        assert(t[10] == "b")
        assert(t["k e y"] == "c")
        local nested = {inner = {deep = {42}}}
        assert(nested.inner.deep[1] == 42)
    "#);
}

#[test]
fn constructor_with_many_items_flushes_in_batches() {
    let mut src = String::from("local t = {");
    for i in 1..=120 {
        src.push_str(&format!("{},", i * 3));
    }
    src.push_str("} assert(#t == 120) assert(t[1] == 3) assert(t[120] == 360) ");
    src.push_str("for i = 1, 120 do assert(t[i] == i * 3) end");
    run(&src);
}

#[test]
fn store_then_lookup() {
    run(r#"
        local t = {}
        t[1] = "one"
        t["s"] = "str"
        t[2.5] = "frac"
        t[true] = "bool"
        assert(t[1] == "one")
        assert(t.s == "str")
        assert(t[2.5] == "frac")
        assert(t[true] == "bool")
        t[1] = nil
        assert(t[1] == nil)
        -- storing a value over itself changes nothing
        t.s = t.s
        assert(t.s == "str")
    "#);
}

#[test]
fn integer_float_key_equivalence() {
    run(r#"
        local t = {}
        t[3] = "x"
        assert(t[3.0] == "x")
        t[4.0] = "y"
        assert(t[4] == "y")
    "#);
}

#[test]
fn length_borders() {
    run(r#"
        assert(#{} == 0)
        assert(#{1, 2, 3} == 3)
        local t = {}
        for i = 1, 100 do t[i] = i end
        assert(#t == 100)
        t[100] = nil
        local b = #t
        assert(b == 99)
    "#);
}

#[test]
fn pairs_visits_each_entry_once() {
    run(r#"
        local t = {10, 20, 30, alpha = 1, beta = 2}
        local n, sum = 0, 0
        for k, v in pairs(t) do
            n = n + 1
            sum = sum + v
        end
        assert(n == 5)
        assert(sum == 63)
    "#);
}

#[test]
fn next_from_scratch() {
    run(r#"
        local t = {only = true}
        local k, v = next(t)
        assert(k == "only" and v == true)
        assert(next(t, k) == nil)
        assert(next({}) == nil)
    "#);
}

#[test]
fn raw_access_skips_metamethods() {
    run(r#"
        local t = setmetatable({}, {
            __index = function() return "meta" end,
            __newindex = function() error("blocked") end,
        })
        assert(t.missing == "meta")
        assert(rawget(t, "missing") == nil)
        rawset(t, "direct", 1)
        assert(rawget(t, "direct") == 1)
        assert(rawlen({1, 2}) == 2)
        assert(rawequal(t, t))
        assert(not rawequal(t, {}))
    "#);
}

#[test]
fn bad_keys_raise() {
    run(r#"
        local t = {}
        local ok1 = pcall(function() t[nil] = 1 end)
        assert(ok1 == false)
        local ok2 = pcall(function() t[0/0] = 1 end)
        assert(ok2 == false)
        -- reading with nil is just a miss
        assert(t[nil] == nil)
    "#);
}

#[test]
fn sparse_and_mixed_growth() {
    run(r#"
        local t = {}
        for i = 1, 64 do t[i * 17] = i end
        for i = 1, 64 do assert(t[i * 17] == i) end
        for i = 1, 64 do t[i] = -i end
        for i = 1, 64 do
            assert(t[i] == -i)
            assert(t[i * 17] == i or i * 17 <= 64)
        end
    "#);
}

#[test]
fn direct_table_api() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 0).unwrap();
    let tid = t.as_table_id().unwrap();
    let key = vm.new_string("answer").unwrap();
    vm.raw_set(t, key, crate::LuaValue::number(42.0)).unwrap();
    assert_eq!(vm.raw_get(t, &key).as_number(), Some(42.0));
    vm.raw_seti(tid, 1, crate::LuaValue::boolean(true));
    assert_eq!(vm.raw_geti(tid, 1).as_boolean(), Some(true));
}

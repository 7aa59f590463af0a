// Collector behavior observable from scripts: weak tables,
// ephemerons, finalizers, resurrection, and mode control.

use crate::test::{new_vm, run};

#[test]
fn weak_values_are_reclaimed() {
    run(r#"
        local t = setmetatable({}, {__mode = "v"})
        t[1] = {}
        collectgarbage()
        assert(t[1] == nil)
    "#);
}

#[test]
fn strong_values_survive_collection() {
    run(r#"
        local keep = {}
        local t = setmetatable({}, {__mode = "v"})
        t[1] = keep
        collectgarbage()
        assert(t[1] == keep)
    "#);
}

#[test]
fn weak_keys_are_reclaimed() {
    run(r#"
        local t = setmetatable({}, {__mode = "k"})
        t[{}] = "value for dead key"
        collectgarbage()
        local n = 0
        for _ in pairs(t) do n = n + 1 end
        assert(n == 0)
    "#);
}

#[test]
fn ephemeron_value_referencing_its_key_is_reclaimed() {
    run(r#"
        local k = {}
        local t = setmetatable({}, {__mode = "k"})
        t[k] = {backref = k}
        k = nil
        collectgarbage()
        local n = 0
        for _ in pairs(t) do n = n + 1 end
        assert(n == 0)
    "#);
}

#[test]
fn ephemeron_with_live_key_keeps_value() {
    run(r#"
        local k = {}
        local t = setmetatable({}, {__mode = "k"})
        t[k] = {backref = k}
        collectgarbage()
        assert(t[k] ~= nil)
        assert(t[k].backref == k)
    "#);
}

#[test]
fn finalizer_runs_once() {
    run(r#"
        local calls = 0
        do
            local obj = setmetatable({}, {__gc = function() calls = calls + 1 end})
            obj = nil
        end
        collectgarbage()
        assert(calls == 1)
        collectgarbage()
        assert(calls == 1)
    "#);
}

#[test]
fn finalizer_sees_the_object() {
    run(r#"
        local tagged
        do
            local obj = setmetatable({tag = "me"}, {__gc = function(o) tagged = o.tag end})
            obj = nil
        end
        collectgarbage()
        assert(tagged == "me")
    "#);
}

#[test]
fn collectgarbage_options() {
    run(r#"
        local before = collectgarbage("count")
        assert(before > 0)
        collectgarbage("stop")
        assert(collectgarbage("isrunning") == false)
        collectgarbage("restart")
        assert(collectgarbage("isrunning") == true)
        collectgarbage("step")
        collectgarbage("setpause", 200)
        collectgarbage("setstepmul", 200)
        collectgarbage()
    "#);
}

#[test]
fn generational_mode_runs_and_collects() {
    run(r#"
        collectgarbage("generational")
        local t = setmetatable({}, {__mode = "v"})
        t[1] = {}
        for i = 1, 1000 do
            local _ = {i}
        end
        collectgarbage()
        assert(t[1] == nil)
        collectgarbage("incremental")
        collectgarbage()
    "#);
}

#[test]
fn heavy_allocation_with_automatic_steps() {
    run(r#"
        local live = {}
        for i = 1, 2000 do
            local garbage = {pad = i .. "-" .. i}
            if i % 100 == 0 then live[#live + 1] = garbage end
        end
        assert(#live == 20)
        for i, v in ipairs(live) do
            assert(v.pad == (i * 100) .. "-" .. (i * 100))
        end
    "#);
}

#[test]
fn string_interning_survives_collection() {
    let mut vm = new_vm();
    let a = vm.new_string("shared-text").unwrap();
    vm.anchor(a);
    vm.collect_garbage_full(false);
    let b = vm.new_string("shared-text").unwrap();
    assert!(a.raw_eq(&b), "equal strings must share identity");
}

#[test]
fn anchored_values_survive() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 0).unwrap();
    let ticket = vm.anchor(t);
    vm.collect_garbage_full(false);
    // Still alive: usable without panicking.
    let key = vm.new_string("k").unwrap();
    vm.raw_set(t, key, crate::LuaValue::number(1.0)).unwrap();
    vm.unanchor(ticket);
}

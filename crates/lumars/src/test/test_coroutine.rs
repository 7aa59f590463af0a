// Coroutines: the producer protocol, value transfer in both
// directions, statuses, wrap, errors, and yields across pcall.

use crate::test::run;

#[test]
fn producer_yields_then_dies() {
    run(r#"
        local co = coroutine.create(function()
            for i = 1, 3 do coroutine.yield(i) end
        end)
        local ok1, v1 = coroutine.resume(co)
        local ok2, v2 = coroutine.resume(co)
        local ok3, v3 = coroutine.resume(co)
        assert(ok1 and v1 == 1)
        assert(ok2 and v2 == 2)
        assert(ok3 and v3 == 3)
        local ok4, v4 = coroutine.resume(co)
        assert(ok4 == true and v4 == nil)
        assert(coroutine.status(co) == "dead")
        local ok5, err = coroutine.resume(co)
        assert(ok5 == false)
        assert(err == "cannot resume dead coroutine")
    "#);
}

#[test]
fn values_flow_both_ways() {
    run(r#"
        local co = coroutine.create(function(a, b)
            local c = coroutine.yield(a + b)
            local d, e = coroutine.yield(c * 2)
            return d + e
        end)
        local _, sum = coroutine.resume(co, 3, 4)
        assert(sum == 7)
        local _, doubled = coroutine.resume(co, 10)
        assert(doubled == 20)
        local _, final = coroutine.resume(co, 1, 2)
        assert(final == 3)
    "#);
}

#[test]
fn statuses() {
    run(r#"
        local co
        co = coroutine.create(function()
            assert(coroutine.status(co) == "running")
            coroutine.yield()
        end)
        assert(coroutine.status(co) == "suspended")
        coroutine.resume(co)
        assert(coroutine.status(co) == "suspended")
        coroutine.resume(co)
        assert(coroutine.status(co) == "dead")
    "#);
}

#[test]
fn wrap_propagates_values_and_errors() {
    run(r#"
        local gen = coroutine.wrap(function()
            coroutine.yield("a")
            coroutine.yield("b")
            error("done")
        end)
        assert(gen() == "a")
        assert(gen() == "b")
        local ok = pcall(gen)
        assert(ok == false)
    "#);
}

#[test]
fn error_in_coroutine_reports_to_resumer() {
    run(r#"
        local co = coroutine.create(function() error("inner") end)
        local ok, err = coroutine.resume(co)
        assert(ok == false)
        assert(coroutine.status(co) == "dead")
    "#);
}

#[test]
fn yield_from_main_is_an_error() {
    run(r#"
        local ok = pcall(coroutine.yield)
        assert(ok == false)
    "#);
}

#[test]
fn resume_running_coroutine_fails() {
    run(r#"
        local co
        co = coroutine.create(function()
            local ok, err = coroutine.resume(co)
            assert(ok == false)
            assert(err == "cannot resume non-suspended coroutine")
        end)
        local ok = coroutine.resume(co)
        assert(ok == true)
    "#);
}

#[test]
fn isyieldable_inside_and_outside() {
    run(r#"
        assert(coroutine.isyieldable() == false)
        local co = coroutine.create(function()
            assert(coroutine.isyieldable() == true)
        end)
        assert(coroutine.resume(co))
    "#);
}

#[test]
fn running_identifies_main() {
    run(r#"
        local main, ismain = coroutine.running()
        assert(ismain == true)
        local co = coroutine.create(function()
            local inner, im = coroutine.running()
            assert(im == false)
            assert(inner ~= main)
        end)
        assert(coroutine.resume(co))
    "#);
}

#[test]
fn yield_across_pcall_resumes_continuation() {
    run(r#"
        local co = coroutine.create(function()
            local ok, v = pcall(function()
                return coroutine.yield("suspended") .. "!"
            end)
            return ok, v
        end)
        local ok1, w = coroutine.resume(co, "start")
        assert(ok1 and w == "suspended")
        local ok2, pok, v = coroutine.resume(co, "back")
        assert(ok2 == true)
        assert(pok == true)
        assert(v == "back!")
    "#);
}

#[test]
fn error_after_yield_is_caught_by_pcall() {
    run(r#"
        local co = coroutine.create(function()
            local ok, err = pcall(function()
                coroutine.yield()
                error("late")
            end)
            return ok
        end)
        assert(coroutine.resume(co))
        local ok, caught = coroutine.resume(co)
        assert(ok == true)
        assert(caught == false)
    "#);
}

#[test]
fn nested_coroutines() {
    run(r#"
        local inner = coroutine.create(function()
            coroutine.yield("from-inner")
            return "inner-done"
        end)
        local outer = coroutine.create(function()
            local _, v = coroutine.resume(inner)
            coroutine.yield(v)
            local _, w = coroutine.resume(inner)
            return w
        end)
        local _, got = coroutine.resume(outer)
        assert(got == "from-inner")
        local _, fin = coroutine.resume(outer)
        assert(fin == "inner-done")
    "#);
}

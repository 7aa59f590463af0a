// Arithmetic, comparison, logical, and concatenation semantics.

use crate::test::run;

#[test]
fn arithmetic() {
    run(r#"
        assert(1 + 2 == 3)
        assert(7 - 10 == -3)
        assert(3 * 4 == 12)
        assert(7 / 2 == 3.5)
        assert(2 ^ 10 == 1024)
        assert(7 % 3 == 1)
        assert(-7 % 3 == 2)
        assert(7 % -3 == -2)
        assert(-2 ^ 2 == -4)
    "#);
}

#[test]
fn string_number_coercion() {
    run(r#"
        assert("10" + 5 == 15)
        assert("0x10" * 2 == 32)
        assert(10 .. 20 == "1020")
        assert("pi=" .. 3.5 == "pi=3.5")
    "#);
}

#[test]
fn comparisons() {
    run(r#"
        assert(1 < 2 and 2 <= 2 and 3 > 2 and 3 >= 3)
        assert("abc" < "abd")
        assert("abc" < "abcd")
        assert(not ("b" < "ab"))
        assert(1 == 1.0)
        assert("1" ~= 1)
        assert(nil == nil)
        assert(nil ~= false)
    "#);
}

#[test]
fn logic_short_circuit() {
    run(r#"
        assert((false or 5) == 5)
        assert((nil and 1) == nil)
        assert((1 and 2) == 2)
        assert((false and error("never")) == false)
        assert((true or error("never")) == true)
        local x = nil
        local y = x or "default"
        assert(y == "default")
    "#);
}

#[test]
fn not_and_length() {
    run(r#"
        assert(not nil)
        assert(not false)
        assert(not not 0)
        assert(#"hello" == 5)
        assert(#"" == 0)
        assert(#{1, 2, 3} == 3)
    "#);
}

#[test]
fn concat_is_right_associative_and_batched() {
    run(r#"
        local a = "a" .. "b" .. "c" .. "d"
        assert(a == "abcd")
        assert(1 .. 2 .. 3 == "123")
    "#);
}

#[test]
fn division_and_modulo_by_zero_are_not_folded() {
    run(r#"
        local inf = 1 / 0
        assert(inf > 1e308)
        local nan = 0 / 0
        assert(nan ~= nan)
        local m = 5 % 0
        assert(m ~= m)
    "#);
}

#[test]
fn constant_folding_preserves_values() {
    run(r#"
        assert(2 + 3 * 4 == 14)
        assert((2 + 3) * 4 == 20)
        assert(2 ^ 3 ^ 2 == 512)
        assert(10 - 3 - 2 == 5)
    "#);
}

#[test]
fn tostring_tonumber_round_trip() {
    run(r#"
        assert(tonumber(tostring(0.1)) == 0.1)
        assert(tonumber(tostring(12345)) == 12345)
        assert(tonumber(tostring(-2.5e-7)) == -2.5e-7)
        assert(tostring(1) == "1")
        assert(tonumber("  42  ") == 42)
        assert(tonumber("abc") == nil)
        assert(tonumber("ff", 16) == 255)
        assert(tonumber("101", 2) == 5)
    "#);
}

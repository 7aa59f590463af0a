// Number <-> string conversions.
//
// The canonical number formatter produces the shortest decimal form
// that round-trips back to the same double, so number -> string ->
// number is the identity and the output never depends on the host
// locale. String -> number follows the lexical rules of the language:
// optional surrounding whitespace, decimal literals, and hex literals
// with an optional fractional part and binary exponent.

use std::fmt::Write as _;

/// Canonical number -> string conversion.
pub fn number_to_str(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    // Integral values in the exactly-representable range print without
    // a decimal point or exponent.
    if n == n.trunc() && n.abs() < 1e15 {
        let mut buf = itoa::Buffer::new();
        return buf.format(n as i64).to_string();
    }
    let mag = n.abs();
    let mut out = String::new();
    if (1e-4..1e15).contains(&mag) {
        // Plain decimal notation; Rust's shortest-roundtrip formatter.
        let _ = write!(out, "{}", n);
    } else {
        // Scientific notation for very large/small magnitudes.
        let _ = write!(out, "{:e}", n);
    }
    out
}

/// String -> number conversion (`tonumber` and arithmetic coercion).
/// Returns None when the text is not a full valid numeral.
pub fn str_to_number(s: &str) -> Option<f64> {
    let t = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if t.is_empty() {
        return None;
    }
    if let Some(n) = parse_hex_numeral(t) {
        return Some(n);
    }
    if let Ok(n) = t.parse::<f64>() {
        // Rust's parser accepts "inf"/"NaN" spellings; C's strtod does
        // too, so keep them.
        return Some(n);
    }
    // Fallback for text written with a decimal comma.
    if t.contains(',') {
        let fixed = t.replace(',', ".");
        if let Ok(n) = fixed.parse::<f64>() {
            return Some(n);
        }
    }
    None
}

/// Parse `[+-]0x` hex numerals: integral digits, optional fractional
/// digits, optional `p`/`P` binary exponent (decimal, signed).
fn parse_hex_numeral(t: &str) -> Option<f64> {
    let bytes = t.as_bytes();
    let mut i = 0;
    let mut neg = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        neg = bytes[i] == b'-';
        i += 1;
    }
    if i + 1 >= bytes.len() || bytes[i] != b'0' || (bytes[i + 1] | 0x20) != b'x' {
        return None;
    }
    i += 2;
    let mut mantissa: f64 = 0.0;
    let mut any_digits = false;
    while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
        mantissa = mantissa * 16.0 + hex_digit(bytes[i]) as f64;
        any_digits = true;
        i += 1;
    }
    let mut exponent: i32 = 0;
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
            mantissa = mantissa * 16.0 + hex_digit(bytes[i]) as f64;
            exponent -= 4;
            any_digits = true;
            i += 1;
        }
    }
    if !any_digits {
        return None;
    }
    if i < bytes.len() && (bytes[i] | 0x20) == b'p' {
        i += 1;
        let mut exp_neg = false;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            exp_neg = bytes[i] == b'-';
            i += 1;
        }
        if i >= bytes.len() || !bytes[i].is_ascii_digit() {
            return None;
        }
        let mut e: i32 = 0;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            e = e.saturating_mul(10).saturating_add((bytes[i] - b'0') as i32);
            i += 1;
        }
        exponent += if exp_neg { -e } else { e };
    }
    if i != bytes.len() {
        return None;
    }
    let mut r = mantissa * (exponent as f64).exp2();
    if neg {
        r = -r;
    }
    Some(r)
}

#[inline(always)]
fn hex_digit(b: u8) -> u32 {
    match b {
        b'0'..=b'9' => (b - b'0') as u32,
        b'a'..=b'f' => (b - b'a' + 10) as u32,
        _ => (b - b'A' + 10) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_values_print_bare() {
        assert_eq!(number_to_str(0.0), "0");
        assert_eq!(number_to_str(-3.0), "-3");
        assert_eq!(number_to_str(1234567.0), "1234567");
    }

    #[test]
    fn fractional_values_round_trip() {
        for &n in &[0.1, 3.14, -2.5e-7, 1.7976931348623157e308, 5e-324] {
            let s = number_to_str(n);
            assert_eq!(str_to_number(&s), Some(n), "round-trip of {}", s);
        }
    }

    #[test]
    fn decimal_parsing() {
        assert_eq!(str_to_number("  123  "), Some(123.0));
        assert_eq!(str_to_number("3.14"), Some(3.14));
        assert_eq!(str_to_number(".5"), Some(0.5));
        assert_eq!(str_to_number("5."), Some(5.0));
        assert_eq!(str_to_number("1e3"), Some(1000.0));
        assert_eq!(str_to_number("-1E-2"), Some(-0.01));
        assert_eq!(str_to_number("x"), None);
        assert_eq!(str_to_number("10 20"), None);
        assert_eq!(str_to_number(""), None);
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(str_to_number("0xff"), Some(255.0));
        assert_eq!(str_to_number("0XFF"), Some(255.0));
        assert_eq!(str_to_number("-0x10"), Some(-16.0));
        assert_eq!(str_to_number("0x1p4"), Some(16.0));
        assert_eq!(str_to_number("0x.8"), Some(0.5));
        assert_eq!(str_to_number("0x1.8p1"), Some(3.0));
        assert_eq!(str_to_number("0x"), None);
        assert_eq!(str_to_number("0xp1"), None);
    }

    #[test]
    fn decimal_comma_fallback() {
        assert_eq!(str_to_number("3,5"), Some(3.5));
    }
}

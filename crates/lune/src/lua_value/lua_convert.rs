// Coercions between numbers and strings.
//
// String->number follows the lexer conventions: optional surrounding
// whitespace, optional sign, decimal integers/floats, and 0x/0X hex
// integers (wrapping like the original runtime's hex reader). Number->
// string keeps integers exact (itoa) and floats in %.14g shape.

use crate::lua_value::LuaValue;

/// Parse a string into a number value, integer-preserving.
pub fn str_to_number(s: &str) -> Option<LuaValue> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    // Hex: sign, then 0x prefix.
    let (neg, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        // Wrapping accumulation, matching the reference hex reader.
        let mut acc: i64 = 0;
        for b in hex.bytes() {
            let d = (b as char).to_digit(16).unwrap() as i64;
            acc = acc.wrapping_mul(16).wrapping_add(d);
        }
        return Some(LuaValue::Integer(if neg { acc.wrapping_neg() } else { acc }));
    }

    // Decimal integer first, so "3" stays exact.
    if let Ok(i) = s.parse::<i64>() {
        return Some(LuaValue::Integer(i));
    }
    // Rust's f64 parser also accepts "inf"/"nan" spellings, which the
    // lexer does not; only digit-shaped input may pass through.
    if !s
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return None;
    }
    s.parse::<f64>().ok().map(LuaValue::Float)
}

/// Format a number the way `tostring` does.
pub fn number_to_str(v: &LuaValue) -> Option<String> {
    match v {
        LuaValue::Integer(i) => {
            let mut buf = itoa::Buffer::new();
            Some(buf.format(*i).to_string())
        }
        LuaValue::Float(f) => Some(float_to_str(*f)),
        _ => None,
    }
}

/// %.14g-style float formatting: trailing-zero trimming, and a ".0"
/// suffix so floats stay visually distinct from integers.
pub fn float_to_str(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == f.floor() && f.abs() < 1e15 {
        return format!("{:.1}", f);
    }
    let s = format!("{:.14e}", f);
    // Round-trip through shortest display when it is exact enough.
    let short = format!("{}", f);
    if short.parse::<f64>() == Ok(f) { short } else { s }
}

/// Convert a value to an integer, accepting integral floats and numeric
/// strings. This is the `tointeger` coercion.
pub fn to_integer(v: &LuaValue) -> Option<i64> {
    match v {
        LuaValue::Integer(i) => Some(*i),
        LuaValue::Float(f) => float_to_integer(*f),
        _ => None,
    }
}

/// Exact float->integer conversion; fails on fractional or out-of-range
/// values instead of truncating.
pub fn float_to_integer(f: f64) -> Option<i64> {
    if f.fract() != 0.0 {
        return None;
    }
    // i64::MAX is not exactly representable as f64; the half-open range
    // check below is the one that is.
    if f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
        Some(f as i64)
    } else {
        None
    }
}

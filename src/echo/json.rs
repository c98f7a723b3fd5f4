//! JSON encoding that matches what clients of the echo service already
//! receive: every number is a float64 and markup characters in strings are
//! escaped.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;

/// Serde formatter producing the float64 rendering of numbers and escaping
/// `<`, `>`, `&`, U+2028 and U+2029 inside strings
#[derive(Debug, Default)]
pub struct Float64Formatter;

/// Shortest round-trip digits, plain notation inside `[1e-6, 1e21)` and
/// exponent notation with an explicit sign outside it
pub fn format_float64(value: f64) -> String {
    let abs = value.abs();
    if abs != 0.0 && !(1e-6..1e21).contains(&abs) {
        let repr = format!("{:e}", value);
        match repr.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => repr,
        }
    } else {
        value.to_string()
    }
}

impl Formatter for Float64Formatter {
    fn write_i64<W>(&mut self, writer: &mut W, value: i64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.write_f64(writer, value as f64)
    }

    fn write_u64<W>(&mut self, writer: &mut W, value: u64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        self.write_f64(writer, value as f64)
    }

    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(format_float64(value).as_bytes())
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            let escaped = match ch {
                '<' => "\\u003c",
                '>' => "\\u003e",
                '&' => "\\u0026",
                '\u{2028}' => "\\u2028",
                '\u{2029}' => "\\u2029",
                _ => continue,
            };
            writer.write_all(fragment[start..index].as_bytes())?;
            writer.write_all(escaped.as_bytes())?;
            start = index + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

pub fn to_string(value: &Value) -> serde_json::Result<String> {
    let mut serializer = serde_json::Serializer::with_formatter(Vec::new(), Float64Formatter);
    value.serialize(&mut serializer)?;
    String::from_utf8(serializer.into_inner()).map_err(serde::ser::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integral_floats_have_no_fraction() {
        assert_eq!(format_float64(1.0), "1");
        assert_eq!(format_float64(100.0), "100");
        assert_eq!(format_float64(-0.0), "-0");
        assert_eq!(format_float64(1.8446744073709552e19), "18446744073709552000");
    }

    #[test]
    fn test_exponent_notation_outside_plain_range() {
        assert_eq!(format_float64(1e21), "1e+21");
        assert_eq!(format_float64(1.5e300), "1.5e+300");
        assert_eq!(format_float64(1e-7), "1e-7");
        assert_eq!(format_float64(2.5e-10), "2.5e-10");
        assert_eq!(format_float64(0.000001), "0.000001");
        assert_eq!(format_float64(0.5), "0.5");
    }

    #[test]
    fn test_integers_lose_precision_like_float64() {
        let value = json!({ "big": 12345678901234567890u64, "small": -3 });
        assert_eq!(to_string(&value).unwrap(), r#"{"big":12345678901234567000,"small":-3}"#);
    }

    #[test]
    fn test_markup_characters_escaped() {
        let value = json!({ "html": "<a href=\"x\">&</a>", "sep": "a\u{2028}b" });
        assert_eq!(
            to_string(&value).unwrap(),
            r#"{"html":"\u003ca href=\"x\"\u003e\u0026\u003c/a\u003e","sep":"a\u2028b"}"#
        );
    }
}

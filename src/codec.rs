use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::value::PhpValue;

/// Grammar violation found while decoding a PHP-serialized value.
///
/// These never escape the engine: a cell that fails to decode is treated as
/// opaque text and matched/replaced without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("unknown type tag '{tag}' at byte {at}")]
    UnknownTag { tag: char, at: usize },
    #[error("expected '{expected}' at byte {at}")]
    Expected { expected: char, at: usize },
    #[error("invalid length prefix at byte {0}")]
    BadLength(usize),
    #[error("declared length {declared} overruns input at byte {at}")]
    LengthOverrun { declared: usize, at: usize },
    #[error("string content at byte {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("invalid integer literal at byte {0}")]
    BadInt(usize),
    #[error("invalid float literal at byte {0}")]
    BadFloat(usize),
    #[error("invalid boolean literal at byte {0}")]
    BadBool(usize),
    #[error("trailing data after value at byte {0}")]
    TrailingData(usize),
}

/// A cell value after the one-time format decision.
///
/// Decided once at decode time so downstream code branches on a closed shape
/// instead of re-inspecting raw text.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Php(PhpValue),
    Json(JsonValue),
    Plain(String),
}

impl Decoded {
    /// Re-emit the value as wire text. Total; the inverse of decoding for
    /// any value the decoder produced.
    pub fn encode(&self) -> String {
        match self {
            Decoded::Php(value) => encode(value),
            // serde_json's Display emits compact JSON and cannot fail for a
            // tree that came from a successful parse.
            Decoded::Json(value) => value.to_string(),
            Decoded::Plain(text) => text.clone(),
        }
    }
}

/// Decode a raw cell value, deciding its format once: PHP serialized form
/// first, then JSON (only for `{`/`[` prefixes), then opaque text.
pub fn decode_any(raw: &str) -> Decoded {
    if looks_php_serialized(raw) {
        if let Ok(value) = decode(raw) {
            return Decoded::Php(value);
        }
    }
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<JsonValue>(raw) {
            return Decoded::Json(value);
        }
    }
    Decoded::Plain(raw.to_string())
}

/// Quick envelope check before committing to a full parse.
///
/// Same anchored shapes WordPress tooling recognizes; a positive here still
/// has to survive the strict decoder.
pub fn looks_php_serialized(raw: &str) -> bool {
    static ENVELOPE: OnceLock<Regex> = OnceLock::new();
    let envelope = ENVELOPE.get_or_init(|| {
        Regex::new(
            r#"(?s)^(?:a:\d+:\{.*\}|s:\d+:".*";|i:-?\d+;|b:[01];|d:[^;]+;|N;)$"#,
        )
        .expect("envelope pattern is valid")
    });
    !raw.is_empty() && envelope.is_match(raw)
}

/// Strict decode of the PHP serialize grammar. The whole input must be one
/// value; trailing bytes are an error.
pub fn decode(raw: &str) -> Result<PhpValue, FormatError> {
    let mut parser = Parser {
        input: raw.as_bytes(),
        pos: 0,
    };
    let value = parser.parse_value()?;
    if parser.pos != parser.input.len() {
        return Err(FormatError::TrailingData(parser.pos));
    }
    Ok(value)
}

/// Encode a value tree back to wire text. Length prefixes are computed from
/// the content, so they are correct by construction.
pub fn encode(value: &PhpValue) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &PhpValue) {
    match value {
        PhpValue::Null => out.push_str("N;"),
        PhpValue::Bool(flag) => {
            out.push_str(if *flag { "b:1;" } else { "b:0;" });
        }
        PhpValue::Int(number) => {
            let _ = write!(out, "i:{number};");
        }
        PhpValue::Float(number) => {
            if number.is_nan() {
                out.push_str("d:NAN;");
            } else if number.is_infinite() {
                out.push_str(if *number > 0.0 { "d:INF;" } else { "d:-INF;" });
            } else {
                let _ = write!(out, "d:{number};");
            }
        }
        PhpValue::Str(content) => {
            let _ = write!(out, "s:{}:\"{content}\";", content.len());
        }
        PhpValue::Array(pairs) => {
            let _ = write!(out, "a:{}:{{", pairs.len());
            for (key, val) in pairs {
                write_value(out, key);
                write_value(out, val);
            }
            out.push('}');
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn parse_value(&mut self) -> Result<PhpValue, FormatError> {
        let tag = self.next_byte()?;
        match tag {
            b'N' => {
                self.expect(b';')?;
                Ok(PhpValue::Null)
            }
            b'b' => {
                self.expect(b':')?;
                let at = self.pos;
                let flag = match self.next_byte()? {
                    b'0' => false,
                    b'1' => true,
                    _ => return Err(FormatError::BadBool(at)),
                };
                self.expect(b';')?;
                Ok(PhpValue::Bool(flag))
            }
            b'i' => {
                self.expect(b':')?;
                let at = self.pos;
                let literal = self.take_until(b';')?;
                let number = literal.parse().map_err(|_| FormatError::BadInt(at))?;
                Ok(PhpValue::Int(number))
            }
            b'd' => {
                self.expect(b':')?;
                let at = self.pos;
                let literal = self.take_until(b';')?;
                let number = match literal {
                    "INF" => f64::INFINITY,
                    "-INF" => f64::NEG_INFINITY,
                    "NAN" => f64::NAN,
                    other => other.parse().map_err(|_| FormatError::BadFloat(at))?,
                };
                Ok(PhpValue::Float(number))
            }
            b's' => {
                self.expect(b':')?;
                let len = self.parse_length()?;
                self.expect(b':')?;
                self.expect(b'"')?;
                let at = self.pos;
                let end = at
                    .checked_add(len)
                    .filter(|end| *end <= self.input.len())
                    .ok_or(FormatError::LengthOverrun { declared: len, at })?;
                let content = std::str::from_utf8(&self.input[at..end])
                    .map_err(|_| FormatError::InvalidUtf8(at))?
                    .to_string();
                self.pos = end;
                self.expect(b'"')?;
                self.expect(b';')?;
                Ok(PhpValue::Str(content))
            }
            b'a' => {
                self.expect(b':')?;
                let count = self.parse_length()?;
                self.expect(b':')?;
                self.expect(b'{')?;
                let mut pairs = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let key = self.parse_value()?;
                    let val = self.parse_value()?;
                    pairs.push((key, val));
                }
                self.expect(b'}')?;
                Ok(PhpValue::Array(pairs))
            }
            other => Err(FormatError::UnknownTag {
                tag: other as char,
                at: self.pos - 1,
            }),
        }
    }

    fn next_byte(&mut self) -> Result<u8, FormatError> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or(FormatError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<(), FormatError> {
        let at = self.pos;
        let byte = self.next_byte()?;
        if byte != expected {
            return Err(FormatError::Expected {
                expected: expected as char,
                at,
            });
        }
        Ok(())
    }

    fn parse_length(&mut self) -> Result<usize, FormatError> {
        let start = self.pos;
        while self.input.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(FormatError::BadLength(start));
        }
        let digits = std::str::from_utf8(&self.input[start..self.pos])
            .expect("digits are ascii");
        digits.parse().map_err(|_| FormatError::BadLength(start))
    }

    fn take_until(&mut self, terminator: u8) -> Result<&str, FormatError> {
        let start = self.pos;
        while let Some(byte) = self.input.get(self.pos) {
            if *byte == terminator {
                let literal = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| FormatError::InvalidUtf8(start))?;
                self.pos += 1;
                return Ok(literal);
            }
            self.pos += 1;
        }
        Err(FormatError::UnexpectedEof(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(raw: &str) -> PhpValue {
        let value = decode(raw).expect("decode");
        assert_eq!(encode(&value), raw, "encode must invert decode");
        value
    }

    #[test]
    fn scalars_roundtrip() {
        assert_eq!(roundtrip("N;"), PhpValue::Null);
        assert_eq!(roundtrip("b:0;"), PhpValue::Bool(false));
        assert_eq!(roundtrip("b:1;"), PhpValue::Bool(true));
        assert_eq!(roundtrip("i:-42;"), PhpValue::Int(-42));
        assert_eq!(roundtrip("d:3.25;"), PhpValue::Float(3.25));
        assert_eq!(
            roundtrip("s:11:\"example.com\";"),
            PhpValue::Str("example.com".to_string())
        );
    }

    #[test]
    fn nested_array_roundtrips() {
        let raw = "a:2:{s:4:\"name\";s:5:\"World\";s:3:\"url\";a:1:{i:0;s:14:\"http://old.com\";}}";
        let value = roundtrip(raw);
        let PhpValue::Array(pairs) = &value else {
            panic!("expected array, got {value:?}");
        };
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, PhpValue::Str("name".to_string()));
    }

    #[test]
    fn string_lengths_are_bytes_not_chars() {
        // "café" is four chars but five bytes.
        let value = roundtrip("s:5:\"café\";");
        assert_eq!(value, PhpValue::Str("café".to_string()));
    }

    #[test]
    fn embedded_quotes_and_semicolons_are_content() {
        let value = roundtrip("s:8:\"a\";b:\"c;\";");
        assert_eq!(value, PhpValue::Str("a\";b:\"c;".to_string()));
    }

    #[test]
    fn declared_length_overrun_is_rejected() {
        assert_eq!(
            decode("s:99:\"short\";"),
            Err(FormatError::LengthOverrun { declared: 99, at: 6 })
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = decode("O:8:\"stdClass\":0:{}").unwrap_err();
        assert_eq!(err, FormatError::UnknownTag { tag: 'O', at: 0 });
    }

    #[test]
    fn trailing_data_is_rejected() {
        assert_eq!(decode("i:1;i:2;"), Err(FormatError::TrailingData(4)));
    }

    #[test]
    fn unbalanced_array_is_rejected() {
        assert!(decode("a:2:{s:1:\"a\";s:1:\"b\";}").is_err());
        assert!(decode("a:1:{s:1:\"a\";s:1:\"b\";").is_err());
    }

    #[test]
    fn length_splitting_a_multibyte_char_is_rejected() {
        assert_eq!(decode("s:3:\"café\";"), Err(FormatError::InvalidUtf8(5)));
    }

    #[test]
    fn special_floats_roundtrip() {
        assert_eq!(roundtrip("d:INF;"), PhpValue::Float(f64::INFINITY));
        assert_eq!(roundtrip("d:-INF;"), PhpValue::Float(f64::NEG_INFINITY));
        assert_eq!(decode("d:1.5E+25;").unwrap(), PhpValue::Float(1.5e25));
    }

    #[test]
    fn envelope_sniff_matches_serialized_shapes() {
        assert!(looks_php_serialized("s:3:\"abc\";"));
        assert!(looks_php_serialized("a:0:{}"));
        assert!(looks_php_serialized("i:-7;"));
        assert!(looks_php_serialized("N;"));
        assert!(!looks_php_serialized(""));
        assert!(!looks_php_serialized("hello world"));
        assert!(!looks_php_serialized("{\"a\":1}"));
        assert!(!looks_php_serialized("s:3:\"abc\"; trailing"));
    }

    #[test]
    fn decode_any_prefers_php_then_json_then_plain() {
        assert!(matches!(decode_any("s:2:\"ab\";"), Decoded::Php(_)));
        assert!(matches!(decode_any("{\"host\":\"x\"}"), Decoded::Json(_)));
        assert!(matches!(decode_any("[1,2,3]"), Decoded::Json(_)));
        assert!(matches!(decode_any("just text"), Decoded::Plain(_)));
        // Bare JSON scalars stay plain; only object/array prefixes count.
        assert!(matches!(decode_any("123"), Decoded::Plain(_)));
    }

    #[test]
    fn decode_any_falls_back_on_corrupt_envelope() {
        // Looks serialized but the declared length lies.
        let decoded = decode_any("s:99:\"short\";");
        assert_eq!(decoded, Decoded::Plain("s:99:\"short\";".to_string()));
    }

    #[test]
    fn plain_and_json_encode_preserve_content() {
        let plain = decode_any("no envelope here");
        assert_eq!(plain.encode(), "no envelope here");
        let json = decode_any("{\"a\":1}");
        assert_eq!(json.encode(), "{\"a\":1}");
    }
}

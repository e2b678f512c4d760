/// A decoded PHP-serialized value.
///
/// WordPress option and meta cells store these as length-prefixed text.
/// String nodes hold only their content; the byte-length prefix is derived
/// from the content on encode, so a mutated leaf can never disagree with its
/// declared length. Arrays keep insertion order, matching PHP's ordered
/// hashes, and keys are full values because serialized arrays mix integer
/// and string keys freely.
#[derive(Debug, Clone, PartialEq)]
pub enum PhpValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<(PhpValue, PhpValue)>),
}

use blake2::digest::{Update, VariableOutput};
use blake2::VarBlake2b;
use serde_yaml::Value;

use super::Document;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_SEQUENCE: u8 = 6;
const TAG_MAPPING: u8 = 7;

/// Canonical 64-bit hash of a document.
///
/// Two documents with the same content fingerprint identically regardless of
/// mapping insertion order: mapping entries are hashed sorted by the encoded
/// key. This is what makes the factory's restart-if-changed check sound.
pub fn fingerprint(doc: &Document) -> u64 {
    let mut buf = Vec::new();
    encode(doc, &mut buf);

    let mut hasher = VarBlake2b::new(8).unwrap();
    hasher.update(&buf);
    let mut out = [0u8; 8];
    hasher.finalize_variable(|digest| out.copy_from_slice(digest));
    u64::from_le_bytes(out)
}

fn encode(doc: &Document, out: &mut Vec<u8>) {
    match doc {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(value) => {
            out.push(TAG_BOOL);
            out.push(*value as u8);
        }
        Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                out.push(TAG_INT);
                out.extend_from_slice(&value.to_le_bytes());
            } else if let Some(value) = number.as_u64() {
                out.push(TAG_UINT);
                out.extend_from_slice(&value.to_le_bytes());
            } else {
                out.push(TAG_FLOAT);
                let bits = number.as_f64().unwrap_or(f64::NAN).to_bits();
                out.extend_from_slice(&bits.to_le_bytes());
            }
        }
        Value::String(value) => {
            out.push(TAG_STRING);
            out.extend_from_slice(&(value.len() as u64).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        Value::Sequence(items) => {
            out.push(TAG_SEQUENCE);
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                encode(item, out);
            }
        }
        Value::Mapping(map) => {
            out.push(TAG_MAPPING);
            out.extend_from_slice(&(map.len() as u64).to_le_bytes());
            let mut entries: Vec<(Vec<u8>, &Value)> = map
                .iter()
                .map(|(key, value)| {
                    let mut encoded_key = Vec::new();
                    encode(key, &mut encoded_key);
                    (encoded_key, value)
                })
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (encoded_key, value) in entries {
                out.extend_from_slice(&encoded_key);
                encode(value, out);
            }
        }
    }
}

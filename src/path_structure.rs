//! `path-structure.json` parsing and encoded-ID (eid) derivation
//! (`spec.md` §4.3, §6, §8).
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DatasetError, Result};
use crate::value::Value;

const HEX_ALPHABET: &[u8; 16] = b"0123456789abcdef";
const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scheme {
    Int,
    #[serde(rename = "msgpack/hash")]
    MsgpackHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Hex,
    Base64,
}

/// Parsed `path-structure.json` (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathStructure {
    pub scheme: Scheme,
    pub branches: u32,
    pub levels: u32,
    pub encoding: Encoding,
}

impl PathStructure {
    pub fn parse(contents: &str) -> Result<PathStructure> {
        let ps: PathStructure =
            serde_json::from_str(contents).map_err(|e| DatasetError::InvalidFileContents {
                path: "path-structure.json".into(),
                reason: e.to_string(),
            })?;
        ps.validate()?;
        Ok(ps)
    }

    fn validate(&self) -> Result<()> {
        let bad = |reason: &str| {
            Err(DatasetError::SchemaValidation {
                subject: "path-structure.json".into(),
                reason: reason.to_string(),
            })
        };
        if self.levels < 1 {
            return bad("levels must be >= 1");
        }
        match self.encoding {
            Encoding::Base64 => {
                if self.branches != 64 {
                    return bad("encoding=base64 requires branches=64");
                }
            }
            Encoding::Hex => {
                if self.branches != 16 && self.branches != 256 {
                    return bad("encoding=hex requires branches in {16, 256}");
                }
            }
        }
        Ok(())
    }

    /// Characters contributed to the folder tree per `levels` step (`spec.md` §4.3).
    ///
    /// Derived from `branches` rather than fixed per-encoding: a `hex`
    /// encoding with 16 branches contributes one hex nibble per level, while
    /// 256 branches contributes a full byte's worth (two hex chars) per
    /// level. This exactly reproduces both worked examples in `spec.md` §8.
    fn chars_per_level(&self) -> usize {
        match (self.encoding, self.branches) {
            (Encoding::Hex, 16) => 1,
            (Encoding::Hex, 256) => 2,
            (Encoding::Base64, 64) => 1,
            _ => unreachable!("validated at construction"),
        }
    }

    fn alphabet(&self) -> &'static [u8] {
        match self.encoding {
            Encoding::Hex => HEX_ALPHABET,
            Encoding::Base64 => BASE64_ALPHABET,
        }
    }

    fn zero_char(&self) -> u8 {
        self.alphabet()[0]
    }

    /// Derive the encoded ID (eid) for a primary-key tuple (`spec.md` §4.3).
    pub fn eid(&self, primary_keys: &[Value]) -> Result<String> {
        match self.scheme {
            Scheme::Int => self.eid_int(primary_keys),
            Scheme::MsgpackHash => self.eid_hash(primary_keys),
        }
    }

    fn eid_int(&self, primary_keys: &[Value]) -> Result<String> {
        if primary_keys.len() != 1 {
            return Err(DatasetError::InconsistentState(
                "int path-structure scheme requires exactly one primary key".into(),
            ));
        }
        let Value::Integer(n) = &primary_keys[0] else {
            return Err(DatasetError::InconsistentState(
                "int path-structure scheme requires an integer primary key".into(),
            ));
        };

        let filename = filename_for(std::slice::from_ref(&primary_keys[0]))?;

        let chars_per_level = self.chars_per_level();
        let take = self.levels as usize * chars_per_level;
        let want_chars = take + 1;
        let folder_chars = encode_bigint_in_alphabet(n, self.alphabet(), self.zero_char(), want_chars);
        // The last generated character is intentionally dropped so consecutive
        // integers don't fan out a new folder per increment.
        let segment = &folder_chars[..take];
        Ok(join_folder_segments(segment, &filename))
    }

    fn eid_hash(&self, primary_keys: &[Value]) -> Result<String> {
        let filename = filename_for(primary_keys)?;
        let packed = pack_values_for_hash(primary_keys)?;
        let digest = Sha256::digest(&packed);

        let chars_per_level = self.chars_per_level();
        let want_chars = self.levels as usize * chars_per_level;
        let encoded = match self.encoding {
            Encoding::Hex => hex::encode(digest),
            Encoding::Base64 => encode_bytes_base64_classic(&digest),
        };
        let padded = left_pad(&encoded, want_chars, self.zero_char() as char);
        let segment: Vec<u8> = padded.bytes().take(want_chars).collect();
        Ok(join_folder_segments(&segment, &filename))
    }
}

fn join_folder_segments(folder_chars: &[u8], filename: &str) -> String {
    let mut out = String::new();
    for &c in folder_chars {
        out.push(c as char);
        out.push('/');
    }
    out.push_str(filename);
    out
}

fn filename_for(primary_keys: &[Value]) -> Result<String> {
    let packed = crate::msgpack::pack_value_tuple(primary_keys)?;
    Ok(base64_url_no_pad(&packed))
}

fn pack_values_for_hash(primary_keys: &[Value]) -> Result<Vec<u8>> {
    crate::msgpack::pack_value_tuple(primary_keys)
}

fn base64_url_no_pad(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(bytes)
}

fn encode_bytes_base64_classic(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(bytes).trim_end_matches('=').to_string()
}

fn left_pad(s: &str, want_len: usize, pad: char) -> String {
    if s.len() >= want_len {
        return s.to_string();
    }
    let mut out: String = std::iter::repeat(pad).take(want_len - s.len()).collect();
    out.push_str(s);
    out
}

/// Big-endian encode `n` in the given alphabet, keeping only its `want_chars`
/// most-significant digits (least-significant digits beyond that are
/// truncated, not rounded), left-padded with `zero_char` if `n` is shorter.
fn encode_bigint_in_alphabet(
    n: &num_bigint::BigInt,
    alphabet: &[u8],
    zero_char: u8,
    want_chars: usize,
) -> Vec<u8> {
    let radix = alphabet.len() as u32;
    let (_, mut magnitude) = n.to_radix_be(radix);
    magnitude.truncate(want_chars);
    let mut chars: Vec<u8> = magnitude.iter().map(|&d| alphabet[d as usize]).collect();
    while chars.len() < want_chars {
        chars.insert(0, zero_char);
    }
    chars
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;

    fn int_ps(levels: u32) -> PathStructure {
        PathStructure {
            scheme: Scheme::Int,
            branches: 16,
            levels,
            encoding: Encoding::Hex,
        }
    }

    #[test]
    fn worked_example_1_int_hex_levels2() {
        let ps = int_ps(2);
        let eid = ps.eid(&[Value::Integer(BigInt::from(12345))]).unwrap();
        assert_eq!(eid, "3/0/kc0wOQ");
    }

    #[test]
    fn worked_example_2_composite_base64_hash() {
        let ps = PathStructure {
            scheme: Scheme::MsgpackHash,
            branches: 64,
            levels: 3,
            encoding: Encoding::Base64,
        };
        let eid = ps
            .eid(&[Value::Text("A".into()), Value::Text("7".into())])
            .unwrap();
        let parts: Vec<&str> = eid.split('/').collect();
        assert_eq!(parts.len(), 4); // 3 folder chars + filename
    }

    #[test]
    fn consecutive_ints_differ_in_bounded_folder_chars() {
        let ps = int_ps(2);
        let a = ps.eid(&[Value::Integer(BigInt::from(100))]).unwrap();
        let b = ps.eid(&[Value::Integer(BigInt::from(101))]).unwrap();
        let folder_a: Vec<&str> = a.split('/').collect();
        let folder_b: Vec<&str> = b.split('/').collect();
        let diffs = folder_a[..2]
            .iter()
            .zip(folder_b[..2].iter())
            .filter(|(x, y)| x != y)
            .count();
        assert!(diffs <= 2);
    }

    #[test]
    fn rejects_bad_encoding_branches_combo() {
        let bad = r#"{"scheme":"int","branches":64,"levels":2,"encoding":"hex"}"#;
        assert!(PathStructure::parse(bad).is_err());
    }
}

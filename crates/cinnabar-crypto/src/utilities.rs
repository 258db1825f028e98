// Copyright 2025 The cinnabar developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    DecodeError, Engine,
};
use ruma::CanonicalJsonValue;
use serde::Serialize;

use crate::error::SignatureError;

/// Decode the input as base64 with no padding.
pub fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, DecodeError> {
    STANDARD_NO_PAD.decode(input)
}

/// Encode the input as base64 with no padding.
pub fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(input)
}

/// Decode the input as URL-safe base64 with no padding.
pub fn decode_url_safe(input: impl AsRef<[u8]>) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD.decode(input)
}

/// Decode unpadded base64 that may come in either the standard or the
/// URL-safe alphabet, with or without padding.
///
/// Servers and other clients are not consistent here, so the decoder is
/// deliberately lenient.
pub fn decode_lenient(input: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = input.trim_end_matches('=');
    decode(trimmed).or_else(|_| decode_url_safe(trimmed))
}

/// Convert a serializable value into the Matrix canonical JSON string form.
///
/// The `signatures` and `unsigned` fields are stripped before
/// canonicalization, as required for signing and signature checks.
pub fn canonical_json(value: &impl Serialize) -> Result<String, SignatureError> {
    let mut value = serde_json::to_value(value).map_err(|_| SignatureError::NotAnObject)?;

    let object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    object.remove("signatures");
    object.remove("unsigned");

    let canonical: CanonicalJsonValue = value.try_into()?;

    Ok(canonical.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{canonical_json, decode_lenient, encode};

    #[test]
    fn canonicalization_sorts_keys_and_strips_signatures() {
        let value = json!({
            "b": 1,
            "a": {"y": [3, 2], "x": "ä"},
            "signatures": {"@alice:example.org": {"ed25519:DEV": "sig"}},
            "unsigned": {"age": 4},
        });

        let canonical = canonical_json(&value).unwrap();

        assert_eq!(canonical, r#"{"a":{"x":"ä","y":[3,2]},"b":1}"#);
    }

    #[test]
    fn lenient_base64_accepts_padded_and_url_safe_input() {
        let bytes = vec![0xfb, 0xff, 0x00, 0x12];
        let standard = encode(&bytes);

        assert_eq!(decode_lenient(&standard).unwrap(), bytes);
        assert_eq!(decode_lenient(&format!("{standard}=")).unwrap(), bytes);
        assert_eq!(decode_lenient(&standard.replace('+', "-").replace('/', "_")).unwrap(), bytes);
    }
}

/// Versioned record codec and schema compatibility checking.
///
/// Stored records pass through a small versioned codec: one format version
/// byte followed by a self-describing JSON body. Records carry opaque
/// `serde_json::Value` payloads (observation results, schema descriptors),
/// which rules out non-self-describing formats; JSON round-trips them
/// losslessly. The version byte is what lets a future format change coexist
/// with already-written records.
///
/// Schema and encoding descriptors are opaque JSON to the rest of the
/// engine; the revisioning algorithm only consults them through the
/// [`SchemaCompat`] trait, so deployments with richer schema languages can
/// swap in their own checker.
use crate::error::{HubError, HubResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// Current on-wire format version.
pub const FORMAT_VERSION: u8 = 1;

/// Encodes and decodes stored records with a format version header.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionedCodec;

impl VersionedCodec {
    /// Encode a record, prepending the current format version.
    pub fn encode<T: Serialize>(&self, value: &T) -> HubResult<Vec<u8>> {
        let body =
            serde_json::to_vec(value).map_err(|e| HubError::Storage(format!("encode: {e}")))?;
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a record written by any supported format version.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> HubResult<T> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| HubError::Decode("empty record".into()))?;
        if version != FORMAT_VERSION {
            return Err(HubError::Decode(format!(
                "unsupported format version {version}"
            )));
        }
        serde_json::from_slice(body).map_err(|e| HubError::Decode(e.to_string()))
    }
}

/// Structural comparison of opaque schema/encoding descriptors.
///
/// The revisioning algorithm needs three judgements: exact structural
/// equality, backward compatibility, and encoding equality.
pub trait SchemaCompat: Send + Sync {
    /// Whether two schema descriptors are structurally identical.
    fn structurally_equal(&self, a: &JsonValue, b: &JsonValue) -> bool;

    /// Whether `candidate` is backward-compatible with `existing`: data
    /// recorded under `existing` must remain describable by `candidate`.
    fn structurally_compatible(&self, existing: &JsonValue, candidate: &JsonValue) -> bool;

    /// Whether two encoding descriptors are identical.
    fn encoding_equal(&self, a: &JsonValue, b: &JsonValue) -> bool;
}

impl std::fmt::Debug for dyn SchemaCompat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SchemaCompat")
    }
}

/// Default JSON checker.
///
/// Compatibility rule: every field path present in `existing` must exist in
/// `candidate` with the same JSON type; objects recurse, arrays compare
/// their first element's shape, and extra candidate fields are allowed.
/// Descriptive string fields (`label`, `description`) are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaCompat;

const COSMETIC_FIELDS: [&str; 2] = ["label", "description"];

fn same_type(a: &JsonValue, b: &JsonValue) -> bool {
    use JsonValue::*;
    matches!(
        (a, b),
        (Null, Null)
            | (Bool(_), Bool(_))
            | (Number(_), Number(_))
            | (String(_), String(_))
            | (Array(_), Array(_))
            | (Object(_), Object(_))
    )
}

fn covers(existing: &JsonValue, candidate: &JsonValue) -> bool {
    if !same_type(existing, candidate) {
        return false;
    }
    match (existing, candidate) {
        (JsonValue::Object(a), JsonValue::Object(b)) => a.iter().all(|(field, sub)| {
            if COSMETIC_FIELDS.contains(&field.as_str()) {
                return true;
            }
            b.get(field).is_some_and(|other| covers(sub, other))
        }),
        (JsonValue::Array(a), JsonValue::Array(b)) => match (a.first(), b.first()) {
            (Some(ea), Some(eb)) => covers(ea, eb),
            (Some(_), None) => false,
            _ => true,
        },
        _ => true,
    }
}

fn strip_cosmetic(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .filter(|(field, _)| !COSMETIC_FIELDS.contains(&field.as_str()))
                .map(|(field, sub)| (field.clone(), strip_cosmetic(sub)))
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(strip_cosmetic).collect()),
        other => other.clone(),
    }
}

impl SchemaCompat for JsonSchemaCompat {
    fn structurally_equal(&self, a: &JsonValue, b: &JsonValue) -> bool {
        strip_cosmetic(a) == strip_cosmetic(b)
    }

    fn structurally_compatible(&self, existing: &JsonValue, candidate: &JsonValue) -> bool {
        covers(existing, candidate)
    }

    fn encoding_equal(&self, a: &JsonValue, b: &JsonValue) -> bool {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codec_round_trip() {
        let codec = VersionedCodec;
        let value = json!({"temp": 21.5, "unit": "Cel"});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(bytes[0], FORMAT_VERSION);
        let back: JsonValue = codec.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_records_with_opaque_payloads_read_back() {
        use crate::time::Time;
        use crate::types::{DataStreamId, DataStreamInfo, Observation, SystemId};

        let codec = VersionedCodec;
        let obs = Observation::new(
            DataStreamId(7),
            Time::from_seconds(42),
            json!({"temp": 21.5, "flags": [1, 2, 3]}),
        );
        let back: Observation = codec.decode(&codec.encode(&obs).unwrap()).unwrap();
        assert_eq!(back, obs);

        let ds = DataStreamInfo::new(SystemId(1), "temp")
            .with_schema(json!({"name": "temp", "fields": {"value": {"type": "Quantity"}}}))
            .with_encoding(json!({"type": "text"}));
        let back: DataStreamInfo = codec.decode(&codec.encode(&ds).unwrap()).unwrap();
        assert_eq!(back.schema, ds.schema);
        assert_eq!(back.encoding, ds.encoding);
    }

    #[test]
    fn test_codec_rejects_unknown_version() {
        let codec = VersionedCodec;
        let mut bytes = codec.encode(&json!(1)).unwrap();
        bytes[0] = 99;
        let result: HubResult<JsonValue> = codec.decode(&bytes);
        assert!(matches!(result, Err(HubError::Decode(_))));
    }

    #[test]
    fn test_compatible_when_fields_added() {
        let compat = JsonSchemaCompat;
        let existing = json!({"fields": {"temp": {"type": "Quantity"}}});
        let candidate = json!({"fields": {
            "temp": {"type": "Quantity"},
            "humidity": {"type": "Quantity"}
        }});
        assert!(compat.structurally_compatible(&existing, &candidate));
        assert!(!compat.structurally_compatible(&candidate, &existing));
    }

    #[test]
    fn test_incompatible_on_type_change() {
        let compat = JsonSchemaCompat;
        let existing = json!({"temp": {"type": "Quantity", "value": 0.0}});
        let candidate = json!({"temp": {"type": "Quantity", "value": "zero"}});
        assert!(!compat.structurally_compatible(&existing, &candidate));
    }

    #[test]
    fn test_cosmetic_fields_ignored() {
        let compat = JsonSchemaCompat;
        let a = json!({"temp": {"type": "Quantity", "label": "Temperature"}});
        let b = json!({"temp": {"type": "Quantity", "label": "Air temperature"}});
        assert!(compat.structurally_equal(&a, &b));
        assert!(compat.structurally_compatible(&a, &b));
    }

    #[test]
    fn test_array_element_shape() {
        let compat = JsonSchemaCompat;
        let existing = json!({"coords": [{"axis": "x"}]});
        let compatible = json!({"coords": [{"axis": "x", "unit": "m"}]});
        let emptied = json!({"coords": []});
        assert!(compat.structurally_compatible(&existing, &compatible));
        assert!(!compat.structurally_compatible(&existing, &emptied));
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope Codec
//!
//! Messages travel as MessagePack encoded envelopes `{type, data}`. Decoding
//! happens in two steps: `decode` only checks the envelope structure, then
//! `convert_envelope_data` resolves `type` in a `TypeRegistry` and validates
//! `data` against the registered payload.

use crate::{
    errors::CodecError,
    events::{DependencyUpdate, Event, EventPayload, GithubPush, InstallationEvent, Strictness},
};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Content type set on published messages
pub const CONTENT_TYPE: &str = "application/msgpack";

/// The wire structure of every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    /// Typed payload, or a JSON document sent as a string
    #[serde(default = "nil")]
    pub data: Value,
}

fn nil() -> Value {
    Value::Nil
}

impl Envelope {
    /// Creates an envelope around already canonical `data`.
    pub fn new(kind: &str, data: Value) -> Self {
        Envelope {
            kind: kind.to_owned(),
            data,
        }
    }
}

/// Reduces a value to the plain structure that gets encoded. Implemented for
/// every `Serialize` type; structs become maps keyed by field name.
pub trait ToCanonicalForm {
    fn to_canonical_form(&self) -> Result<Value, CodecError>;
}

impl<T> ToCanonicalForm for T
where
    T: Serialize + ?Sized,
{
    fn to_canonical_form(&self) -> Result<Value, CodecError> {
        let bytes =
            rmp_serde::to_vec_named(self).map_err(|err| CodecError::EncodeError(err.to_string()))?;

        rmpv::decode::read_value(&mut bytes.as_slice())
            .map_err(|err| CodecError::EncodeError(err.to_string()))
    }
}

/// Encodes `value` as MessagePack after reducing it to its canonical form.
///
/// # Parameters
/// * `value` - Usually an `Event` or an `Envelope`, but any `Serialize` works
///
/// # Returns
/// The encoded bytes, or `CodecError::EncodeError` when `value` cannot be
/// serialized
pub fn encode<T>(value: &T) -> Result<Vec<u8>, CodecError>
where
    T: ToCanonicalForm + ?Sized,
{
    let canonical = value.to_canonical_form()?;

    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &canonical)
        .map_err(|err| CodecError::EncodeError(err.to_string()))?;

    Ok(bytes)
}

/// Reads an envelope without looking at its `type`.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|err| CodecError::DecodeError(err.to_string()))
}

/// Decodes `bytes` and converts the envelope data to its registered type.
pub fn decode_event(bytes: &[u8], registry: &TypeRegistry) -> Result<Event, CodecError> {
    let envelope = decode(bytes)?;
    convert_envelope_data(&envelope, registry)
}

/// Converts the `data` of an envelope to the payload registered for its
/// `type`.
///
/// String data is parsed as JSON first and missing data is treated as an
/// empty map. Strict types fail with `CodecError::ValidationError` listing
/// the unknown fields; lenient types drop them.
///
/// # Parameters
/// * `envelope` - A decoded envelope
/// * `registry` - The registered types
///
/// # Returns
/// The typed event, or `CodecError::TypeRequired` for an unregistered `type`
pub fn convert_envelope_data(
    envelope: &Envelope,
    registry: &TypeRegistry,
) -> Result<Event, CodecError> {
    let Some(registration) = registry.get(&envelope.kind) else {
        return Err(CodecError::TypeRequired(envelope.kind.clone()));
    };

    let data = match &envelope.data {
        Value::String(text) => {
            let text = text
                .as_str()
                .ok_or_else(|| CodecError::ParseDataError(format!("{text:?}")))?;

            serde_json::from_str::<serde_json::Value>(text)
                .map_err(|_| CodecError::ParseDataError(text.to_owned()))?
                .to_canonical_form()?
        }
        Value::Nil => Value::Map(vec![]),
        data => data.clone(),
    };

    (registration.decode)(data, registration.strictness)
}

type DecodeFn = fn(Value, Strictness) -> Result<Event, CodecError>;

/// How a registered `type` is decoded.
#[derive(Clone, Copy)]
pub struct Registration {
    pub strictness: Strictness,
    decode: DecodeFn,
}

/// Envelope `type` to payload lookup table.
#[derive(Clone)]
pub struct TypeRegistry {
    types: HashMap<&'static str, Registration>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::empty()
            .register::<GithubPush>()
            .register::<InstallationEvent>()
            .register::<DependencyUpdate>()
    }
}

impl TypeRegistry {
    /// A registry without any type. `TypeRegistry::default()` registers every
    /// event of this crate.
    pub fn empty() -> Self {
        TypeRegistry {
            types: HashMap::new(),
        }
    }

    /// Registers `T` under `T::TYPE` with its own strictness.
    pub fn register<T: EventPayload>(self) -> Self {
        self.register_with::<T>(T::STRICTNESS)
    }

    /// Registers `T` with a strictness other than its own.
    pub fn register_with<T: EventPayload>(mut self, strictness: Strictness) -> Self {
        self.types.insert(
            T::TYPE,
            Registration {
                strictness,
                decode: decode_payload::<T>,
            },
        );
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Registration> {
        self.types.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.types.contains_key(kind)
    }
}

fn decode_payload<T: EventPayload>(data: Value, strictness: Strictness) -> Result<Event, CodecError> {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &data)
        .map_err(|err| CodecError::DecodeError(err.to_string()))?;

    let typed: T = rmp_serde::from_slice(&bytes)
        .map_err(|err| CodecError::ValidationError(vec![err.to_string()]))?;

    let unknown = unknown_fields(&data, &typed)?;
    if !unknown.is_empty() {
        match strictness {
            Strictness::Strict => {
                return Err(CodecError::ValidationError(
                    unknown
                        .iter()
                        .map(|field| format!("unrecognized property: {field}"))
                        .collect(),
                ));
            }
            Strictness::Lenient => {
                warn!(kind = T::TYPE, fields = ?unknown, "ignoring unrecognized properties");
            }
        }
    }

    Ok(typed.into_event())
}

/// Top level keys of `data` that `typed` does not serialize.
fn unknown_fields<T: Serialize>(data: &Value, typed: &T) -> Result<Vec<String>, CodecError> {
    let Value::Map(entries) = data else {
        return Ok(vec![]);
    };

    let known = match serde_json::to_value(typed) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => return Ok(vec![]),
        Err(err) => return Err(CodecError::ValidationError(vec![err.to_string()])),
    };

    Ok(entries
        .iter()
        .map(|(key, _)| match key.as_str() {
            Some(name) => name.to_owned(),
            None => key.to_string(),
        })
        .filter(|name| !known.contains_key(name))
        .collect())
}

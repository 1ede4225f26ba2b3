//! Defines the request envelope and its JSON serialization.
//!
//! Includes the identifier generator and the tokenizer used to turn operator input into the
//! positional `params` and `param_types` sequences.
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::*;

/// Smallest identifier ever assigned (inclusive).
pub const ID_MIN: u64 = 1;
/// Upper bound for assigned identifiers (exclusive).
pub const ID_MAX: u64 = 10_000_000_000;

/// Draws a request identifier uniformly from `[ID_MIN, ID_MAX)`.
///
/// Identifiers are only used to correlate a request with its reply. There is no persisted sequence
/// and no collision detection, so uniqueness is best-effort within a process.
pub fn generate_id() -> u64 {
    rand::rng().random_range(ID_MIN..ID_MAX)
}

/// Splits operator input on single spaces, keeping every token.
///
/// Empty input yields a single empty token, and runs of spaces yield empty tokens between them.
pub fn tokenize(raw: &str) -> Vec<String> {
    raw.split(' ').map(String::from).collect()
}

/// A single RPC request: method name, positional parameters with their type tags, and an
/// identifier.
///
/// Envelopes are immutable once built. Fields serialize in the order `method`, `params`,
/// `param_types`, `id`.
#[derive(PartialEq, Eq, Clone, Debug, Serialize)]
pub struct Envelope {
    method: String,
    params: Vec<String>,
    param_types: Vec<String>,
    id: u64,
}

/// Wire form accepted when decoding. `params_types` is the spelling older clients used.
#[derive(Deserialize)]
struct WireEnvelope {
    method: String,
    params: Vec<String>,
    #[serde(alias = "params_types")]
    param_types: Vec<String>,
    id: u64,
}

impl Envelope {
    /// Builds an envelope from raw operator input. `raw_params` and `raw_param_types` are
    /// tokenized with [`tokenize`], and a fresh identifier is drawn.
    ///
    /// The method is not checked here; see [`crate::Client::call`] for the validating entry point.
    pub fn build(method: &str, raw_params: &str, raw_param_types: &str) -> Result<Self> {
        Self::new(method, tokenize(raw_params), tokenize(raw_param_types))
    }

    /// Creates an envelope from already tokenized parameters, drawing a fresh identifier.
    pub fn new(
        method: impl Into<String>,
        params: Vec<String>,
        param_types: Vec<String>,
    ) -> Result<Self> {
        Self::from_parts(method, params, param_types, generate_id())
    }

    /// Creates an envelope with an explicit identifier.
    ///
    /// Fails if `params` and `param_types` differ in length, or if `id` lies outside
    /// `[ID_MIN, ID_MAX)`.
    pub fn from_parts(
        method: impl Into<String>,
        params: Vec<String>,
        param_types: Vec<String>,
        id: u64,
    ) -> Result<Self> {
        if params.len() != param_types.len() {
            return Err(RpcError::Validation(format!(
                "{} params but {} param types",
                params.len(),
                param_types.len()
            )));
        }
        if !(ID_MIN..ID_MAX).contains(&id) {
            return Err(RpcError::Validation(format!("id {} out of range", id)));
        }
        Ok(Self {
            method: method.into(),
            params,
            param_types,
            id,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn param_types(&self) -> &[String] {
        &self.param_types
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Serializes the envelope to its JSON wire form.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parses an envelope from its JSON wire form, enforcing the same invariants as construction.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: WireEnvelope) -> Result<Self> {
        Self::from_parts(wire.method, wire.params, wire.param_types, wire.id)
    }

    /// Decodes every complete envelope at the front of `buf`.
    ///
    /// Returns the decoded envelopes and the number of bytes consumed. A trailing partial object is
    /// left unconsumed so the caller can retry once more bytes arrive.
    pub fn decode_stream(buf: &[u8]) -> Result<(Vec<Self>, usize)> {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<WireEnvelope>();
        let mut envelopes = Vec::new();
        let mut consumed = 0;
        loop {
            match stream.next() {
                Some(Ok(wire)) => {
                    envelopes.push(Self::from_wire(wire)?);
                    consumed = stream.byte_offset();
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    consumed = stream.byte_offset();
                    break;
                }
            }
        }
        Ok((envelopes, consumed))
    }
}

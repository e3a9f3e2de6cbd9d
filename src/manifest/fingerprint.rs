//! Deterministic module fingerprints.
//!
//! A fingerprint identifies a module's output function: binary bytes,
//! entrypoint, input wiring, store configuration, and the fingerprints of
//! every input module, transitively. Two modules with identical closures
//! hash identically across runs; any ancestry change changes the hash.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Binary, Input, ManifestError, Module, ModuleGraph, ModuleKind};

/// 32-byte content address, rendered as lowercase hex.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        parse_hex(&hex).ok_or_else(|| serde::de::Error::custom("malformed fingerprint hex"))
    }
}

fn parse_hex(hex: &str) -> Option<Fingerprint> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(Fingerprint(out))
}

/// Compute the fingerprint of every module in the graph.
///
/// Walks the dependency order once; each module's hash folds in the hashes
/// of its input modules, so the result is transitively closed.
pub fn fingerprint_modules(
    graph: &ModuleGraph,
    binaries: &[Binary],
) -> Result<BTreeMap<String, Fingerprint>, ManifestError> {
    let mut done: BTreeMap<String, Fingerprint> = BTreeMap::new();
    for module in graph.modules() {
        let binary =
            binaries
                .get(module.binary_index)
                .ok_or(ManifestError::BinaryIndexOutOfRange {
                    module: module.name.clone(),
                    index: module.binary_index,
                })?;
        let fp = fingerprint_one(module, binary, &done);
        done.insert(module.name.clone(), fp);
    }
    Ok(done)
}

fn fingerprint_one(
    module: &Module,
    binary: &Binary,
    ancestors: &BTreeMap<String, Fingerprint>,
) -> Fingerprint {
    let mut hasher = Sha256::new();

    // Length-prefixed fields keep the encoding unambiguous.
    feed(&mut hasher, b"binary", &binary.content);
    feed(&mut hasher, b"entrypoint", module.entrypoint.as_bytes());

    for input in &module.inputs {
        match input {
            Input::Source { source_type } => {
                feed(&mut hasher, b"input:source", source_type.as_bytes());
            }
            Input::Map { module: dep } => {
                feed(&mut hasher, b"input:map", dep.as_bytes());
                feed(&mut hasher, b"dep", ancestors[dep].as_bytes());
            }
            Input::Store { module: dep, mode } => {
                feed(&mut hasher, b"input:store", dep.as_bytes());
                feed(&mut hasher, b"mode", format!("{mode:?}").as_bytes());
                feed(&mut hasher, b"dep", ancestors[dep].as_bytes());
            }
        }
    }

    if let ModuleKind::Store {
        update_policy,
        value_type,
    } = &module.kind
    {
        feed(&mut hasher, b"update_policy", update_policy.as_str().as_bytes());
        feed(&mut hasher, b"value_type", value_type.as_str().as_bytes());
    }

    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Fingerprint(out)
}

fn feed(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hasher.update((tag.len() as u64).to_le_bytes());
    hasher.update(tag);
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}

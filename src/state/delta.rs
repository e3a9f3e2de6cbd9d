//! Store deltas: the ordered mutations a store module produced during one
//! block, and their durable byte encoding (used by the output cache).

use bytes::Bytes;

use super::codec::{
    open_frame, read_slice, read_u8, seal_frame, write_slice, write_u8, FrameError,
};

const DELTA_MAGIC: u32 = 0x4246_444C; // "BFDL"
const DELTA_VERSION: u16 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeltaKind {
    /// The key did not exist before this mutation.
    Create,
    /// The key existed; `old_value` holds the replaced value.
    Update,
}

/// One mutation, in module emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub kind: DeltaKind,
    pub key: String,
    pub old_value: Option<Bytes>,
    pub new_value: Bytes,
}

pub fn encode_deltas(deltas: &[Delta]) -> Bytes {
    let mut body = Vec::new();
    super::codec::write_u32(&mut body, deltas.len() as u32);
    for delta in deltas {
        let kind = match delta.kind {
            DeltaKind::Create => 0u8,
            DeltaKind::Update => 1u8,
        };
        write_u8(&mut body, kind);
        write_slice(&mut body, delta.key.as_bytes());
        match &delta.old_value {
            Some(old) => {
                write_u8(&mut body, 1);
                write_slice(&mut body, old);
            }
            None => write_u8(&mut body, 0),
        }
        write_slice(&mut body, &delta.new_value);
    }
    seal_frame(DELTA_MAGIC, DELTA_VERSION, &body)
}

pub(crate) fn decode_deltas(blob: &[u8]) -> Result<Vec<Delta>, FrameError> {
    let body = open_frame(DELTA_MAGIC, DELTA_VERSION, blob)?;
    let mut offset = 0usize;
    let count = super::codec::read_u32(body, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = match read_u8(body, &mut offset)? {
            0 => DeltaKind::Create,
            1 => DeltaKind::Update,
            other => {
                return Err(FrameError::BodyInvalid {
                    reason: format!("unknown delta kind {other}"),
                })
            }
        };
        let key = std::str::from_utf8(read_slice(body, &mut offset)?)
            .map_err(|_| FrameError::BodyInvalid {
                reason: "delta key is not utf-8".to_string(),
            })?
            .to_string();
        let old_value = match read_u8(body, &mut offset)? {
            0 => None,
            _ => Some(Bytes::copy_from_slice(read_slice(body, &mut offset)?)),
        };
        let new_value = Bytes::copy_from_slice(read_slice(body, &mut offset)?);
        out.push(Delta {
            kind,
            key,
            old_value,
            new_value,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_round_trip_in_order() {
        let deltas = vec![
            Delta {
                kind: DeltaKind::Create,
                key: "alice".to_string(),
                old_value: None,
                new_value: Bytes::from_static(b"1"),
            },
            Delta {
                kind: DeltaKind::Update,
                key: "alice".to_string(),
                old_value: Some(Bytes::from_static(b"1")),
                new_value: Bytes::from_static(b"2"),
            },
        ];
        let blob = encode_deltas(&deltas);
        assert_eq!(decode_deltas(&blob).unwrap(), deltas);
    }

    #[test]
    fn empty_delta_list_round_trips() {
        let blob = encode_deltas(&[]);
        assert!(decode_deltas(&blob).unwrap().is_empty());
    }
}

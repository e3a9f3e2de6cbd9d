//! Output-cache segment blob: `block → output bytes` for one interval.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::state::codec::{
    open_frame, read_slice, read_u64, seal_frame, write_slice, write_u64, FrameError,
};

const SEGMENT_MAGIC: u32 = 0x4246_4F43; // "BFOC"
const SEGMENT_VERSION: u16 = 1;

pub(crate) fn encode_segment(outputs: &BTreeMap<u64, Bytes>) -> Bytes {
    let mut body = Vec::new();
    write_u64(&mut body, outputs.len() as u64);
    for (block, output) in outputs {
        write_u64(&mut body, *block);
        write_slice(&mut body, output);
    }
    seal_frame(SEGMENT_MAGIC, SEGMENT_VERSION, &body)
}

pub(crate) fn decode_segment(blob: &[u8]) -> Result<BTreeMap<u64, Bytes>, FrameError> {
    let body = open_frame(SEGMENT_MAGIC, SEGMENT_VERSION, blob)?;
    let mut offset = 0usize;
    let count = read_u64(body, &mut offset)?;
    let mut out = BTreeMap::new();
    for _ in 0..count {
        let block = read_u64(body, &mut offset)?;
        let output = Bytes::copy_from_slice(read_slice(body, &mut offset)?);
        out.insert(block, output);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_round_trips() {
        let mut outputs = BTreeMap::new();
        outputs.insert(100, Bytes::from_static(b"a"));
        outputs.insert(105, Bytes::from_static(b""));
        assert_eq!(decode_segment(&encode_segment(&outputs)).unwrap(), outputs);
    }
}

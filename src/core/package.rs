use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"TPK\0";
pub const FORMAT_VERSION: u32 = 6;

/// Number of element streams in a v6 package.
pub const STREAM_COUNT: usize = 17;

/// Stream ordinals. The wire order is fixed; the decoder indexes blobs by
/// these constants and never by name.
pub mod stream {
    pub const POSITIONS: usize = 0;
    pub const NORMALS: usize = 1;
    pub const INDICES: usize = 2;
    pub const EDGE_INDICES: usize = 3;
    pub const MATRICES: usize = 4;
    pub const INSTANCED_PRIMITIVES_DECODE_MATRIX: usize = 5;
    pub const EACH_PRIMITIVE_POSITIONS_AND_NORMALS_PORTION: usize = 6;
    pub const EACH_PRIMITIVE_INDICES_PORTION: usize = 7;
    pub const EACH_PRIMITIVE_EDGE_INDICES_PORTION: usize = 8;
    pub const EACH_PRIMITIVE_COLOR_AND_OPACITY: usize = 9;
    pub const PRIMITIVE_INSTANCES: usize = 10;
    pub const EACH_ENTITY_ID: usize = 11;
    pub const EACH_ENTITY_PRIMITIVE_INSTANCES_PORTION: usize = 12;
    pub const EACH_ENTITY_MATRICES_PORTION: usize = 13;
    pub const EACH_TILE_AABB: usize = 14;
    pub const EACH_TILE_DECODE_MATRIX: usize = 15;
    pub const EACH_TILE_ENTITIES_PORTION: usize = 16;
}

pub(crate) const STREAM_NAMES: [&str; STREAM_COUNT] = [
    "positions",
    "normals",
    "indices",
    "edge_indices",
    "matrices",
    "instanced_primitives_decode_matrix",
    "each_primitive_positions_and_normals_portion",
    "each_primitive_indices_portion",
    "each_primitive_edge_indices_portion",
    "each_primitive_color_and_opacity",
    "primitive_instances",
    "each_entity_id",
    "each_entity_primitive_instances_portion",
    "each_entity_matrices_portion",
    "each_tile_aabb",
    "each_tile_decode_matrix",
    "each_tile_entities_portion",
];

#[remain::sorted]
#[derive(Error, Debug)]
pub enum Err {
    #[error("malformed package envelope: {0}")]
    CodecError(String),
    #[error("package format version {found} is not supported (expected {FORMAT_VERSION})")]
    FormatVersionMismatch { found: u32 },
}

/// An encoded package: the format version and the ordered list of
/// independently deflate-compressed element streams.
///
/// File layout (little-endian):
/// ```text
///   00  : [u8; 4]  magic = b"TPK\0"
///   04  : u32      version
///   08  : u32      stream count
///   0C  : u32[n]   compressed byte length per stream
///   ..  : the compressed streams, back to back
/// ```
#[derive(Debug, Clone)]
pub struct Package {
    version: u32,
    streams: Vec<Vec<u8>>,
}

impl Package {
    pub(crate) fn new(streams: Vec<Vec<u8>>) -> Self {
        debug_assert_eq!(streams.len(), STREAM_COUNT);
        Self {
            version: FORMAT_VERSION,
            streams,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The compressed blobs in wire order (see [`stream`]).
    pub fn streams(&self) -> &[Vec<u8>] {
        &self.streams
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let payload: usize = self.streams.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(12 + self.streams.len() * 4 + payload);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.streams.len() as u32).to_le_bytes());
        for blob in &self.streams {
            out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        }
        for blob in &self.streams {
            out.extend_from_slice(blob);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Err> {
        let mut buf = bytes;
        let magic = take(&mut buf, 4)?;
        if magic != MAGIC {
            return Err(Err::CodecError(format!("bad magic {:02x?}", magic)));
        }
        let version = le_u32(&mut buf)?;
        let stream_count = le_u32(&mut buf)? as usize;
        if stream_count != STREAM_COUNT {
            return Err(Err::CodecError(format!(
                "expected {} streams, envelope declares {}",
                STREAM_COUNT, stream_count
            )));
        }
        let mut lengths = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            lengths.push(le_u32(&mut buf)? as usize);
        }
        let mut streams = Vec::with_capacity(stream_count);
        for len in lengths {
            streams.push(take(&mut buf, len)?.to_vec());
        }
        Ok(Self { version, streams })
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], Err> {
    if buf.len() < n {
        return Err(Err::CodecError(format!(
            "truncated envelope: wanted {} bytes, {} remain",
            n,
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn le_u32(buf: &mut &[u8]) -> Result<u32, Err> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy() -> Package {
        Package::new((0..STREAM_COUNT).map(|i| vec![i as u8; i]).collect())
    }

    #[test]
    fn envelope_round_trip() {
        let package = dummy();
        let parsed = Package::from_bytes(&package.to_bytes()).unwrap();
        assert_eq!(parsed.version(), FORMAT_VERSION);
        assert_eq!(parsed.streams(), package.streams());
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let bytes = dummy().to_bytes();
        let err = Package::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Err::CodecError(_)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = dummy().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            Package::from_bytes(&bytes),
            Result::Err(Err::CodecError(_))
        ));
    }
}

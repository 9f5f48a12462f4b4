use crate::core::Result;
use serde::{Deserialize, Serialize};

/// Blob codec choice (§4.2). `Cab` stands in for the cabinet
/// compressor/decompressor, which §1 names as an out-of-scope external
/// collaborator; the trait boundary here is where a real cabinet
/// implementation would plug in. Until then `Cab` behaves as a
/// pass-through that still round-trips correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    None = 0,
    Cab = 1,
}

pub trait BlobCodec {
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>>;
}

struct NoneCodec;

impl BlobCodec for NoneCodec {
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        Ok(stored.to_vec())
    }
}

struct CabCodec;

impl BlobCodec for CabCodec {
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        tracing::debug!(
            bytes = raw.len(),
            "cabinet codec not implemented in this port; storing verbatim"
        );
        Ok(raw.to_vec())
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        Ok(stored.to_vec())
    }
}

pub fn codec_for(c: Codec) -> Box<dyn BlobCodec + Send + Sync> {
    match c {
        Codec::None => Box::new(NoneCodec),
        Codec::Cab => Box::new(CabCodec),
    }
}

/// Simple size heuristic (§4.2): payloads at or above the threshold get
/// the `Cab` codec, smaller ones are stored verbatim. The threshold is
/// configurable (`SettingsEngineConfig::codec_threshold_bytes`).
pub fn choose_codec(raw_size: usize, threshold: usize) -> Codec {
    if raw_size >= threshold {
        Codec::Cab
    } else {
        Codec::None
    }
}

use crate::error::Result;

/// Record packing seam. The engine never interprets record bytes; keys and
/// values cross this boundary as opaque byte strings together with the
/// format string stored in tree configuration. The outer database supplies
/// the real codec.
pub trait RecordCodec: Send + Sync {
    /// Pack typed column values into record bytes for the given format.
    fn pack(&self, format: &str, values: &[Vec<u8>]) -> Result<Vec<u8>>;

    /// Unpack record bytes into column values for the given format.
    fn unpack(&self, format: &str, bytes: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// Pass-through codec for raw byte keys and values (format "u").
#[derive(Default)]
pub struct RawCodec {}

impl RecordCodec for RawCodec {
    fn pack(&self, _format: &str, values: &[Vec<u8>]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for v in values {
            out.extend_from_slice(v);
        }
        Ok(out)
    }

    fn unpack(&self, _format: &str, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![bytes.to_vec()])
    }
}

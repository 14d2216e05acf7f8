//! Transform pipeline for chunk streams.
//!
//! Each transform is a `bytes -> bytes` pass plus an optional `finalize`
//! invoked exactly once after the source is exhausted. Compression ships as a
//! concrete transform; encryption plugs into the same seam.

use bytes::Bytes;

use super::error::{Result, StreamingError};

pub trait StreamTransform: Send {
    fn name(&self) -> &str;

    /// Transform one chunk's payload.
    fn apply(&mut self, data: Bytes) -> Result<Bytes>;

    /// Called exactly once after the source is exhausted; a non-nil result is
    /// appended to the outgoing stream.
    fn finalize(&mut self) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

/// LZ4 block compression, size-prepended so each chunk round-trips on its own.
pub struct Lz4Compress;

impl StreamTransform for Lz4Compress {
    fn name(&self) -> &str {
        "lz4-compress"
    }

    fn apply(&mut self, data: Bytes) -> Result<Bytes> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(&data)))
    }
}

pub struct Lz4Decompress;

impl StreamTransform for Lz4Decompress {
    fn name(&self) -> &str {
        "lz4-decompress"
    }

    fn apply(&mut self, data: Bytes) -> Result<Bytes> {
        lz4_flex::decompress_size_prepended(&data)
            .map(Bytes::from)
            .map_err(|e| StreamingError::TransformFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Run `data` through every transform in order.
pub(crate) fn apply_all(
    transforms: &mut [Box<dyn StreamTransform>],
    data: Bytes,
) -> Result<Bytes> {
    let mut out = data;
    for transform in transforms.iter_mut() {
        out = transform.apply(out)?;
    }
    Ok(out)
}

/// Drain every transform's `finalize` in order, keeping non-empty outputs.
pub(crate) fn finalize_all(transforms: &mut [Box<dyn StreamTransform>]) -> Result<Vec<Bytes>> {
    let mut tails = Vec::new();
    for transform in transforms.iter_mut() {
        if let Some(tail) = transform.finalize()? {
            if !tail.is_empty() {
                tails.push(tail);
            }
        }
    }
    Ok(tails)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingTransform {
        applied: usize,
        finalized: usize,
    }

    impl StreamTransform for CountingTransform {
        fn name(&self) -> &str {
            "counting"
        }

        fn apply(&mut self, data: Bytes) -> Result<Bytes> {
            self.applied += 1;
            Ok(data)
        }

        fn finalize(&mut self) -> Result<Option<Bytes>> {
            self.finalized += 1;
            Ok(Some(Bytes::from_static(b"tail")))
        }
    }

    #[test]
    fn test_lz4_round_trip() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let original = Bytes::from(data);

        let compressed = Lz4Compress.apply(original.clone()).unwrap();
        let restored = Lz4Decompress.apply(compressed).unwrap();

        assert_eq!(restored, original);
    }

    #[test]
    fn test_lz4_decompress_rejects_garbage() {
        let result = Lz4Decompress.apply(Bytes::from_static(b"\xff\xff\xff"));
        assert!(matches!(
            result,
            Err(StreamingError::TransformFailed { .. })
        ));
    }

    #[test]
    fn test_apply_all_runs_in_order() {
        let mut transforms: Vec<Box<dyn StreamTransform>> =
            vec![Box::new(Lz4Compress), Box::new(Lz4Decompress)];

        let data = Bytes::from_static(b"ordered pipeline");
        let out = apply_all(&mut transforms, data.clone()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_finalize_runs_once_per_transform() {
        let mut transforms: Vec<Box<dyn StreamTransform>> = vec![Box::new(CountingTransform {
            applied: 0,
            finalized: 0,
        })];

        apply_all(&mut transforms, Bytes::from_static(b"x")).unwrap();
        let tails = finalize_all(&mut transforms).unwrap();

        assert_eq!(tails.len(), 1);
        assert_eq!(&tails[0][..], b"tail");
    }
}

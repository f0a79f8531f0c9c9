// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Persistence of decoder caches.
//!
//! Two on-disk encodings are supported:
//!
//! - **Raw** (preferred): the byte-for-byte image of the cache array,
//!   followed by a handler-rebinding table of
//!   `{u32 handler_idx, u32 representative_encoding}` entries.
//! - **Portable**: the cache image alone; handler indices are re-derived
//!   on load by decoding each slot's own raw encoding.
//!
//! Both loaders parse into owned structures; guest-supplied bytes are
//! never reinterpreted as live objects.

use std::io::Write;
use std::path::Path;

use bincode::DefaultOptions;
use bincode::Options;
use serde::Deserialize;
use serde::Serialize;

use crate::machine_state::decoder_cache::DecoderCache;
use crate::machine_state::decoder_cache::DecoderEntry;
use crate::machine_state::decoder_cache::INSTR_HANDLERS;
use crate::machine_state::decoder_cache::SIZE;
use crate::parser;

/// Constructs the default options for bincode serialisation and
/// deserialisation: fixed-width integers, little-endian, no length limit.
#[inline(always)]
pub(crate) fn bincode_default() -> impl Options {
    DefaultOptions::new()
        .with_no_limit()
        .with_little_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Serialize `T` into a vector of bytes.
pub fn serialise<T: Serialize>(value: &T) -> bincode::Result<Vec<u8>> {
    bincode_default().serialize(value)
}

/// Deserialise a slice of bytes into a value of type `T`.
pub fn deserialise<'de, T: Deserialize<'de>>(data: &'de [u8]) -> bincode::Result<T> {
    bincode_default().deserialize(data)
}

/// Serialize `T` into a sink.
pub(crate) fn serialise_into<T: Serialize, W: Write>(value: &T, sink: W) -> bincode::Result<()> {
    bincode_default().serialize_into(sink, value)
}

/// Errors when loading a serialized decoder cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input does not have the length the encoding mandates.
    #[error("Invalid input size (expected {expected}, got {got})")]
    InvalidLength { expected: usize, got: usize },

    /// A handler binding names an index outside the handler table.
    #[error("Handler index {0} is out of range")]
    InvalidHandlerIndex(u32),

    /// The binding table could not be decoded.
    #[error("Malformed handler binding table: {0}")]
    Codec(#[from] bincode::Error),

    /// Reading or writing the cache file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One slot of the portable form. Identical in layout to the raw
/// descriptor image.
#[derive(Serialize, Deserialize)]
struct PortableEntry {
    bytecode: u8,
    handler: u8,
    idxend: u8,
    icount: u8,
    instr: u32,
}

/// Serialize decoder caches in the raw form: the descriptor image,
/// followed by one byte holding the number of handler bindings and the
/// binding entries themselves.
pub fn serialize_decoder_caches(caches: &[Box<DecoderCache>]) -> Vec<u8> {
    let bindings = INSTR_HANDLERS.bindings();
    let mut out = Vec::with_capacity(caches.len() * SIZE * 8 + 1 + bindings.len() * 8);

    for cache in caches {
        for entry in cache.entries() {
            out.extend_from_slice(&entry.to_bytes());
        }
    }

    out.push(bindings.len() as u8);
    for (idx, encoding) in bindings {
        serialise_into(&(idx as u32, encoding), &mut out)
            .expect("writing to a vector cannot fail");
    }

    out
}

/// Load decoder caches from the raw form, installing every handler
/// binding in the process-wide table.
pub fn deserialize_decoder_caches(
    bytes: &[u8],
    n: usize,
) -> Result<Vec<Box<DecoderCache>>, Error> {
    let image_size = n * SIZE * 8;
    if bytes.len() < image_size + 1 {
        return Err(Error::InvalidLength {
            expected: image_size + 1,
            got: bytes.len(),
        });
    }

    let binding_count = bytes[image_size] as usize;
    let expected = image_size + 1 + binding_count * 8;
    if bytes.len() != expected {
        return Err(Error::InvalidLength {
            expected,
            got: bytes.len(),
        });
    }

    // Re-bind handler indices before touching the descriptors, so freshly
    // parsed entries already resolve.
    for binding in 0..binding_count {
        let offset = image_size + 1 + binding * 8;
        let (idx, encoding): (u32, u32) = deserialise(&bytes[offset..offset + 8])?;
        if idx > u8::MAX as u32 {
            return Err(Error::InvalidHandlerIndex(idx));
        }
        let insn = parser::decode(encoding);
        INSTR_HANDLERS.bind(idx as u8, insn.handler, encoding);
    }

    Ok(parse_cache_image(&bytes[..image_size], n))
}

/// Serialize decoder caches in the portable form: the descriptor image
/// alone.
pub fn serialize_decoder_caches_portable(caches: &[Box<DecoderCache>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(caches.len() * SIZE * 8);
    for cache in caches {
        for entry in cache.entries() {
            let bytes = entry.to_bytes();
            let portable = PortableEntry {
                bytecode: bytes[0],
                handler: bytes[1],
                idxend: bytes[2],
                icount: bytes[3],
                instr: entry.instr(),
            };
            serialise_into(&portable, &mut out).expect("writing to a vector cannot fail");
        }
    }
    out
}

/// Load decoder caches from the portable form. Every slot with a non-zero
/// handler index is re-bound by decoding its own raw encoding against the
/// live handler table; stored indices are not trusted.
pub fn deserialize_decoder_caches_portable(
    bytes: &[u8],
    n: usize,
) -> Result<Vec<Box<DecoderCache>>, Error> {
    let image_size = n * SIZE * 8;
    if bytes.len() != image_size {
        return Err(Error::InvalidLength {
            expected: image_size,
            got: bytes.len(),
        });
    }

    let mut caches = parse_cache_image(bytes, n);
    for cache in &mut caches {
        for idx in 0..SIZE {
            let entry = cache.get_mut(idx);
            if !entry.is_invalid_handler() {
                entry.set_handler(parser::decode(entry.instr()));
            }
        }
    }
    Ok(caches)
}

/// Copy a descriptor image slot by slot into newly allocated caches.
fn parse_cache_image(image: &[u8], n: usize) -> Vec<Box<DecoderCache>> {
    let mut caches = Vec::with_capacity(n);
    for page in 0..n {
        let mut cache = DecoderCache::new();
        for idx in 0..SIZE {
            let offset = (page * SIZE + idx) * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&image[offset..offset + 8]);
            *cache.get_mut(idx) = DecoderEntry::from_bytes(bytes);
        }
        caches.push(cache);
    }
    caches
}

/// Write the raw form of the given caches to a file.
pub fn save_to_file(path: impl AsRef<Path>, caches: &[Box<DecoderCache>]) -> Result<(), Error> {
    let data = serialize_decoder_caches(caches);
    std::fs::write(path, data)?;
    Ok(())
}

/// Load caches for `n` pages from a file in the raw form.
pub fn load_from_file(
    path: impl AsRef<Path>,
    n: usize,
) -> Result<Vec<Box<DecoderCache>>, Error> {
    let data = std::fs::read(path)?;
    deserialize_decoder_caches(&data, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::memory::page::PAGE_SIZE_USIZE;

    fn sample_page() -> [u8; PAGE_SIZE_USIZE] {
        let mut page = [0u8; PAGE_SIZE_USIZE];
        let words = [
            0x0015_0513u32, // addi a0, a0, 1
            0x1234_5537,    // lui a0, 0x12345
            0x0000_0073,    // ecall
            0x0000_006f,    // jal x0, 0
        ];
        for (i, word) in words.iter().cycle().take(PAGE_SIZE_USIZE / 4).enumerate() {
            page[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        page
    }

    #[test]
    fn test_raw_roundtrip_is_byte_exact() {
        let caches = vec![DecoderCache::generate(&sample_page())];
        let data = serialize_decoder_caches(&caches);
        let restored = deserialize_decoder_caches(&data, 1).unwrap();

        assert_eq!(restored.len(), 1);
        for idx in 0..SIZE {
            assert_eq!(
                restored[0].get(idx).to_bytes(),
                caches[0].get(idx).to_bytes()
            );
        }
    }

    #[test]
    fn test_raw_rejects_bad_lengths() {
        let caches = vec![DecoderCache::generate(&sample_page())];
        let mut data = serialize_decoder_caches(&caches);

        assert!(matches!(
            deserialize_decoder_caches(&data[..SIZE], 1),
            Err(Error::InvalidLength { .. })
        ));

        data.push(0);
        assert!(matches!(
            deserialize_decoder_caches(&data, 1),
            Err(Error::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_raw_rebinds_handlers() {
        let caches = vec![DecoderCache::generate(&sample_page())];
        let data = serialize_decoder_caches(&caches);
        let restored = deserialize_decoder_caches(&data, 1).unwrap();

        for idx in 0..SIZE {
            let original = caches[0].get(idx);
            let loaded = restored[0].get(idx);
            assert_eq!(
                original.get_handler() as usize,
                loaded.get_handler() as usize,
                "slot {idx} resolves to a different host function"
            );
        }
    }

    #[test]
    fn test_portable_roundtrip_resolves_same_handlers() {
        let caches = vec![DecoderCache::generate(&sample_page())];
        let data = serialize_decoder_caches_portable(&caches);
        assert_eq!(data.len(), SIZE * 8);

        let restored = deserialize_decoder_caches_portable(&data, 1).unwrap();
        for idx in 0..SIZE {
            let original = caches[0].get(idx);
            let loaded = restored[0].get(idx);
            assert_eq!(original.instr(), loaded.instr());
            assert_eq!(
                original.get_handler() as usize,
                loaded.get_handler() as usize
            );
        }
    }

    #[test]
    fn test_portable_rejects_bad_length() {
        assert!(matches!(
            deserialize_decoder_caches_portable(&[0u8; 16], 1),
            Err(Error::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decoder.cache");

        let caches = vec![
            DecoderCache::generate(&sample_page()),
            DecoderCache::generate(&[0u8; PAGE_SIZE_USIZE]),
        ];
        save_to_file(&path, &caches).unwrap();
        let restored = load_from_file(&path, 2).unwrap();

        assert_eq!(restored.len(), 2);
        for (cache, loaded) in caches.iter().zip(&restored) {
            assert_eq!(cache.as_ref(), loaded.as_ref());
        }
    }
}

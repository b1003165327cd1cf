//! Image snapshots
//!
//! Serializes enough runtime state to boot an equivalent instance:
//! a magic number and version, the interned user symbols (id, name),
//! the constant-heap contents, and the global-environment slot
//! words. Saving first lifts every global binding into the constant
//! heap so the slot words are region-independent; booting restores
//! the constant heap, re-interns the symbols at their original ids,
//! and repopulates the slots.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sprig_core::{CoreError, Raw, Word};

use crate::config::Config;
use crate::env::GLOBAL_ENV_ROOTS;
use crate::runtime::Runtime;

pub const IMAGE_MAGIC: u32 = 0x5350_5247; // "SPRG"
pub const IMAGE_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not a sprig image (bad magic)")]
    BadMagic,
    #[error("unsupported image version {0}")]
    BadVersion(u16),
    #[error("image word width {image} does not match runtime width {runtime}")]
    WordWidth { image: u16, runtime: u16 },
    #[error("image has {0} global slots, expected {GLOBAL_ENV_ROOTS}")]
    BadSlotCount(usize),
    #[error("symbol table conflict while booting")]
    SymbolConflict,
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("image encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("runtime init failed: {0}")]
    Init(String),
}

#[derive(Serialize, Deserialize)]
struct Image {
    magic: u32,
    version: u16,
    word_bits: u16,
    symbols: Vec<(Raw, String)>,
    consts: Vec<Raw>,
    globals: Vec<Raw>,
}

/// Snapshot a runtime. Global bindings are lifted into the constant
/// heap in place, so the running instance keeps working afterwards.
pub fn save(rt: &mut Runtime) -> Result<Vec<u8>, ImageError> {
    let mut globals = Vec::with_capacity(GLOBAL_ENV_ROOTS);
    for i in 0..GLOBAL_ENV_ROOTS {
        let slot = rt.globals.slots()[i];
        let lifted = rt.store.lift(slot)?;
        rt.globals.slots_mut()[i] = lifted;
        globals.push(lifted.raw());
    }
    let image = Image {
        magic: IMAGE_MAGIC,
        version: IMAGE_VERSION,
        word_bits: Raw::BITS as u16,
        symbols: rt
            .symbols
            .user_symbols()
            .into_iter()
            .map(|(id, name)| (id, name.to_string()))
            .collect(),
        consts: rt.store.const_heap().written().to_vec(),
        globals,
    };
    Ok(bincode::serialize(&image)?)
}

/// Boot a fresh runtime from a snapshot.
pub fn boot(config: Config, bytes: &[u8]) -> Result<Runtime, ImageError> {
    let image: Image = bincode::deserialize(bytes)?;
    if image.magic != IMAGE_MAGIC {
        return Err(ImageError::BadMagic);
    }
    if image.version != IMAGE_VERSION {
        return Err(ImageError::BadVersion(image.version));
    }
    if image.word_bits != Raw::BITS as u16 {
        return Err(ImageError::WordWidth {
            image: image.word_bits,
            runtime: Raw::BITS as u16,
        });
    }
    if image.globals.len() != GLOBAL_ENV_ROOTS {
        return Err(ImageError::BadSlotCount(image.globals.len()));
    }

    let mut rt = Runtime::new(config).map_err(|e| ImageError::Init(e.to_string()))?;
    rt.store.const_heap_mut().restore(&image.consts)?;
    for (id, name) in &image.symbols {
        rt.symbols
            .restore_user(*id, name)
            .map_err(|_| ImageError::SymbolConflict)?;
    }
    for (slot, &raw) in rt.globals.slots_mut().iter_mut().zip(&image.globals) {
        *slot = Word::from_raw(raw);
    }
    Ok(rt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config {
            heap_cells: 512,
            ..Config::default()
        }
    }

    #[test]
    fn test_save_boot_roundtrip() {
        let mut rt = Runtime::new(small_config()).unwrap();
        rt.load_str("(define greeting \"hello\") (define answer 42)")
            .unwrap();
        rt.run_until_idle(100);

        let bytes = save(&mut rt).unwrap();
        let mut booted = boot(small_config(), &bytes).unwrap();

        assert_eq!(booted.inspect("answer").as_deref(), Some("42"));
        assert_eq!(booted.inspect("greeting").as_deref(), Some("\"hello\""));
        // The restored bindings survive evaluation and collection.
        booted.load_str("(+ answer 1)").unwrap();
        booted.run_until_idle(100);
        let done = booted.take_done_events();
        assert_eq!(done.last().unwrap().printed, "43");
    }

    #[test]
    fn test_boot_reinterns_same_ids() {
        let mut rt = Runtime::new(small_config()).unwrap();
        rt.load_str("(define first 1) (define second 2)").unwrap();
        rt.run_until_idle(100);
        let first_id = rt.symbols.lookup("first").unwrap();

        let bytes = save(&mut rt).unwrap();
        let mut booted = boot(small_config(), &bytes).unwrap();
        assert_eq!(booted.symbols.intern("first"), first_id);
    }

    #[test]
    fn test_redefine_after_boot_shadows_constant() {
        let mut rt = Runtime::new(small_config()).unwrap();
        rt.load_str("(define x 1)").unwrap();
        rt.run_until_idle(100);
        let bytes = save(&mut rt).unwrap();

        let mut booted = boot(small_config(), &bytes).unwrap();
        booted.load_str("(define x 99) x").unwrap();
        booted.run_until_idle(100);
        let done = booted.take_done_events();
        assert_eq!(done.last().unwrap().printed, "99");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut rt = Runtime::new(small_config()).unwrap();
        let mut bytes = save(&mut rt).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            boot(small_config(), &bytes),
            Err(ImageError::BadMagic) | Err(ImageError::Encode(_))
        ));
    }

    #[test]
    fn test_image_file_roundtrip() {
        let mut rt = Runtime::new(small_config()).unwrap();
        rt.load_str("(define saved 7)").unwrap();
        rt.run_until_idle(100);
        let bytes = save(&mut rt).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.img");
        std::fs::write(&path, &bytes).unwrap();
        let loaded = std::fs::read(&path).unwrap();

        let mut booted = boot(small_config(), &loaded).unwrap();
        assert_eq!(booted.inspect("saved").as_deref(), Some("7"));
    }
}

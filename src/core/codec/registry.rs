//! Algorithm provider registry
//!
//! Containers record their compressor and cipher by name; sessions resolve
//! those names here. The built-in `lz4`, `zstd` and `aes-256-gcm` providers
//! are always present. Registering a provider under an existing name
//! replaces it for sessions opened afterwards.

use super::compression::{Lz4Compressor, ZstdCompressor};
use super::encryption::Aes256GcmCipher;
use super::{Cipher, Compressor};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use tracing::debug;

struct ProviderRegistry {
    compressors: AHashMap<String, Arc<dyn Compressor>>,
    ciphers: AHashMap<String, Arc<dyn Cipher>>,
}

impl ProviderRegistry {
    fn with_builtins() -> Self {
        let mut registry = ProviderRegistry {
            compressors: AHashMap::new(),
            ciphers: AHashMap::new(),
        };

        let builtins: [Arc<dyn Compressor>; 2] =
            [Arc::new(Lz4Compressor), Arc::new(ZstdCompressor::default())];
        for provider in builtins {
            registry
                .compressors
                .insert(provider.name().to_string(), provider);
        }

        let aes: Arc<dyn Cipher> = Arc::new(Aes256GcmCipher);
        registry.ciphers.insert(aes.name().to_string(), aes);

        registry
    }
}

fn registry() -> &'static RwLock<ProviderRegistry> {
    static REGISTRY: OnceLock<RwLock<ProviderRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(ProviderRegistry::with_builtins()))
}

pub fn register_compressor(provider: Arc<dyn Compressor>) {
    let name = provider.name().to_string();
    debug!("Registering compressor '{}'", name);
    registry().write().compressors.insert(name, provider);
}

pub fn register_cipher(provider: Arc<dyn Cipher>) {
    let name = provider.name().to_string();
    debug!("Registering cipher '{}'", name);
    registry().write().ciphers.insert(name, provider);
}

pub fn compressor(name: &str) -> Option<Arc<dyn Compressor>> {
    registry().read().compressors.get(name).cloned()
}

pub fn cipher(name: &str) -> Option<Arc<dyn Cipher>> {
    registry().read().ciphers.get(name).cloned()
}

/// Registered compressor names, sorted
pub fn registered_compressors() -> Vec<String> {
    let mut names: Vec<String> = registry().read().compressors.keys().cloned().collect();
    names.sort();
    names
}

/// Registered cipher names, sorted
pub fn registered_ciphers() -> Vec<String> {
    let mut names: Vec<String> = registry().read().ciphers.keys().cloned().collect();
    names.sort();
    names
}

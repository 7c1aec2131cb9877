//! Outbound request metadata, rotated independently of identities

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::config::{SignatureConfig, MIN_SIGNATURE_POOL};
use crate::types::{OrchestratorError, Result};

/// Immutable bundle of request metadata
#[derive(Debug, Clone, Serialize)]
pub struct Signature {
    pub id: String,
    pub client_identifier: String,
    pub origin: String,
    pub headers: HashMap<String, String>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Summary of the live pool for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct SignaturePoolSnapshot {
    pub generation: u64,
    pub size: usize,
    pub created_at: Option<DateTime<Utc>>,
}

struct SignaturePool {
    generation: u64,
    signatures: Arc<[Signature]>,
}

/// Owns the live signature pool.
///
/// The pool is replaced as a whole on rotation. Readers take a clone of the
/// `Arc`, so a signature already handed out stays valid after a swap.
pub struct SignatureGenerator {
    config: SignatureConfig,
    rng: Mutex<Box<dyn RngCore + Send>>,
    pool: RwLock<SignaturePool>,
}

impl SignatureGenerator {
    /// Generator backed by OS entropy
    pub fn new(config: SignatureConfig) -> Result<Self> {
        Self::with_rng(config, Box::new(StdRng::from_entropy()))
    }

    /// Deterministic generator for tests and reproducible runs
    pub fn seeded(config: SignatureConfig, seed: u64) -> Result<Self> {
        Self::with_rng(config, Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn with_rng(config: SignatureConfig, rng: Box<dyn RngCore + Send>) -> Result<Self> {
        if config.pool_size < MIN_SIGNATURE_POOL {
            return Err(OrchestratorError::SignaturePoolTooSmall {
                min: MIN_SIGNATURE_POOL,
                actual: config.pool_size,
            });
        }
        if config.client_identifiers.is_empty() {
            return Err(OrchestratorError::Config(
                "signatures need at least one client identifier".to_string(),
            ));
        }

        let generator = Self {
            config,
            rng: Mutex::new(rng),
            pool: RwLock::new(SignaturePool {
                generation: 0,
                signatures: Arc::from(Vec::new()),
            }),
        };
        generator.rotate();
        Ok(generator)
    }

    /// Regenerate the whole pool
    pub fn rotate(&self) {
        let signatures: Vec<Signature> = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            (0..self.config.pool_size)
                .map(|_| self.generate(&mut **rng))
                .collect()
        };

        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        pool.generation += 1;
        pool.signatures = Arc::from(signatures);
        debug!(
            "Signature pool rotated to generation {} ({} entries)",
            pool.generation,
            pool.signatures.len()
        );
    }

    /// Uniformly random live signature
    pub fn pick_random(&self) -> Signature {
        let signatures = self.current();
        let idx = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0..signatures.len())
        };
        signatures[idx].clone()
    }

    /// The live pool, shared with any in-flight reader
    pub fn current(&self) -> Arc<[Signature]> {
        let pool = self.pool.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&pool.signatures)
    }

    pub fn generation(&self) -> u64 {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    pub fn snapshot(&self) -> SignaturePoolSnapshot {
        let pool = self.pool.read().unwrap_or_else(|e| e.into_inner());
        SignaturePoolSnapshot {
            generation: pool.generation,
            size: pool.signatures.len(),
            created_at: pool.signatures.first().map(|s| s.created_at),
        }
    }

    fn generate(&self, rng: &mut dyn RngCore) -> Signature {
        let mut id_bytes = [0u8; 16];
        rng.fill_bytes(&mut id_bytes);
        let id = uuid::Builder::from_random_bytes(id_bytes).into_uuid();

        let mut fingerprint = [0u8; 16];
        rng.fill_bytes(&mut fingerprint);

        let client_identifier = pick(rng, &self.config.client_identifiers)
            .cloned()
            .unwrap_or_default();
        let origin = pick(rng, &self.config.origin_tags)
            .cloned()
            .unwrap_or_else(|| "default".to_string());

        let mut headers = HashMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());
        if let Some(lang) = pick(rng, &self.config.accept_languages) {
            headers.insert("Accept-Language".to_string(), lang.clone());
        }
        headers.insert("X-Request-Origin".to_string(), origin.clone());
        headers.insert("X-Client-Fingerprint".to_string(), hex::encode(fingerprint));

        Signature {
            id: id.to_string(),
            client_identifier,
            origin,
            headers,
            fingerprint: hex::encode(fingerprint),
            created_at: Utc::now(),
        }
    }
}

fn pick<'a, T>(rng: &mut dyn RngCore, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        None
    } else {
        Some(&items[rng.gen_range(0..items.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(generator: &SignatureGenerator) -> Vec<String> {
        generator.current().iter().map(|s| s.id.clone()).collect()
    }

    #[test]
    fn test_pool_has_configured_size() {
        let generator = SignatureGenerator::seeded(SignatureConfig::default(), 7).unwrap();
        assert_eq!(generator.current().len(), 8);
        assert_eq!(generator.generation(), 1);

        let snapshot = generator.snapshot();
        assert_eq!((snapshot.generation, snapshot.size), (1, 8));
        assert!(snapshot.created_at.is_some());
    }

    #[test]
    fn test_rejects_pool_below_minimum() {
        let config = SignatureConfig {
            pool_size: 3,
            ..SignatureConfig::default()
        };
        assert!(matches!(
            SignatureGenerator::seeded(config, 1),
            Err(OrchestratorError::SignaturePoolTooSmall { min: 5, actual: 3 })
        ));
    }

    #[test]
    fn test_same_seed_same_rotations() {
        let a = SignatureGenerator::seeded(SignatureConfig::default(), 42).unwrap();
        let b = SignatureGenerator::seeded(SignatureConfig::default(), 42).unwrap();
        assert_eq!(ids(&a), ids(&b));

        a.rotate();
        b.rotate();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.pick_random().id, b.pick_random().id);
    }

    #[test]
    fn test_rotation_replaces_every_signature() {
        let generator = SignatureGenerator::seeded(SignatureConfig::default(), 9).unwrap();
        let before = ids(&generator);
        generator.rotate();
        let after = ids(&generator);

        assert_eq!(generator.generation(), 2);
        assert!(before.iter().all(|id| !after.contains(id)));
    }

    #[test]
    fn test_reader_keeps_old_pool_across_rotation() {
        let generator = SignatureGenerator::seeded(SignatureConfig::default(), 3).unwrap();
        let held = generator.current();
        let held_ids: Vec<_> = held.iter().map(|s| s.id.clone()).collect();

        generator.rotate();

        let still: Vec<_> = held.iter().map(|s| s.id.clone()).collect();
        assert_eq!(held_ids, still);
    }

    #[test]
    fn test_signature_headers_carry_fingerprint_and_origin() {
        let generator = SignatureGenerator::seeded(SignatureConfig::default(), 11).unwrap();
        let sig = generator.pick_random();

        assert_eq!(sig.fingerprint.len(), 32);
        assert_eq!(sig.headers.get("X-Client-Fingerprint"), Some(&sig.fingerprint));
        assert_eq!(sig.headers.get("X-Request-Origin"), Some(&sig.origin));
        assert_eq!(sig.headers.get("Accept").map(String::as_str), Some("application/json"));
        assert!(!sig.client_identifier.is_empty());
    }
}

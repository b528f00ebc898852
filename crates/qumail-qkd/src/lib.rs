//! Key-material acquisition boundary.
//!
//! The send pipeline treats key generation as an opaque collaborator that
//! returns raw bytes plus a channel-quality metric. There is exactly one
//! trait and one implementation: a simulated QKD exchange. A real QKD or
//! QRNG client plugs in behind the same trait.

use async_trait::async_trait;
use rand::{Rng, RngCore, rngs::OsRng};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeySourceError {
    #[error("key source unavailable: {0}")]
    Unavailable(String),
}

/// Raw key material plus the QBER-like quality metric measured while
/// producing it. The metric is audit data only and never affects
/// correctness.
#[derive(Debug, Clone)]
pub struct KeyBatch {
    pub material: Vec<u8>,
    pub quality: f64,
}

#[async_trait]
pub trait KeyMaterialSource: Send + Sync {
    /// Produce at least `length_bytes` of key material or fail explicitly.
    /// Short batches are not allowed; the caller slices the result into
    /// per-field keys and never retries on its own.
    async fn acquire(
        &self,
        length_bytes: usize,
        simulate_interference: bool,
    ) -> Result<KeyBatch, KeySourceError>;
}

/// Simulated QKD exchange: both endpoints hold a copy of the sifted key and
/// the quality metric is the fraction of bytes on which the copies disagree.
/// Without interference the copies match and the metric is 0.0.
pub struct SimulatedQkdSource {
    /// Per-byte corruption probability applied to the far endpoint's copy
    /// when interference is simulated.
    interference_rate: f64,
}

impl SimulatedQkdSource {
    pub fn new() -> Self {
        Self {
            interference_rate: 0.15,
        }
    }

    pub fn with_interference_rate(rate: f64) -> Self {
        Self {
            interference_rate: rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for SimulatedQkdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyMaterialSource for SimulatedQkdSource {
    async fn acquire(
        &self,
        length_bytes: usize,
        simulate_interference: bool,
    ) -> Result<KeyBatch, KeySourceError> {
        if length_bytes == 0 {
            return Err(KeySourceError::Unavailable(
                "zero-length key request".to_string(),
            ));
        }
        let mut near = vec![0u8; length_bytes];
        OsRng.fill_bytes(&mut near);

        let mut far = near.clone();
        if simulate_interference {
            for byte in far.iter_mut() {
                if OsRng.gen_bool(self.interference_rate) {
                    *byte = OsRng.r#gen();
                }
            }
        }

        let mismatches = near.iter().zip(far.iter()).filter(|(a, b)| a != b).count();
        let quality = mismatches as f64 / length_bytes as f64;
        Ok(KeyBatch {
            material: near,
            quality,
        })
    }
}

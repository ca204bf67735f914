//! Deterministic local embedding for approximate cache-key matching.
//!
//! `spec.md` places the reasoning service itself out of scope, so there is
//! no external embedding-model dependency here: prompts are embedded with
//! the hashing trick (bag-of-words hashed into fixed-size buckets, then L2
//! normalized), which keeps near-identical prompts close in cosine
//! similarity without a network call or a vocabulary to maintain.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const DIMENSION: usize = 64;

pub fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMENSION];
    for word in text.split_whitespace() {
        let mut hasher = DefaultHasher::new();
        word.to_lowercase().hash(&mut hasher);
        let bucket = (hasher.finish() as usize) % DIMENSION;
        vector[bucket] += 1.0;
    }
    let magnitude: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in &mut vector {
            *v /= magnitude;
        }
    }
    vector
}

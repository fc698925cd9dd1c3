//! hierhist-dpf: incremental distributed point functions
//!
//! Share engine for two-helper hierarchical histograms. A client turns each
//! record `(alpha, beta)` into a key pair with [`generate_keys`]; each helper
//! holds one [`KeyShare`] per record and walks it down the prefix tree one
//! level at a time with an [`EvaluationContext`].
//!
//! ```
//! use hierhist_dpf::{create_evaluation_context, evaluate_level, generate_keys, Parameters};
//!
//! let params = Parameters::uniform(&[1, 8], 32).unwrap();
//! let (key_a, key_b) = generate_keys(&params, 0b1000_0011, 1).unwrap();
//!
//! let ctx_a = create_evaluation_context(&params, key_a).unwrap();
//! let ctx_b = create_evaluation_context(&params, key_b).unwrap();
//!
//! // Level 0: empty prefix set expands the whole 1-bit domain
//! let (a, _ctx_a) = evaluate_level(ctx_a, &[]).unwrap();
//! let (b, _ctx_b) = evaluate_level(ctx_b, &[]).unwrap();
//! let sums: Vec<u64> = a.iter().zip(&b).map(|(x, y)| x.wrapping_add(*y) & 0xffff_ffff).collect();
//! assert_eq!(sums, vec![0, 1]);
//! ```
//!
//! # Security
//!
//! - Either share alone is pseudorandom and reveals neither `alpha` nor `beta`
//! - Key generation draws fresh root seeds on every call
//! - The PRG is fixed (Keccak-256 with domain separation)

mod context;
mod error;
mod key;
mod params;
mod prg;

pub use context::{
    create_evaluation_context, create_evaluation_context_from_bytes, evaluate_level,
    evaluate_level_at, EvaluationContext, CONTEXT_HEADER_SIZE, CONTEXT_MAGIC, CONTEXT_VERSION,
    MAX_FULL_EXPANSION_BITS,
};
pub use error::{DpfError, ErrorKind, Result};
pub use key::{generate_keys, generate_keys_with_rng, CorrectionWord, KeyShare};
pub use params::{LevelParameters, Parameters, MAX_LOG_DOMAIN_SIZE, MAX_VALUE_BITS};
pub use prg::{Seed, SEED_LEN};

//! Level-by-level evaluation context
//!
//! A context carries one key share through the hierarchy. Each call to
//! [`evaluate_level`] consumes the context, evaluates the next level over
//! the requested prefixes and returns a fresh context that remembers the
//! seeds reached at those prefixes, so the following level only walks the
//! remaining bits below them.
//!
//! # Wire format
//!
//! ```text
//! offset  size  field
//! 0       4     magic "HHCX"
//! 4       2     format version (little-endian)
//! 6       2     reserved (zero)
//! 8       8     body length (little-endian)
//! 16      n     bincode body (parameters, key share, progress)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{DpfError, Result};
use crate::key::{share_value, KeyShare};
use crate::params::Parameters;
use crate::prg::{self, Seed};

/// Magic bytes identifying a serialized context
pub const CONTEXT_MAGIC: [u8; 4] = *b"HHCX";

/// Current context format version
pub const CONTEXT_VERSION: u16 = 1;

/// Header size in bytes
pub const CONTEXT_HEADER_SIZE: usize = 16;

/// Upper bound on the level-0 bit-length that may be expanded in full
/// when no prefixes are supplied.
pub const MAX_FULL_EXPANSION_BITS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PartialEvaluation {
    prefix: u64,
    seed: Seed,
    control_bit: bool,
}

/// Mutable, strictly level-advancing evaluation state for one key share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationContext {
    parameters: Parameters,
    key: KeyShare,
    next_level: usize,
    /// Sorted by prefix
    partial_evaluations: Vec<PartialEvaluation>,
}

/// Create a fresh context positioned before level 0
pub fn create_evaluation_context(parameters: &Parameters, key: KeyShare) -> Result<EvaluationContext> {
    parameters.validate()?;
    key.check_against(parameters)?;
    Ok(EvaluationContext {
        parameters: parameters.clone(),
        key,
        next_level: 0,
        partial_evaluations: Vec::new(),
    })
}

/// Create a context from a serialized key share
pub fn create_evaluation_context_from_bytes(
    parameters: &Parameters,
    key_bytes: &[u8],
) -> Result<EvaluationContext> {
    let key = KeyShare::from_bytes(key_bytes)?;
    create_evaluation_context(parameters, key)
}

impl EvaluationContext {
    /// Index of the next level to be evaluated
    pub fn level(&self) -> usize {
        self.next_level
    }

    pub fn num_levels(&self) -> usize {
        self.parameters.num_levels()
    }

    /// True once every level has been evaluated
    pub fn is_exhausted(&self) -> bool {
        self.next_level >= self.parameters.num_levels()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn party(&self) -> u8 {
        self.key.party()
    }

    /// Serialize to the versioned wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| DpfError::encode("evaluation context", e))?;
        let mut buf = Vec::with_capacity(CONTEXT_HEADER_SIZE + body.len());
        buf.extend_from_slice(&CONTEXT_MAGIC);
        buf.extend_from_slice(&CONTEXT_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parse the versioned wire format and re-check internal consistency
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CONTEXT_HEADER_SIZE {
            return Err(DpfError::Parameter(format!(
                "evaluation context too short: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != CONTEXT_MAGIC {
            return Err(DpfError::Parameter("evaluation context has invalid magic".into()));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != CONTEXT_VERSION {
            return Err(DpfError::Parameter(format!(
                "unsupported evaluation context version {} (expected {})",
                version, CONTEXT_VERSION
            )));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&data[8..16]);
        let body_len = u64::from_le_bytes(len_bytes);
        let body = &data[CONTEXT_HEADER_SIZE..];
        if body.len() as u64 != body_len {
            return Err(DpfError::Parameter(format!(
                "evaluation context body is {} bytes, header says {}",
                body.len(),
                body_len
            )));
        }

        let ctx: EvaluationContext =
            bincode::deserialize(body).map_err(|e| DpfError::decode("evaluation context", e))?;
        ctx.parameters.validate()?;
        ctx.key.check_against(&ctx.parameters)?;
        if ctx.next_level > ctx.parameters.num_levels() {
            return Err(DpfError::Parameter(format!(
                "evaluation context is at level {} of {}",
                ctx.next_level,
                ctx.parameters.num_levels()
            )));
        }
        if ctx
            .partial_evaluations
            .windows(2)
            .any(|w| w[0].prefix >= w[1].prefix)
        {
            return Err(DpfError::Parameter(
                "evaluation context progress is not sorted".into(),
            ));
        }
        Ok(ctx)
    }

    fn find_partial(&self, prefix: u64) -> Option<&PartialEvaluation> {
        self.partial_evaluations
            .binary_search_by_key(&prefix, |p| p.prefix)
            .ok()
            .map(|i| &self.partial_evaluations[i])
    }

    /// Walk from `seed`/`control_bit` at depth `from` down to depth `to`
    /// along the bits of `prefix` (a `to`-bit value).
    fn walk(&self, mut seed: Seed, mut control_bit: bool, prefix: u64, from: u32, to: u32) -> (Seed, bool) {
        for depth in from..to {
            let direction = (prefix >> (to - 1 - depth)) & 1 == 1;
            let (child, child_bit) = prg::expand(&seed).child(direction);
            if control_bit {
                let cw = self.key.correction_word(depth);
                seed = prg::xor(&child, &cw.seed);
                control_bit = child_bit ^ cw.bit(direction);
            } else {
                seed = child;
                control_bit = child_bit;
            }
        }
        (seed, control_bit)
    }
}

fn check_prefixes(prefixes: &[u64], bits: u32, level: usize) -> Result<()> {
    if bits < 64 {
        if let Some(p) = prefixes.iter().find(|&&p| p >> bits != 0) {
            return Err(DpfError::Input(format!(
                "prefix {} does not fit in {} bits at level {}",
                p, bits, level
            )));
        }
    }
    let mut sorted = prefixes.to_vec();
    sorted.sort_unstable();
    if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(DpfError::Input(format!(
            "duplicate prefix {} at level {}",
            w[0], level
        )));
    }
    Ok(())
}

/// Evaluate the next level of `context` at `prefixes`.
///
/// `prefixes` are at the current level's bit-length and must be unique.
/// At level 0 an empty slice expands the whole level-0 domain; at later
/// levels every prefix's parent must have been evaluated at the previous
/// level. Returns one additive share per prefix (or per level-0 domain
/// point) and the advanced context.
pub fn evaluate_level(
    context: EvaluationContext,
    prefixes: &[u64],
) -> Result<(Vec<u64>, EvaluationContext)> {
    if context.is_exhausted() {
        return Err(DpfError::State(format!(
            "all {} levels have already been evaluated",
            context.num_levels()
        )));
    }

    let level = context.next_level;
    let params = context.parameters.levels()[level];
    let bits = params.log_domain_size;

    let full_domain: Vec<u64>;
    let prefixes = if level == 0 && prefixes.is_empty() {
        if bits > MAX_FULL_EXPANSION_BITS {
            return Err(DpfError::Input(format!(
                "level 0 has {} bits; supply prefixes instead of expanding the full domain",
                bits
            )));
        }
        full_domain = (0..(1u64 << bits)).collect();
        &full_domain[..]
    } else {
        check_prefixes(prefixes, bits, level)?;
        prefixes
    };

    let party = context.key.party();
    let value_correction = context.key.value_correction(level);
    let mut values = Vec::with_capacity(prefixes.len());
    let mut reached = Vec::with_capacity(prefixes.len());

    for &prefix in prefixes {
        let (seed, control_bit) = if level == 0 {
            let root_bit = party == 1;
            context.walk(*context.key.seed(), root_bit, prefix, 0, bits)
        } else {
            let parent_bits = context.parameters.levels()[level - 1].log_domain_size;
            let parent = prefix.checked_shr(bits - parent_bits).unwrap_or(0);
            let start = context.find_partial(parent).ok_or_else(|| {
                DpfError::Input(format!(
                    "prefix {} at level {} has parent {} that was not evaluated at level {}",
                    prefix,
                    level,
                    parent,
                    level - 1
                ))
            })?;
            context.walk(start.seed, start.control_bit, prefix, parent_bits, bits)
        };

        values.push(share_value(
            party,
            &seed,
            control_bit,
            value_correction,
            params.value_bits,
        ));
        reached.push(PartialEvaluation {
            prefix,
            seed,
            control_bit,
        });
    }

    reached.sort_unstable_by_key(|p| p.prefix);

    let mut next = context;
    next.next_level = level + 1;
    next.partial_evaluations = reached;
    Ok((values, next))
}

/// Evaluate `level`, rejecting contexts that are not positioned at it.
///
/// Used by callers that track the level externally, so a replayed or
/// skipped level is reported as a state error instead of silently
/// evaluating a different level.
pub fn evaluate_level_at(
    context: EvaluationContext,
    level: usize,
    prefixes: &[u64],
) -> Result<(Vec<u64>, EvaluationContext)> {
    if level < context.next_level {
        return Err(DpfError::State(format!(
            "level {} was already evaluated (context is at level {})",
            level, context.next_level
        )));
    }
    if level > context.next_level {
        return Err(DpfError::State(format!(
            "cannot evaluate level {} before level {}",
            level, context.next_level
        )));
    }
    evaluate_level(context, prefixes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::generate_keys;
    use crate::params::LevelParameters;

    fn mask(bits: u32) -> u64 {
        crate::params::value_mask(bits)
    }

    fn contexts(params: &Parameters, alpha: u64, beta: u64) -> (EvaluationContext, EvaluationContext) {
        let (a, b) = generate_keys(params, alpha, beta).unwrap();
        (
            create_evaluation_context(params, a).unwrap(),
            create_evaluation_context(params, b).unwrap(),
        )
    }

    fn combine(a: &[u64], b: &[u64], bits: u32) -> Vec<u64> {
        a.iter()
            .zip(b)
            .map(|(x, y)| x.wrapping_add(*y) & mask(bits))
            .collect()
    }

    #[test]
    fn test_full_level0_expansion() {
        let params = Parameters::uniform(&[3, 6], 32).unwrap();
        let alpha = 0b101_110;
        let (ca, cb) = contexts(&params, alpha, 42);

        let (va, _) = evaluate_level(ca, &[]).unwrap();
        let (vb, _) = evaluate_level(cb, &[]).unwrap();
        assert_eq!(va.len(), 8);

        let sums = combine(&va, &vb, 32);
        for (prefix, sum) in sums.iter().enumerate() {
            let expected = if prefix as u64 == alpha >> 3 { 42 } else { 0 };
            assert_eq!(*sum, expected, "prefix {}", prefix);
        }
    }

    #[test]
    fn test_point_function_at_every_level() {
        let params = Parameters::new(vec![
            LevelParameters::new(2, 64),
            LevelParameters::new(5, 16),
            LevelParameters::new(9, 8),
        ])
        .unwrap();
        let alpha = 0b10_110_0111;
        let beta = 200;
        let (mut ca, mut cb) = contexts(&params, alpha, beta);

        let mut parents: Vec<u64> = Vec::new();
        for (level, lp) in params.levels().iter().enumerate() {
            let prefixes: Vec<u64> = if level == 0 {
                (0..4).collect()
            } else {
                let shift = lp.log_domain_size - params.levels()[level - 1].log_domain_size;
                parents
                    .iter()
                    .flat_map(|p| (0..(1u64 << shift)).map(move |c| (p << shift) | c))
                    .collect()
            };
            let (va, next_a) = evaluate_level(ca, &prefixes).unwrap();
            let (vb, next_b) = evaluate_level(cb, &prefixes).unwrap();
            ca = next_a;
            cb = next_b;

            let target = alpha >> (9 - lp.log_domain_size);
            let sums = combine(&va, &vb, lp.value_bits);
            for (prefix, sum) in prefixes.iter().zip(&sums) {
                let expected = if *prefix == target { beta } else { 0 };
                assert_eq!(*sum, expected, "level {} prefix {}", level, prefix);
            }
            // Refine the true prefix plus one decoy
            parents = vec![target, target ^ 1];
        }

        assert!(ca.is_exhausted());
        assert!(matches!(evaluate_level(ca, &[]), Err(DpfError::State(_))));
    }

    #[test]
    fn test_full_width_final_level() {
        let params = Parameters::uniform(&[1, 64], 64).unwrap();
        let alpha = 0xdead_beef_0000_0001u64;
        let (ca, cb) = contexts(&params, alpha, 7);

        let (va, ca) = evaluate_level(ca, &[]).unwrap();
        let (vb, cb) = evaluate_level(cb, &[]).unwrap();
        assert_eq!(combine(&va, &vb, 64), vec![0, 7]);

        let level1 = [alpha, alpha ^ 1, 1u64 << 63];
        let (va, _) = evaluate_level(ca, &level1).unwrap();
        let (vb, _) = evaluate_level(cb, &level1).unwrap();
        assert_eq!(combine(&va, &vb, 64), vec![7, 0, 0]);
    }

    #[test]
    fn test_sparse_prefixes_are_aligned() {
        let params = Parameters::uniform(&[4, 8], 32).unwrap();
        let alpha = 0x9c;
        let (ca, cb) = contexts(&params, alpha, 5);

        let level0 = [0x3, 0x9, 0xf];
        let (va, ca) = evaluate_level(ca, &level0).unwrap();
        let (vb, cb) = evaluate_level(cb, &level0).unwrap();
        assert_eq!(combine(&va, &vb, 32), vec![0, 5, 0]);

        let level1 = [0x9c, 0x30, 0x9d];
        let (va, _) = evaluate_level(ca, &level1).unwrap();
        let (vb, _) = evaluate_level(cb, &level1).unwrap();
        assert_eq!(combine(&va, &vb, 32), vec![5, 0, 0]);
    }

    #[test]
    fn test_context_roundtrip_matches_in_memory() {
        let params = Parameters::uniform(&[2, 6, 10], 64).unwrap();
        let (a, _) = generate_keys(&params, 777, 9).unwrap();
        let ctx = create_evaluation_context(&params, a).unwrap();

        let steps: [&[u64]; 3] = [&[], &[0b1100, 0b1011], &[0b1100_0000, 0b1011_1111]];

        let mut direct = ctx.clone();
        let mut restored = ctx;
        for prefixes in steps {
            let (v1, d) = evaluate_level(direct, prefixes).unwrap();
            let bytes = restored.to_bytes().unwrap();
            let reloaded = EvaluationContext::from_bytes(&bytes).unwrap();
            let (v2, r) = evaluate_level(reloaded, prefixes).unwrap();
            assert_eq!(v1, v2);
            assert_eq!(d, r);
            direct = d;
            restored = r;
        }
    }

    #[test]
    fn test_rejects_bad_prefixes() {
        let params = Parameters::uniform(&[2, 4], 32).unwrap();
        let (ca, _) = contexts(&params, 5, 1);

        let err = evaluate_level(ca.clone(), &[4]).unwrap_err();
        assert!(matches!(err, DpfError::Input(_)));

        let err = evaluate_level(ca.clone(), &[1, 1]).unwrap_err();
        assert!(matches!(err, DpfError::Input(_)));

        let (_, ca) = evaluate_level(ca, &[1]).unwrap();
        // Parent 2 was never evaluated at level 0
        let err = evaluate_level(ca, &[0b1000]).unwrap_err();
        assert!(matches!(err, DpfError::Input(_)));
    }

    #[test]
    fn test_evaluate_level_at_rejects_replay() {
        let params = Parameters::uniform(&[2, 4], 32).unwrap();
        let (ca, _) = contexts(&params, 5, 1);
        let (_, ca) = evaluate_level_at(ca, 0, &[]).unwrap();

        let err = evaluate_level_at(ca.clone(), 0, &[]).unwrap_err();
        assert!(matches!(err, DpfError::State(_)));
        assert!(evaluate_level_at(ca, 1, &[4, 5]).is_ok());
    }

    #[test]
    fn test_large_level0_requires_prefixes() {
        let params = Parameters::uniform(&[32, 40], 32).unwrap();
        let (ca, _) = contexts(&params, 1, 1);
        assert!(matches!(evaluate_level(ca.clone(), &[]), Err(DpfError::Input(_))));
        assert!(evaluate_level(ca, &[0, 1]).is_ok());
    }

    #[test]
    fn test_from_bytes_rejects_corruption() {
        let params = Parameters::uniform(&[2, 4], 32).unwrap();
        let (ca, _) = contexts(&params, 5, 1);
        let bytes = ca.to_bytes().unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(EvaluationContext::from_bytes(&bad_magic), Err(DpfError::Parameter(_))));

        let mut bad_version = bytes.clone();
        bad_version[4] = 9;
        assert!(matches!(EvaluationContext::from_bytes(&bad_version), Err(DpfError::Parameter(_))));

        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(EvaluationContext::from_bytes(truncated), Err(DpfError::Parameter(_))));

        assert!(matches!(EvaluationContext::from_bytes(&bytes[..8]), Err(DpfError::Parameter(_))));
    }

    #[test]
    fn test_context_rejects_mismatched_key() {
        let params = Parameters::uniform(&[2, 4], 32).unwrap();
        let other = Parameters::uniform(&[2, 6], 32).unwrap();
        let (a, _) = generate_keys(&params, 5, 1).unwrap();
        let err = create_evaluation_context(&other, a.clone()).unwrap_err();
        assert!(matches!(err, DpfError::Parameter(_)));

        let bytes = a.to_bytes().unwrap();
        assert!(create_evaluation_context_from_bytes(&params, &bytes).is_ok());
        assert!(matches!(
            create_evaluation_context_from_bytes(&params, &bytes[..10]),
            Err(DpfError::Parameter(_))
        ));
    }
}

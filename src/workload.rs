//! Pre-generated per-round workload: target replica hints, keys, and
//! operation kinds for every request slot of a round.

use rand::distributions::Distribution;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::endpoint::ReplicaIdx;
use crate::utils::LoadError;

/// Operation kind of a request, with its wire code.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Op {
    Put,
    Get,
}

impl Op {
    /// Wire code of this operation.
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            Op::Put => 1,
            Op::Get => 2,
        }
    }

    /// Parses a wire code back into an operation kind.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Op::Put),
            2 => Some(Op::Get),
            _ => None,
        }
    }
}

/// Key popularity model.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum KeyDist {
    /// With probability `conflicts`% a request hits the hot key, otherwise it
    /// gets a key unique to its slot.
    Conflict { conflicts: u8 },
    /// Keys drawn from a Zipfian distribution of shape `(s, v)`.
    Zipfian { s: f64, v: f64 },
}

impl KeyDist {
    /// Picks the key distribution from the command line conflict percentage;
    /// a negative value selects Zipfian.
    pub fn from_conflicts(
        conflicts: i32,
        s: f64,
        v: f64,
    ) -> Result<Self, LoadError> {
        if conflicts > 100 {
            Err(LoadError::msg(format!(
                "conflicts percentage {} must be between 0 and 100",
                conflicts
            )))
        } else if conflicts >= 0 {
            Ok(KeyDist::Conflict {
                conflicts: conflicts as u8,
            })
        } else if s <= 1.0 || v < 1.0 {
            Err(LoadError::msg(format!(
                "invalid Zipfian parameters s = {}, v = {}",
                s, v
            )))
        } else {
            Ok(KeyDist::Zipfian { s, v })
        }
    }
}

/// Workload generation parameters.
#[derive(Debug, Clone)]
pub struct WorkloadParams {
    /// Number of replies awaited per round.
    pub per_round: usize,
    /// Extra requests sent per round beyond those awaited.
    pub eps: usize,
    /// Key popularity model.
    pub dist: KeyDist,
    /// Percentage of writes.
    pub writes: u8,
    /// Number of replicas hints are drawn over.
    pub population: usize,
    /// Seed of the single RNG used for all draws.
    pub seed: u64,
    /// Key shared by conflicting requests.
    pub hot_key: i64,
    /// Key of slot 0 among non-conflicting requests.
    pub key_base: i64,
}

/// Per-run key drawing state.
enum KeyGen {
    Conflict(u8),
    Zipfian(ZipfSampler),
}

/// A round's worth of pre-generated request slots. The same slots are
/// replayed every round.
#[derive(Debug, Clone)]
pub struct Workload {
    hints: Vec<ReplicaIdx>,
    keys: Vec<i64>,
    ops: Vec<Op>,
    per_round: usize,
}

impl Workload {
    /// Generates `per_round + eps` request slots.
    pub fn generate(params: &WorkloadParams) -> Result<Self, LoadError> {
        if params.writes > 100 {
            return Err(LoadError::msg(format!(
                "writes percentage {} must be between 0 and 100",
                params.writes
            )));
        }
        if params.population == 0 {
            return Err(LoadError::msg("replica population is zero"));
        }

        let nslots = params.per_round + params.eps;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(params.seed);
        let keygen = match params.dist {
            KeyDist::Conflict { conflicts } => KeyGen::Conflict(conflicts),
            KeyDist::Zipfian { s, v } => {
                KeyGen::Zipfian(ZipfSampler::new(s, v, nslots as u64)?)
            }
        };

        let mut hints = Vec::with_capacity(nslots);
        let mut keys = Vec::with_capacity(nslots);
        let mut ops = Vec::with_capacity(nslots);
        for i in 0..nslots {
            hints.push(rng.gen_range(0..params.population));

            let key = match keygen {
                KeyGen::Conflict(conflicts) => {
                    if rng.gen_range(0..100) < conflicts {
                        params.hot_key
                    } else {
                        params.key_base + i as i64
                    }
                }
                KeyGen::Zipfian(ref zipf) => zipf.sample(&mut rng) as i64,
            };
            keys.push(key);

            ops.push(if rng.gen_range(0..100) < params.writes {
                Op::Put
            } else {
                Op::Get
            });
        }

        Ok(Workload {
            hints,
            keys,
            ops,
            per_round: params.per_round,
        })
    }

    /// Number of request slots, including the extra `eps` ones.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of replies awaited per round.
    #[inline]
    pub fn per_round(&self) -> usize {
        self.per_round
    }

    #[inline]
    pub fn hint(&self, slot: usize) -> ReplicaIdx {
        self.hints[slot]
    }

    #[inline]
    pub fn key(&self, slot: usize) -> i64 {
        self.keys[slot]
    }

    #[inline]
    pub fn op(&self, slot: usize) -> Op {
        self.ops[slot]
    }

    /// Counts, for each of `population` replicas, how many of the awaited
    /// slots (the first `per_round` ones) route to it under `route`.
    pub fn expected_counts(
        &self,
        population: usize,
        route: impl Fn(ReplicaIdx) -> ReplicaIdx,
    ) -> Vec<usize> {
        let mut counts = vec![0; population];
        for &hint in &self.hints[..self.per_round] {
            counts[route(hint)] += 1;
        }
        counts
    }
}

/// Zipfian sampler over `[0, imax]` with `P(k) ∝ (v + k)^-s`, using the
/// rejection-inversion method of Hörmann and Derflinger. Requires `s > 1`
/// and `v >= 1`.
#[derive(Debug, Clone)]
pub struct ZipfSampler {
    imax: f64,
    v: f64,
    q: f64,
    s: f64,
    one_minus_q: f64,
    one_minus_q_inv: f64,
    hxm: f64,
    hx0_minus_hxm: f64,
}

impl ZipfSampler {
    pub fn new(s: f64, v: f64, imax: u64) -> Result<Self, LoadError> {
        if s <= 1.0 || v < 1.0 {
            return Err(LoadError::msg(format!(
                "invalid Zipfian parameters s = {}, v = {}",
                s, v
            )));
        }

        let mut z = ZipfSampler {
            imax: imax as f64,
            v,
            q: s,
            s: 0.0,
            one_minus_q: 1.0 - s,
            one_minus_q_inv: 1.0 / (1.0 - s),
            hxm: 0.0,
            hx0_minus_hxm: 0.0,
        };
        z.hxm = z.h(z.imax + 0.5);
        z.hx0_minus_hxm = z.h(0.5) - (z.v.ln() * -z.q).exp() - z.hxm;
        z.s = 1.0 - z.hinv(z.h(1.5) - (-z.q * (z.v + 1.0).ln()).exp());
        Ok(z)
    }

    #[inline]
    fn h(&self, x: f64) -> f64 {
        (self.one_minus_q * (self.v + x).ln()).exp() * self.one_minus_q_inv
    }

    #[inline]
    fn hinv(&self, x: f64) -> f64 {
        (self.one_minus_q_inv * (self.one_minus_q * x).ln()).exp() - self.v
    }
}

impl Distribution<u64> for ZipfSampler {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        loop {
            let r: f64 = rng.gen();
            let ur = self.hxm + r * self.hx0_minus_hxm;
            let x = self.hinv(ur);
            let k = (x + 0.5).floor();
            if k - x <= self.s
                || ur >= self.h(k + 0.5) - (-(k + self.v).ln() * self.q).exp()
            {
                return k as u64;
            }
        }
    }
}

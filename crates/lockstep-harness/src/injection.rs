//! Rate-driven soft-error injection.
//!
//! Each [`InjectionCategory`] has an independent mean rate. For every
//! (category, target) pair the [`Injector`] keeps a countdown drawn from a
//! geometric distribution, so firings are memoryless and, for a fixed seed,
//! fully reproducible.
//!
//! # Architecture
//!
//! ```text
//!  Injector (seeded StdRng)
//!    ├── opportunity(category, target) → bool    countdown per target
//!    ├── flip_payload(&mut [u8])                 one bit of one byte
//!    └── flip_register(&mut ArchSnapshot, ..)    one bit of one register
//! ```
//!
//! The injector only decides *when* and *which bit*; the driver applies the
//! flip and reports it as a `ProtocolEvent::InjectionFired`.

use std::collections::BTreeMap;

use lockstep_core::{ArchSnapshot, InjectionRates, RegisterRef};
use lockstep_types::RegClass;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Default seed of the injection generator.
pub const DEFAULT_INJECTION_SEED: u64 = 258_958_529;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// What an injection corrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InjectionCategory {
    /// A payload byte of a logged load (or targeted store) record.
    LoadStore,
    /// A checker's starting architectural state.
    ArchState,
    /// A checker's registers while it replays.
    TcState,
    /// The destination register of a targeted operation class.
    OpClass,
    /// A permanent stuck-at bit; not rate driven.
    StuckAt,
}

impl InjectionCategory {
    pub const ALL: [Self; 5] = [
        Self::LoadStore,
        Self::ArchState,
        Self::TcState,
        Self::OpClass,
        Self::StuckAt,
    ];

    /// Stable label carried by `InjectionFired` events.
    pub const fn label(self) -> &'static str {
        match self {
            Self::LoadStore => "load_store",
            Self::ArchState => "arch_state",
            Self::TcState => "tc_state",
            Self::OpClass => "op_class",
            Self::StuckAt => "stuck_at",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.label() == label)
    }

    /// Whether firings come from a geometric countdown and record a lapse.
    pub const fn is_scheduled(self) -> bool {
        !matches!(self, Self::StuckAt)
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// Geometric countdown
// ---------------------------------------------------------------------------

/// Opportunities until the next firing of a rate-`rate` category.
///
/// `next = 1 + floor(ln(U) / ln(1 - 1/rate))` with `U` uniform in `(0, 1]`.
/// A rate of 1 or less fires on every opportunity.
pub fn geometric_gap(rng: &mut StdRng, rate: f64) -> u64 {
    if rate <= 1.0 {
        return 1;
    }
    let u = 1.0 - rng.r#gen::<f64>();
    let failures = (u.ln() / (1.0 - 1.0 / rate).ln()).floor();
    if failures.is_finite() && failures >= 0.0 {
        // Truncation is fine: gaps beyond u64 never fire in practice.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let failures = failures as u64;
        failures.saturating_add(1)
    } else {
        1
    }
}

#[derive(Debug, Clone, Copy)]
struct Countdown {
    remaining: u64,
    elapsed: u64,
}

// ---------------------------------------------------------------------------
// Injector
// ---------------------------------------------------------------------------

/// Seeded decision source for soft-error injection.
#[derive(Debug)]
pub struct Injector {
    rates: InjectionRates,
    rng: StdRng,
    seed: u64,
    countdowns: BTreeMap<(InjectionCategory, usize), Countdown>,
    lapses: Vec<u64>,
    fired: [u64; 5],
    limit: Option<u64>,
}

impl Injector {
    pub fn new(rates: InjectionRates, seed: u64) -> Self {
        Self {
            rates,
            rng: StdRng::seed_from_u64(seed),
            seed,
            countdowns: BTreeMap::new(),
            lapses: Vec::new(),
            fired: [0; 5],
            limit: None,
        }
    }

    /// Stop firing once `limit` scheduled injections have fired.
    #[must_use]
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rates(&self) -> &InjectionRates {
        &self.rates
    }

    /// Mean rate of a category; stuck-at faults have none.
    pub fn rate(&self, category: InjectionCategory) -> f64 {
        match category {
            InjectionCategory::LoadStore => self.rates.load_store,
            InjectionCategory::ArchState => self.rates.arch_state,
            InjectionCategory::TcState => self.rates.tc_state,
            InjectionCategory::OpClass => self.rates.op_class,
            InjectionCategory::StuckAt => 0.0,
        }
    }

    /// Count one opportunity for `target` and report whether it fires.
    pub fn opportunity(&mut self, category: InjectionCategory, target: usize) -> bool {
        let rate = self.rate(category);
        if rate <= 0.0 || self.limit.is_some_and(|limit| self.total_fired() >= limit) {
            return false;
        }
        let Self {
            rng, countdowns, ..
        } = self;
        let countdown = countdowns
            .entry((category, target))
            .or_insert_with(|| Countdown {
                remaining: geometric_gap(rng, rate),
                elapsed: 0,
            });
        countdown.elapsed += 1;
        countdown.remaining -= 1;
        if countdown.remaining > 0 {
            return false;
        }
        let lapse = countdown.elapsed;
        countdown.remaining = geometric_gap(rng, rate);
        countdown.elapsed = 0;
        self.lapses.push(lapse);
        self.fired[category.index()] += 1;
        trace!(
            category = category.label(),
            target,
            lapse,
            "injection scheduled"
        );
        true
    }

    /// Flip one random bit of one random byte; an empty payload becomes a
    /// single byte `1`.
    pub fn flip_payload(&mut self, payload: &mut Vec<u8>) {
        if payload.is_empty() {
            payload.push(1);
            return;
        }
        let index = self.rng.gen_range(0..payload.len());
        let bit = self.rng.gen_range(0..8_u32);
        payload[index] ^= 1 << bit;
    }

    /// Flip one random bit of one of the first `count` registers of `class`.
    pub fn flip_register(
        &mut self,
        state: &mut ArchSnapshot,
        class: RegClass,
        count: usize,
    ) -> Option<RegisterRef> {
        if count == 0 {
            return None;
        }
        let index = self.rng.gen_range(0..count);
        self.flip_bit_of(state, RegisterRef { class, index })
    }

    /// Flip one random bit of `reg`.
    pub fn flip_bit_of(&mut self, state: &mut ArchSnapshot, reg: RegisterRef) -> Option<RegisterRef> {
        let bit = self.rng.gen_range(0..u64::BITS);
        state.flip_bit(reg.class, reg.index, bit).then_some(reg)
    }

    /// Opportunities between consecutive firings, in firing order.
    pub fn lapses(&self) -> &[u64] {
        &self.lapses
    }

    pub fn fired(&self, category: InjectionCategory) -> u64 {
        self.fired[category.index()]
    }

    /// Scheduled firings across every category.
    pub fn total_fired(&self) -> u64 {
        self.fired.iter().sum()
    }
}

//! Fetch labels, submit modes, and the enums mapped onto engine constants.
//!
//! # Labels
//!
//! Every fetcher invocation receives a [`FetchLabels`] bit set describing how
//! the fetch is being run. The two priority labels are mutually exclusive:
//!
//! - [`FetchLabels::ONDEMAND`]: the user is waiting for this result
//! - [`FetchLabels::BACKGROUND`]: speculative prefetch work
//!
//! # Constants
//!
//! [`TimeUnit`] and [`StrategyType`] are resolved to engine-side constants by
//! name when a cache handle is built. Each enum lists every variant in `ALL`
//! so the resolution table is exhaustive.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

// =============================================================================
// Label Bits
// =============================================================================

/// Label bit for demand (user-blocking) fetches.
pub const LABEL_ONDEMAND: u32 = 0x4;

/// Label bit for background prefetches.
pub const LABEL_BACKGROUND: u32 = 0x8;

/// Label bit hinting a small transfer.
pub const LABEL_SMALL: u32 = 0x10;

/// Label bit hinting a large transfer.
pub const LABEL_LARGE: u32 = 0x20;

const NET_PREF_SHIFT: u32 = 16;

/// Network preference bit: prefer WiFi.
pub const LABEL_PREFER_WIFI: u32 = 1 << NET_PREF_SHIFT;

/// Network preference bit: prefer cellular.
pub const LABEL_PREFER_THREEG: u32 = 2 << NET_PREF_SHIFT;

/// Labels passed to a fetcher on each invocation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FetchLabels(u32);

impl FetchLabels {
    /// No labels.
    pub const EMPTY: FetchLabels = FetchLabels(0);
    /// Demand fetch.
    pub const ONDEMAND: FetchLabels = FetchLabels(LABEL_ONDEMAND);
    /// Background prefetch.
    pub const BACKGROUND: FetchLabels = FetchLabels(LABEL_BACKGROUND);
    /// Small transfer.
    pub const SMALL: FetchLabels = FetchLabels(LABEL_SMALL);
    /// Large transfer.
    pub const LARGE: FetchLabels = FetchLabels(LABEL_LARGE);
    /// Prefer WiFi.
    pub const PREFER_WIFI: FetchLabels = FetchLabels(LABEL_PREFER_WIFI);
    /// Prefer cellular.
    pub const PREFER_THREEG: FetchLabels = FetchLabels(LABEL_PREFER_THREEG);
    /// All network preference labels.
    pub const ALL_NET_PREF: FetchLabels = FetchLabels(LABEL_PREFER_WIFI | LABEL_PREFER_THREEG);

    /// Creates labels from raw bits.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub fn contains(&self, other: FetchLabels) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: FetchLabels) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: FetchLabels) {
        self.0 &= !other.0;
    }

    /// Returns true if the demand label is set.
    pub fn is_demand(&self) -> bool {
        self.contains(Self::ONDEMAND)
    }

    /// Returns true if the background label is set.
    pub fn is_background(&self) -> bool {
        self.contains(Self::BACKGROUND)
    }

    /// Returns these labels with the priority label switched.
    ///
    /// Non-priority labels (size hints, network preferences) are kept.
    pub fn with_demand(mut self, demand: bool) -> Self {
        if demand {
            self.remove(Self::BACKGROUND);
            self.insert(Self::ONDEMAND);
        } else {
            self.remove(Self::ONDEMAND);
            self.insert(Self::BACKGROUND);
        }
        self
    }
}

impl BitOr for FetchLabels {
    type Output = FetchLabels;

    fn bitor(self, rhs: Self) -> Self::Output {
        FetchLabels(self.0 | rhs.0)
    }
}

impl BitOrAssign for FetchLabels {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FetchLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(FetchLabels, &str); 6] = [
            (FetchLabels::ONDEMAND, "ONDEMAND"),
            (FetchLabels::BACKGROUND, "BACKGROUND"),
            (FetchLabels::SMALL, "SMALL"),
            (FetchLabels::LARGE, "LARGE"),
            (FetchLabels::PREFER_WIFI, "PREFER_WIFI"),
            (FetchLabels::PREFER_THREEG, "PREFER_THREEG"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(label, _)| self.contains(*label))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "FetchLabels({:#x} {})", self.0, names.join("|"))
    }
}

// =============================================================================
// Submit Mode
// =============================================================================

/// Priority mode a fetch is submitted with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubmitMode {
    /// Hinted prefetch; the engine's strategy decides when it starts.
    Background,
    /// Prefetch started immediately, bypassing strategy deferral.
    Foreground,
    /// User-blocking fetch, started immediately with demand labels.
    Demand,
}

impl SubmitMode {
    /// Returns the labels a fetch submitted in this mode starts with.
    pub fn initial_labels(&self) -> FetchLabels {
        match self {
            SubmitMode::Background | SubmitMode::Foreground => FetchLabels::BACKGROUND,
            SubmitMode::Demand => FetchLabels::ONDEMAND,
        }
    }
}

impl fmt::Display for SubmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitMode::Background => write!(f, "background"),
            SubmitMode::Foreground => write!(f, "foreground"),
            SubmitMode::Demand => write!(f, "demand"),
        }
    }
}

// =============================================================================
// Engine Constants
// =============================================================================

/// A key that maps onto a named engine-side constant.
pub trait ForeignConstantKey: Copy + Eq + std::hash::Hash + fmt::Debug + 'static {
    /// Every variant, used to build an exhaustive resolution table.
    const ALL: &'static [Self];

    /// Name of the constant's class on the engine side.
    const CLASS: &'static str;

    /// Name of this variant's constant on the engine side.
    fn foreign_name(&self) -> &'static str;
}

/// Unit for timed waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Converts `amount` of this unit to a duration, saturating on overflow.
    pub fn to_duration(&self, amount: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(amount),
            TimeUnit::Microseconds => Duration::from_micros(amount),
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(3_600)),
            TimeUnit::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }
}

impl ForeignConstantKey for TimeUnit {
    const ALL: &'static [Self] = &[
        TimeUnit::Nanoseconds,
        TimeUnit::Microseconds,
        TimeUnit::Milliseconds,
        TimeUnit::Seconds,
        TimeUnit::Minutes,
        TimeUnit::Hours,
        TimeUnit::Days,
    ];

    const CLASS: &'static str = "concurrent.TimeUnit";

    fn foreign_name(&self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "NANOSECONDS",
            TimeUnit::Microseconds => "MICROSECONDS",
            TimeUnit::Milliseconds => "MILLISECONDS",
            TimeUnit::Seconds => "SECONDS",
            TimeUnit::Minutes => "MINUTES",
            TimeUnit::Hours => "HOURS",
            TimeUnit::Days => "DAYS",
        }
    }
}

/// Prefetch strategy the engine is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StrategyType {
    /// Start every hinted prefetch as soon as it is enqueued.
    #[default]
    Aggressive,
    /// Never start prefetches; fetch only on demand.
    Conservative,
    /// Decide per prefetch against energy and data budgets.
    Adaptive,
}

impl ForeignConstantKey for StrategyType {
    const ALL: &'static [Self] = &[
        StrategyType::Aggressive,
        StrategyType::Conservative,
        StrategyType::Adaptive,
    ];

    const CLASS: &'static str = "eac.PrefetchStrategyType";

    fn foreign_name(&self) -> &'static str {
        match self {
            StrategyType::Aggressive => "AGGRESSIVE",
            StrategyType::Conservative => "CONSERVATIVE",
            StrategyType::Adaptive => "ADAPTIVE",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.foreign_name())
    }
}

//! Entry-point pairing.
//!
//! Selects which entry-point (self-)pairs must be checked for concurrent
//! conflicts. The init entry point pairs with nothing; an entry point
//! self-pairs iff it can interleave with itself; the pairing method controls
//! breadth.

use crate::driver::DeviceDriver;
use serde::Serialize;
use std::fmt;

/// Breadth of pair generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PairingMethod {
    /// One group per entry point holding every compatible partner; each
    /// group is checked once against a merged "any-of" composite.
    #[default]
    Linear,
    /// Every unordered compatible pair exactly once.
    Triangular,
    /// Every ordered compatible pair independently.
    Quadratic,
}

impl fmt::Display for PairingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingMethod::Linear => write!(f, "linear"),
            PairingMethod::Triangular => write!(f, "triangular"),
            PairingMethod::Quadratic => write!(f, "quadratic"),
        }
    }
}

/// A pairing unit: one logger entry point and the checker partners it is
/// composed against. For TRIANGULAR and QUADRATIC `checkers` always has
/// exactly one element; LINEAR merges all compatible partners into one
/// group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryPointPair {
    pub logger: String,
    pub checkers: Vec<String>,
    pub method: PairingMethod,
}

impl EntryPointPair {
    /// Stable artifact suffix: `<A>_<B>` for a concrete pair, `<A>_any` for
    /// a merged group.
    pub fn artifact_tag(&self) -> String {
        match self.checkers.as_slice() {
            [single] => format!("{}_{}", self.logger, single),
            _ => format!("{}_any", self.logger),
        }
    }

    /// True when this unit covers the unordered pair (a, b).
    pub fn covers(&self, a: &str, b: &str) -> bool {
        (self.logger == a && self.checkers.iter().any(|c| c == b))
            || (self.logger == b && self.checkers.iter().any(|c| c == a))
    }
}

fn is_new_pair(pairs: &[EntryPointPair], ep1: &str, ep2: &str) -> bool {
    !pairs.iter().any(|p| p.covers(ep1, ep2))
}

/// Generate the pairs to check for the given driver under `method`.
///
/// Re-running on the same driver with the same method yields the same set:
/// generation is a pure function of the (ordered) entry-point list, and
/// duplicate suppression is keyed on both orderings.
pub fn generate_pairs(driver: &DeviceDriver, method: PairingMethod) -> Vec<EntryPointPair> {
    let mut pairs: Vec<EntryPointPair> = Vec::new();

    match method {
        PairingMethod::Linear => {
            for ep1 in &driver.entry_points {
                if pairs.iter().any(|p| p.logger == ep1.name) {
                    continue;
                }
                let mut partners = Vec::new();
                if DeviceDriver::can_run_concurrently(&ep1.kernel_func, &ep1.kernel_func) {
                    partners.push(ep1.name.clone());
                }
                for ep2 in &driver.entry_points {
                    if ep2.name == ep1.name {
                        continue;
                    }
                    if !DeviceDriver::can_run_concurrently(&ep1.kernel_func, &ep2.kernel_func) {
                        continue;
                    }
                    if !is_new_pair(&pairs, &ep1.name, &ep2.name) {
                        continue;
                    }
                    if partners.contains(&ep2.name) {
                        continue;
                    }
                    partners.push(ep2.name.clone());
                }
                if partners.is_empty() {
                    continue;
                }
                pairs.push(EntryPointPair {
                    logger: ep1.name.clone(),
                    checkers: partners,
                    method,
                });
            }
        }
        PairingMethod::Triangular => {
            for ep1 in &driver.entry_points {
                for ep2 in &driver.entry_points {
                    if !DeviceDriver::can_run_concurrently(&ep1.kernel_func, &ep2.kernel_func) {
                        continue;
                    }
                    if !is_new_pair(&pairs, &ep1.name, &ep2.name) {
                        continue;
                    }
                    pairs.push(EntryPointPair {
                        logger: ep1.name.clone(),
                        checkers: vec![ep2.name.clone()],
                        method,
                    });
                }
            }
        }
        PairingMethod::Quadratic => {
            for ep1 in &driver.entry_points {
                for ep2 in &driver.entry_points {
                    if !DeviceDriver::can_run_concurrently(&ep1.kernel_func, &ep2.kernel_func) {
                        continue;
                    }
                    // Ordered pairs are kept independently; only exact
                    // duplicates (same ordering) are suppressed.
                    if pairs
                        .iter()
                        .any(|p| p.logger == ep1.name && p.checkers == [ep2.name.clone()])
                    {
                        continue;
                    }
                    pairs.push(EntryPointPair {
                        logger: ep1.name.clone(),
                        checkers: vec![ep2.name.clone()],
                        method,
                    });
                }
            }
        }
    }

    pairs
}

/// Human-readable pair listing, one logger per paragraph.
pub fn render_pairs(pairs: &[EntryPointPair]) -> String {
    let mut out = String::new();
    for pair in pairs {
        out.push_str(&format!("Entry Point: {}\n", pair.logger));
        for checker in &pair.checkers {
            out.push_str(&format!(" :: {checker}\n"));
        }
    }
    out
}

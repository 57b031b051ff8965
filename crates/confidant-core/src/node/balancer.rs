//! Fair sharing of the node-wide rate caps between connected peers.
//!
//! Each balancing round looks at what every peer was allowed and what it
//! actually moved, and hands out new caps:
//!
//! - a peer using more than half of its cap is grown halfway toward its
//!   individual cap; otherwise it is offered its observed rate plus headroom
//! - if the offers exceed the total, peers above the fair share give back the
//!   excess in proportion to how far above it they are
//! - otherwise the spare is handed to the busy peers first, then to everyone,
//!   never past an individual cap
//!
//! A total cap of zero switches balancing off: every peer gets its individual cap.

/// Smallest cap offered to an idle peer, bytes per second
pub const MIN_SHARE: u64 = 1024;

/// Fraction of the current cap above which a peer counts as busy
const BUSY_THRESHOLD: f64 = 0.5;

/// Fraction of the distance to the individual cap a busy peer grows by
const GROWTH_STEP: f64 = 0.5;

/// Headroom over the observed rate offered to a quiet peer
const HEADROOM: f64 = 1.2;

/// One peer's input to a balancing round.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Demand {
    /// Cap in force during the last round; 0 if none was set yet
    pub current: u64,
    /// Smoothed rate the peer actually achieved, bytes per second
    pub observed: f64,
    /// Most this peer may ever get; 0 = no individual limit
    pub individual: u64,
}

/// Compute new caps for `demands` sharing `total` bytes per second.
///
/// The result has one entry per demand, in order. With a non-zero total,
/// every cap is at most the peer's individual cap and the caps sum to at most
/// `total` (as long as `total` leaves each peer at least one byte).
#[must_use]
pub fn balance(total: u64, demands: &[Demand]) -> Vec<u64> {
    if demands.is_empty() {
        return Vec::new();
    }
    if total == 0 {
        return demands.iter().map(|d| d.individual).collect();
    }

    let total_f = total as f64;
    let fair = total_f / demands.len() as f64;
    let floor = fair.min(MIN_SHARE as f64);
    let limits: Vec<f64> = demands
        .iter()
        .map(|d| {
            if d.individual == 0 {
                total_f
            } else {
                (d.individual as f64).min(total_f)
            }
        })
        .collect();

    let mut busy = vec![false; demands.len()];
    let mut shares: Vec<f64> = demands
        .iter()
        .zip(&limits)
        .zip(busy.iter_mut())
        .map(|((d, &limit), busy)| {
            let current = if d.current == 0 {
                fair.min(limit)
            } else {
                (d.current as f64).min(limit)
            };
            let want = if d.observed > BUSY_THRESHOLD * current && current < limit {
                *busy = true;
                current + (limit - current) * GROWTH_STEP
            } else {
                (d.observed * HEADROOM).max(floor)
            };
            want.clamp(floor.min(limit), limit)
        })
        .collect();

    let wanted: f64 = shares.iter().sum();
    if wanted > total_f {
        squeeze(&mut shares, wanted - total_f, fair);
    } else {
        let mut spare = total_f - wanted;
        spare = fill(&mut shares, &limits, spare, |i| busy[i]);
        fill(&mut shares, &limits, spare, |_| true);
    }

    shares.iter().map(|s| (s.floor() as u64).max(1)).collect()
}

/// Take `excess` from the shares above `fair`, proportionally to their overage.
fn squeeze(shares: &mut [f64], excess: f64, fair: f64) {
    let overage: f64 = shares.iter().map(|s| (s - fair).max(0.0)).sum();
    if overage <= 0.0 {
        return;
    }
    for share in shares.iter_mut() {
        let over = (*share - fair).max(0.0);
        *share -= excess * over / overage;
    }
}

/// Hand out `spare` evenly to eligible shares below their limits.
/// Returns what could not be placed.
fn fill(shares: &mut [f64], limits: &[f64], mut spare: f64, eligible: impl Fn(usize) -> bool) -> f64 {
    for _ in 0..shares.len() {
        let open: Vec<usize> = (0..shares.len())
            .filter(|&i| eligible(i) && shares[i] < limits[i])
            .collect();
        if open.is_empty() || spare < 1.0 {
            break;
        }
        let each = spare / open.len() as f64;
        for i in open {
            let add = each.min(limits[i] - shares[i]);
            shares[i] += add;
            spare -= add;
        }
    }
    spare
}

//! Payment-chain construction.
//!
//! Fees compound: a hop charges a percentage of everything routed past it
//! (payload capacity plus all downstream fees), so the required capacity
//! at hop `i` is `x + cumulative_fees[i+1]`. Capacity caps in turn shrink
//! the payload `x`, which changes the fees again, resolved by a
//! fixed-point iteration capped at 10 rounds.
//!
//! All arithmetic is integer-only: proportional fees are basis points
//! over a 10_000 denominator, so a fee is exact at any capacity instead
//! of drifting once amounts pass the float mantissa.

use std::time::Duration;

use crate::types::{ChainHop, PaymentChainSection};
use crate::{PaymentError, Result};

const MAX_ITERATIONS: usize = 10;
const BPS_DENOMINATOR: i128 = 10_000;

fn to_amount(value: u128) -> Result<i128> {
    i128::try_from(value).map_err(|_| PaymentError::AmountOverflow)
}

/// Build a concrete payment chain carrying `initial_capacity` (or as much
/// of it as the hops allow) through `sections`.
///
/// Returns one [`ChainHop`] per section with:
/// - `capacity = x + cumulative_fees[i+1]`: what the hop must route,
/// - `fee = cumulative_fees[i]`: what the sender pays up to this hop,
/// - `deadline = now + base_ttl + (n - i) * hop_ttl`: later hops get
///   tighter deadlines so an upstream hop can always settle downstream.
///
/// Fails with [`PaymentError::InsufficientCapacity`] when the minimum
/// capacity along the way cannot even cover the fees, and with
/// [`PaymentError::AmountOverflow`] when amounts leave the signed
/// 128-bit range.
pub fn build_payments_chain(
    sections: &[PaymentChainSection],
    initial_capacity: u128,
    base_ttl: Duration,
    hop_ttl: Duration,
    now_unix: u64,
) -> Result<Vec<ChainHop>> {
    let n = sections.len();
    if n == 0 {
        return Err(PaymentError::EmptyChain);
    }

    let initial = to_amount(initial_capacity)?;
    let mut min_fees = Vec::with_capacity(n);
    let mut max_capacities = Vec::with_capacity(n);
    for section in sections {
        min_fees.push(to_amount(section.min_fee)?);
        max_capacities.push(to_amount(section.max_capacity)?);
    }

    let mut cumulative = vec![0i128; n + 1];
    let mut fees = vec![0i128; n];
    let mut x = initial;

    for _ in 0..MAX_ITERATIONS {
        cumulative[n] = 0;
        for i in (0..n).rev() {
            let routed = x
                .checked_add(cumulative[i + 1])
                .ok_or(PaymentError::AmountOverflow)?;
            // Exact integer percentage, truncated toward zero
            let candidate = routed
                .checked_mul(sections[i].fee_bps as i128)
                .ok_or(PaymentError::AmountOverflow)?
                / BPS_DENOMINATOR;
            fees[i] = candidate.max(min_fees[i]);
            cumulative[i] = fees[i]
                .checked_add(cumulative[i + 1])
                .ok_or(PaymentError::AmountOverflow)?;
        }

        let mut new_x = initial;
        for i in 0..n {
            let allowed = max_capacities[i] - cumulative[i + 1];
            if allowed < new_x {
                new_x = allowed;
            }
        }

        if new_x == x {
            break;
        }
        x = new_x;
    }

    if x < 0 {
        return Err(PaymentError::InsufficientCapacity);
    }

    let base = now_unix + base_ttl.as_secs();
    let hop_secs = hop_ttl.as_secs();

    Ok((0..n)
        .map(|i| ChainHop {
            target: sections[i].key,
            capacity: (x + cumulative[i + 1]) as u128,
            fee: cumulative[i] as u128,
            deadline: base + (n - i) as u64 * hop_secs,
        })
        .collect())
}

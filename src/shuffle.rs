//! Explicit Fisher–Yates shuffle over an injected randomness source.

use rand::Rng;

/// Shuffle `items` in place with the classic Fisher–Yates walk.
///
/// Every ordering decision in the scheduler draws from the single injected
/// source, so tests can pin a seed and observe a stable order.
pub fn fisher_yates<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    if items.len() < 2 {
        return;
    }
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

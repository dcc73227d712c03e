//! Schedule and batching helpers

use ndarray::{Array1, Array2, Axis};
use rand::Rng;

/// SGDR learning-rate schedule: cosine annealing from `n_max` to `n_min`
/// with warm restarts, each cycle twice as long as the last.
///
/// `ranges` cycles starting at `init_cycle` epochs give a schedule of
/// `init_cycle * (2^ranges - 1)` entries.
pub fn sgdr_learning_rate(n_max: f64, n_min: f64, ranges: usize, init_cycle: usize) -> Vec<f64> {
    let mut schedule = Vec::new();
    let mut cycle = init_cycle;
    for _ in 0..ranges {
        for t in 0..cycle {
            let frac = t as f64 / cycle as f64;
            let lr = n_min + 0.5 * (n_max - n_min) * (1.0 + (std::f64::consts::PI * frac).cos());
            schedule.push(lr);
        }
        cycle *= 2;
    }
    schedule
}

/// Sample `size` distinct indices from `0..pool` without replacement.
///
/// The batch is clamped to the pool size when the pool is smaller.
pub fn sample_batch_indices(rng: &mut impl Rng, pool: usize, size: usize) -> Vec<usize> {
    rand::seq::index::sample(rng, pool, size.min(pool)).into_vec()
}

/// Select the rows of a feature matrix and label vector at `indices`.
pub fn take_batch(
    x: &Array2<f64>,
    y: &Array1<f64>,
    indices: &[usize],
) -> (Array2<f64>, Array1<f64>) {
    (x.select(Axis(0), indices), y.select(Axis(0), indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_sgdr_schedule_length() {
        let schedule = sgdr_learning_rate(0.05, 0.001, 5, 10);
        // 10 + 20 + 40 + 80 + 160
        assert_eq!(schedule.len(), 310);
    }

    #[test]
    fn test_sgdr_restarts_at_n_max() {
        let schedule = sgdr_learning_rate(0.05, 0.001, 2, 10);
        assert!((schedule[0] - 0.05).abs() < 1e-12);
        // First entry of the second cycle restarts at n_max.
        assert!((schedule[10] - 0.05).abs() < 1e-12);
        for &lr in &schedule {
            assert!(lr >= 0.001 - 1e-12 && lr <= 0.05 + 1e-12);
        }
    }

    #[test]
    fn test_batch_indices_without_replacement() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let idx = sample_batch_indices(&mut rng, 100, 32);

        assert_eq!(idx.len(), 32);
        let mut sorted = idx.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 32);
    }

    #[test]
    fn test_batch_clamped_to_pool() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let idx = sample_batch_indices(&mut rng, 5, 32);
        assert_eq!(idx.len(), 5);
    }

    #[test]
    fn test_take_batch() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let y = array![0.0, 1.0, 0.0];
        let (bx, by) = take_batch(&x, &y, &[2, 0]);

        assert_eq!(bx, array![[5.0, 6.0], [1.0, 2.0]]);
        assert_eq!(by, array![0.0, 0.0]);
    }
}

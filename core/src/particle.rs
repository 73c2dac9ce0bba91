//! Particles, the particle cloud, and the statistical operations performed on it: initialization
//! scatter, weight normalization, resampling, and reduction to a single pose estimate.
use crate::error::LocalizerError;
use crate::{Pose2D, circular_mean, wrap_to_pi};

use log::debug;
use nalgebra::{Matrix3, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// A single weighted pose hypothesis in the map frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("theta", &self.theta)
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(x: f64, y: f64, theta: f64, weight: f64) -> Particle {
        Particle {
            x,
            y,
            theta: wrap_to_pi(theta),
            weight,
        }
    }
    pub fn pose(&self) -> Pose2D {
        Pose2D::new(self.x, self.y, self.theta)
    }
}

/// Outcome of [`ParticleCloud::normalize_weights`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WeightNormalization {
    /// Weights were divided by their (positive, finite) sum.
    Normalized { sum: f64 },
    /// The raw sum was zero or non-finite; every weight was reset to exactly `1/N`.
    UniformFallback { sum: f64 },
}
impl WeightNormalization {
    pub fn is_degenerate(&self) -> bool {
        matches!(self, WeightNormalization::UniformFallback { .. })
    }
}

/// How the cloud is reduced to a single pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    /// Weighted centroid for position and weighted circular mean for heading.
    #[default]
    WeightedAverage,
    /// The pose of the single highest-weight particle.
    HighestWeight,
}

/// How a new generation of particles is drawn from the weighted cloud.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    /// One uniform offset, N evenly spaced pointers. Lowest resampling noise.
    #[default]
    Systematic,
    /// One uniform draw per stratum of width 1/N.
    Stratified,
    /// N independent categorical draws.
    Multinomial,
    /// Deterministic integer copies, remainder drawn systematically from the residual weights.
    Residual,
}

impl ParticleResamplingStrategy {
    /// Draw exactly `particles.len()` independent copies proportional to weight. The returned
    /// particles carry uniform weights.
    ///
    /// # Errors
    /// [`LocalizerError::DegenerateWeights`] if any weight is negative or non-finite, or if the
    /// weights do not sum to a positive, finite value. The input is left untouched in that case.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        particles: &[Particle],
        rng: &mut R,
    ) -> Result<Vec<Particle>, LocalizerError> {
        match self {
            ParticleResamplingStrategy::Systematic => systematic_resample(particles, rng),
            ParticleResamplingStrategy::Stratified => stratified_resample(particles, rng),
            ParticleResamplingStrategy::Multinomial => multinomial_resample(particles, rng),
            ParticleResamplingStrategy::Residual => residual_resample(particles, rng),
        }
    }
}

/// Validated, normalized cumulative weights.
fn cumulative_weights(particles: &[Particle]) -> Result<Vec<f64>, LocalizerError> {
    let sum: f64 = particles.iter().map(|p| p.weight).sum();
    let valid = particles
        .iter()
        .all(|p| p.weight.is_finite() && p.weight >= 0.0);
    if particles.is_empty() || !valid || !(sum > 0.0 && sum.is_finite()) {
        return Err(LocalizerError::DegenerateWeights { sum });
    }
    let mut running = 0.0;
    let mut cumsum: Vec<f64> = particles
        .iter()
        .map(|p| {
            running += p.weight / sum;
            running
        })
        .collect();
    // Guard against the running sum ending a hair below one.
    if let Some(last) = cumsum.last_mut() {
        *last = 1.0;
    }
    Ok(cumsum)
}

/// Select one particle per (sorted, in [0, 1)) pointer position.
fn select_sorted(particles: &[Particle], cumsum: &[f64], positions: &[f64]) -> Vec<Particle> {
    let n = particles.len();
    let uniform = 1.0 / n as f64;
    let mut selected = Vec::with_capacity(positions.len());
    let mut i = 0;
    for &u in positions {
        while i < n - 1 && u >= cumsum[i] {
            i += 1;
        }
        let mut copy = particles[i];
        copy.weight = uniform;
        selected.push(copy);
    }
    selected
}

pub fn systematic_resample<R: Rng + ?Sized>(
    particles: &[Particle],
    rng: &mut R,
) -> Result<Vec<Particle>, LocalizerError> {
    let cumsum = cumulative_weights(particles)?;
    let n = particles.len();
    let step = 1.0 / n as f64;
    let offset = rng.random::<f64>() * step;
    let positions: Vec<f64> = (0..n).map(|i| offset + i as f64 * step).collect();
    Ok(select_sorted(particles, &cumsum, &positions))
}

pub fn stratified_resample<R: Rng + ?Sized>(
    particles: &[Particle],
    rng: &mut R,
) -> Result<Vec<Particle>, LocalizerError> {
    let cumsum = cumulative_weights(particles)?;
    let n = particles.len();
    let step = 1.0 / n as f64;
    let positions: Vec<f64> = (0..n)
        .map(|i| (i as f64 + rng.random::<f64>()) * step)
        .collect();
    Ok(select_sorted(particles, &cumsum, &positions))
}

pub fn multinomial_resample<R: Rng + ?Sized>(
    particles: &[Particle],
    rng: &mut R,
) -> Result<Vec<Particle>, LocalizerError> {
    let cumsum = cumulative_weights(particles)?;
    let n = particles.len();
    let uniform = 1.0 / n as f64;
    Ok((0..n)
        .map(|_| {
            let u = rng.random::<f64>();
            let index = cumsum.partition_point(|&c| c <= u).min(n - 1);
            let mut copy = particles[index];
            copy.weight = uniform;
            copy
        })
        .collect())
}

pub fn residual_resample<R: Rng + ?Sized>(
    particles: &[Particle],
    rng: &mut R,
) -> Result<Vec<Particle>, LocalizerError> {
    // Validation only; residual resampling works on the normalized weights directly.
    cumulative_weights(particles)?;
    let n = particles.len();
    let sum: f64 = particles.iter().map(|p| p.weight).sum();
    let uniform = 1.0 / n as f64;
    let mut new_particles = Vec::<Particle>::with_capacity(n);
    let mut residual: Vec<f64> = vec![0.0; n];
    for (i, particle) in particles.iter().enumerate() {
        let expected = particle.weight / sum * n as f64;
        let copies = expected.floor() as usize;
        residual[i] = expected - copies as f64;
        for _ in 0..copies {
            if new_particles.len() == n {
                break;
            }
            let mut copy = *particle;
            copy.weight = uniform;
            new_particles.push(copy);
        }
    }
    let remaining = n - new_particles.len();
    if remaining > 0 {
        let sum_residual: f64 = residual.iter().sum();
        let residual_particles: Vec<Particle> = if sum_residual > 0.0 {
            particles
                .iter()
                .zip(residual.iter())
                .map(|(p, &r)| Particle { weight: r, ..*p })
                .collect()
        } else {
            particles.to_vec()
        };
        let cumsum = cumulative_weights(&residual_particles)?;
        let step = 1.0 / remaining as f64;
        let offset = rng.random::<f64>() * step;
        let positions: Vec<f64> = (0..remaining).map(|i| offset + i as f64 * step).collect();
        new_particles.extend(select_sorted(&residual_particles, &cumsum, &positions));
    }
    for particle in &mut new_particles {
        particle.weight = uniform;
    }
    Ok(new_particles)
}

/// The ordered set of particles approximating the pose posterior.
#[derive(Clone, Default, PartialEq)]
pub struct ParticleCloud {
    particles: Vec<Particle>,
}
impl Debug for ParticleCloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        let mut s = f.debug_struct("ParticleCloud");
        s.field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            );
        if let Some(mean) = self.estimate(ParticleAveragingStrategy::WeightedAverage) {
            s.field("mean_pose", &format_args!("{}", mean));
        }
        s.finish()
    }
}
impl ParticleCloud {
    pub fn from_particles(particles: Vec<Particle>) -> Self {
        ParticleCloud { particles }
    }
    /// Scatter `n` particles around `seed` with independent Gaussian perturbations on each axis.
    /// All weights start at `1/n`.
    pub fn scatter<R: Rng + ?Sized>(
        seed: &Pose2D,
        n: usize,
        x_std: f64,
        y_std: f64,
        theta_std: f64,
        rng: &mut R,
    ) -> Result<Self, LocalizerError> {
        if n == 0 {
            return Err(LocalizerError::InvalidConfig(
                "particle count must be positive".into(),
            ));
        }
        let normal = |mean: f64, std: f64, axis: &str| {
            Normal::new(mean, std).map_err(|e| {
                LocalizerError::InvalidConfig(format!("{axis} scatter std {std}: {e}"))
            })
        };
        let x_dist = normal(seed.x, x_std, "x")?;
        let y_dist = normal(seed.y, y_std, "y")?;
        let theta_dist = normal(seed.theta, theta_std, "theta")?;
        let weight = 1.0 / n as f64;
        let particles = (0..n)
            .map(|_| {
                Particle::new(
                    x_dist.sample(rng),
                    y_dist.sample(rng),
                    theta_dist.sample(rng),
                    weight,
                )
            })
            .collect();
        debug!("scattered {n} particles around {seed}");
        Ok(ParticleCloud { particles })
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }
    /// Make the weights a valid probability distribution. Non-finite or negative weights count as
    /// zero; if nothing is left the cloud falls back to exactly uniform weights.
    pub fn normalize_weights(&mut self) -> WeightNormalization {
        for particle in &mut self.particles {
            if !particle.weight.is_finite() || particle.weight < 0.0 {
                particle.weight = 0.0;
            }
        }
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
            WeightNormalization::Normalized { sum }
        } else {
            let uniform = 1.0 / self.particles.len() as f64;
            for particle in &mut self.particles {
                particle.weight = uniform;
            }
            WeightNormalization::UniformFallback { sum }
        }
    }
    /// Replace the cloud by a resampled generation. On degenerate weights the cloud is retained
    /// and the error is returned.
    pub fn resample<R: Rng + ?Sized>(
        &mut self,
        strategy: ParticleResamplingStrategy,
        rng: &mut R,
    ) -> Result<(), LocalizerError> {
        self.particles = strategy.resample(&self.particles, rng)?;
        Ok(())
    }
    /// `1 / Σ w²` over the (normalized) weights.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
    /// Reduce the cloud to one pose. `None` only for an empty cloud.
    pub fn estimate(&self, strategy: ParticleAveragingStrategy) -> Option<Pose2D> {
        match strategy {
            ParticleAveragingStrategy::WeightedAverage => self.weighted_average(),
            ParticleAveragingStrategy::HighestWeight => self.highest_weight().map(|p| p.pose()),
        }
    }
    fn highest_weight(&self) -> Option<&Particle> {
        self.particles
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
    }
    /// Weights used for averaging: the stored weights if they form a usable distribution,
    /// uniform otherwise.
    fn averaging_weights(&self) -> Vec<f64> {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        let valid = self
            .particles
            .iter()
            .all(|p| p.weight.is_finite() && p.weight >= 0.0);
        if valid && sum > 0.0 && sum.is_finite() {
            self.particles.iter().map(|p| p.weight / sum).collect()
        } else {
            vec![1.0 / self.particles.len() as f64; self.particles.len()]
        }
    }
    fn weighted_average(&self) -> Option<Pose2D> {
        if self.particles.is_empty() {
            return None;
        }
        let weights = self.averaging_weights();
        let (x, y) = self
            .particles
            .iter()
            .zip(weights.iter())
            .fold((0.0, 0.0), |(x, y), (p, &w)| (x + w * p.x, y + w * p.y));
        let theta = circular_mean(
            self.particles
                .iter()
                .zip(weights.iter())
                .map(|(p, &w)| (p.theta, w)),
        )
        .or_else(|| self.highest_weight().map(|p| p.theta))?;
        Some(Pose2D::new(x, y, theta))
    }
    /// Weighted covariance of `(x, y, theta)` about `mean`, with heading residuals wrapped.
    pub fn covariance(&self, mean: &Pose2D) -> Matrix3<f64> {
        let weights = self.averaging_weights();
        let mut cov = Matrix3::<f64>::zeros();
        for (particle, &w) in self.particles.iter().zip(weights.iter()) {
            let diff = Vector3::new(
                particle.x - mean.x,
                particle.y - mean.y,
                wrap_to_pi(particle.theta - mean.theta),
            );
            cov += w * diff * diff.transpose();
        }
        cov
    }
    /// Unweighted variance of the particle positions (sum of the x and y variances).
    pub fn positional_variance(&self) -> f64 {
        let n = self.particles.len() as f64;
        if n == 0.0 {
            return 0.0;
        }
        let mean_x = self.particles.iter().map(|p| p.x).sum::<f64>() / n;
        let mean_y = self.particles.iter().map(|p| p.y).sum::<f64>() / n;
        self.particles
            .iter()
            .map(|p| (p.x - mean_x).powi(2) + (p.y - mean_y).powi(2))
            .sum::<f64>()
            / n
    }
}
impl<'a> IntoIterator for &'a ParticleCloud {
    type Item = &'a Particle;
    type IntoIter = std::slice::Iter<'a, Particle>;
    fn into_iter(self) -> Self::IntoIter {
        self.particles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::PI;

    const ALL_STRATEGIES: [ParticleResamplingStrategy; 4] = [
        ParticleResamplingStrategy::Systematic,
        ParticleResamplingStrategy::Stratified,
        ParticleResamplingStrategy::Multinomial,
        ParticleResamplingStrategy::Residual,
    ];

    fn cloud_with_weights(weights: &[f64]) -> ParticleCloud {
        ParticleCloud::from_particles(
            weights
                .iter()
                .enumerate()
                .map(|(i, &w)| Particle::new(i as f64, 0.0, 0.0, w))
                .collect(),
        )
    }

    #[test]
    fn test_normalize_weights_sums_to_one() {
        let mut cloud = cloud_with_weights(&[1.0, 2.0, 3.0, 4.0]);
        let result = cloud.normalize_weights();
        assert_eq!(result, WeightNormalization::Normalized { sum: 10.0 });
        assert_approx_eq!(cloud.weights().iter().sum::<f64>(), 1.0);
        assert_approx_eq!(cloud.particles()[3].weight, 0.4);
    }
    #[test]
    fn test_normalize_weights_zero_sum_falls_back_to_uniform() {
        let mut cloud = cloud_with_weights(&[0.0; 5]);
        assert!(cloud.normalize_weights().is_degenerate());
        for w in cloud.weights() {
            assert_eq!(w, 1.0 / 5.0);
        }
    }
    #[test]
    fn test_normalize_weights_non_finite_treated_as_zero() {
        let mut cloud = cloud_with_weights(&[f64::NAN, 1.0, f64::INFINITY, 3.0]);
        let result = cloud.normalize_weights();
        assert!(!result.is_degenerate());
        assert_eq!(cloud.particles()[0].weight, 0.0);
        assert_eq!(cloud.particles()[2].weight, 0.0);
        assert_approx_eq!(cloud.particles()[3].weight, 0.75);
    }
    #[test]
    fn test_resample_preserves_count() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights: Vec<f64> = (0..37).map(|i| (i % 5) as f64 + 0.5).collect();
        let cloud = cloud_with_weights(&weights);
        for strategy in ALL_STRATEGIES {
            let resampled = strategy.resample(cloud.particles(), &mut rng).unwrap();
            assert_eq!(resampled.len(), 37, "{strategy:?}");
            for p in &resampled {
                assert_approx_eq!(p.weight, 1.0 / 37.0);
            }
        }
    }
    #[test]
    fn test_resample_unnormalized_and_sparse_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let cloud = cloud_with_weights(&[0.0, 0.0, 250.0, 0.0, 0.0, 0.0]);
        for strategy in ALL_STRATEGIES {
            let resampled = strategy.resample(cloud.particles(), &mut rng).unwrap();
            assert_eq!(resampled.len(), 6);
            assert!(resampled.iter().all(|p| p.x == 2.0), "{strategy:?}");
        }
    }
    #[test]
    fn test_resample_dominant_particle_selected() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut weights = vec![1e-6; 10];
        weights[4] = 1.0;
        let cloud = cloud_with_weights(&weights);
        for strategy in ALL_STRATEGIES {
            let mut hits = 0usize;
            let mut draws = 0usize;
            while draws < 10_000 {
                let resampled = strategy.resample(cloud.particles(), &mut rng).unwrap();
                draws += resampled.len();
                hits += resampled.iter().filter(|p| p.x == 4.0).count();
            }
            let share = hits as f64 / draws as f64;
            assert!(share > 0.98, "{strategy:?} selected dominant particle {share}");
        }
    }
    #[test]
    fn test_resample_degenerate_weights_rejected() {
        let mut rng = StdRng::seed_from_u64(5);
        let zero = cloud_with_weights(&[0.0, 0.0, 0.0]);
        let nan = cloud_with_weights(&[1.0, f64::NAN, 1.0]);
        for strategy in ALL_STRATEGIES {
            assert!(matches!(
                strategy.resample(zero.particles(), &mut rng),
                Err(LocalizerError::DegenerateWeights { .. })
            ));
            assert!(strategy.resample(nan.particles(), &mut rng).is_err());
        }
        let mut cloud = zero.clone();
        assert!(
            cloud
                .resample(ParticleResamplingStrategy::Systematic, &mut rng)
                .is_err()
        );
        assert_eq!(cloud, zero);
    }
    #[test]
    fn test_resample_copies_are_independent() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut cloud = cloud_with_weights(&[0.0, 1.0]);
        cloud
            .resample(ParticleResamplingStrategy::Systematic, &mut rng)
            .unwrap();
        cloud.particles_mut()[0].x += 10.0;
        assert_eq!(cloud.particles()[1].x, 1.0);
        assert_eq!(cloud.particles()[0].x, 11.0);
    }
    #[test]
    fn test_scatter_statistics() {
        let mut rng = StdRng::seed_from_u64(42);
        let seed = Pose2D::new(2.0, -1.0, 0.5);
        let cloud = ParticleCloud::scatter(&seed, 5000, 0.1, 0.1, 0.05, &mut rng).unwrap();
        assert_eq!(cloud.len(), 5000);
        let mean = cloud.estimate(ParticleAveragingStrategy::WeightedAverage).unwrap();
        assert_approx_eq!(mean.x, 2.0, 0.01);
        assert_approx_eq!(mean.y, -1.0, 0.01);
        assert_approx_eq!(mean.theta, 0.5, 0.005);
        let cov = cloud.covariance(&mean);
        assert_approx_eq!(cov[(0, 0)].sqrt(), 0.1, 0.01);
        assert_approx_eq!(cov[(2, 2)].sqrt(), 0.05, 0.005);
        assert_approx_eq!(cloud.effective_sample_size(), 5000.0, 1e-6);
    }
    #[test]
    fn test_scatter_rejects_empty_and_bad_std() {
        let mut rng = StdRng::seed_from_u64(42);
        let seed = Pose2D::default();
        assert!(ParticleCloud::scatter(&seed, 0, 0.1, 0.1, 0.05, &mut rng).is_err());
        assert!(ParticleCloud::scatter(&seed, 10, -1.0, 0.1, 0.05, &mut rng).is_err());
    }
    #[test]
    fn test_estimate_circular_mean_near_seam() {
        let cloud = ParticleCloud::from_particles(vec![
            Particle::new(1.0, 0.0, PI - 0.01, 0.5),
            Particle::new(3.0, 2.0, -PI + 0.01, 0.5),
        ]);
        let pose = cloud.estimate(ParticleAveragingStrategy::WeightedAverage).unwrap();
        assert_approx_eq!(pose.x, 2.0);
        assert_approx_eq!(pose.y, 1.0);
        assert!(pose.theta.abs() > PI - 1e-6, "heading was {}", pose.theta);
    }
    #[test]
    fn test_estimate_highest_weight() {
        let cloud = cloud_with_weights(&[0.1, 0.6, 0.3]);
        let pose = cloud.estimate(ParticleAveragingStrategy::HighestWeight).unwrap();
        assert_eq!(pose.x, 1.0);
        assert!(ParticleCloud::default()
            .estimate(ParticleAveragingStrategy::WeightedAverage)
            .is_none());
    }
    #[test]
    fn test_estimate_with_degenerate_weights_uses_uniform() {
        let cloud = cloud_with_weights(&[0.0, 0.0, 0.0, 0.0]);
        let pose = cloud.estimate(ParticleAveragingStrategy::WeightedAverage).unwrap();
        assert_approx_eq!(pose.x, 1.5);
    }
}

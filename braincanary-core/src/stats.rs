use rand::Rng;
use serde::Serialize;
use thiserror::Error;

/// Cap on retained raw samples per (version, scorer) stream.
pub const RESERVOIR_CAPACITY: usize = 10_000;

pub type StatsResult<T> = std::result::Result<T, StatsError>;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("welch t-test requires at least 2 samples per side (baseline={baseline}, canary={canary})")]
    InsufficientSamples { baseline: usize, canary: usize },
}

/// Incremental moments over an unbounded score stream, with a bounded uniform
/// reservoir of raw samples.
///
/// Moments follow Welford's update and stay exact within floating point no
/// matter how many samples arrive. The reservoir keeps at most
/// [`RESERVOIR_CAPACITY`] values; once full, each new sample replaces a
/// uniformly chosen slot with probability capacity/n, so the retained set
/// remains a uniform sample of everything observed.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    reservoir: Vec<f64>,
}

/// Copyable moment summary handed out with score snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SampleSummary {
    pub mean: f64,
    pub std: f64,
    pub n: u64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);

        if self.reservoir.len() < RESERVOIR_CAPACITY {
            self.reservoir.push(value);
        } else {
            let slot = rand::thread_rng().gen_range(0..self.count as usize);
            if slot < RESERVOIR_CAPACITY {
                self.reservoir[slot] = value;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn samples(&self) -> &[f64] {
        &self.reservoir
    }

    pub fn summary(&self) -> SampleSummary {
        SampleSummary {
            mean: self.mean,
            std: self.std_dev(),
            n: self.count,
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
        self.reservoir.clear();
    }
}

/// Welch's unequal-variance two-sample t-test.
#[derive(Debug, Clone, Copy)]
pub struct WelchTTest {
    pub t: f64,
    pub df: f64,
    /// Two-sided p-value for "the means differ".
    pub p_two_sided: f64,
    /// `F_T(t; df)`: mass in favor of the canary mean exceeding the baseline
    /// mean. Near 0 when the canary is clearly worse, near 1 when clearly
    /// better, 0.5 when indistinguishable.
    pub p_one_sided: f64,
    pub mean_baseline: f64,
    pub mean_canary: f64,
    /// 95% confidence interval on `mean_canary - mean_baseline`.
    pub ci95: (f64, f64),
}

pub fn welch_t_test(baseline: &[f64], canary: &[f64]) -> StatsResult<WelchTTest> {
    let n1 = baseline.len();
    let n2 = canary.len();
    if n1 < 2 || n2 < 2 {
        return Err(StatsError::InsufficientSamples {
            baseline: n1,
            canary: n2,
        });
    }

    let mean1 = mean(baseline);
    let mean2 = mean(canary);
    let var1 = sample_variance(baseline, mean1);
    let var2 = sample_variance(canary, mean2);

    let se_squared = var1 / n1 as f64 + var2 / n2 as f64;
    let se = se_squared.sqrt();
    if se == 0.0 {
        // Both sides are constant: no evidence either way.
        return Ok(WelchTTest {
            t: 0.0,
            df: (n1 + n2 - 2) as f64,
            p_two_sided: 1.0,
            p_one_sided: 0.5,
            mean_baseline: mean1,
            mean_canary: mean2,
            ci95: (0.0, 0.0),
        });
    }

    let t = (mean2 - mean1) / se;
    // Welch-Satterthwaite degrees of freedom.
    let df = se_squared * se_squared
        / ((var1 / n1 as f64).powi(2) / (n1 - 1) as f64
            + (var2 / n2 as f64).powi(2) / (n2 - 1) as f64);

    let p_two_sided = 2.0 * student_t_cdf(-t.abs(), df);
    let p_one_sided = student_t_cdf(t, df);

    let margin = se * student_t_quantile(0.975, df);
    let difference = mean2 - mean1;

    Ok(WelchTTest {
        t,
        df,
        p_two_sided,
        p_one_sided,
        mean_baseline: mean1,
        mean_canary: mean2,
        ci95: (difference - margin, difference + margin),
    })
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    values
        .iter()
        .map(|value| (value - mean) * (value - mean))
        .sum::<f64>()
        / (values.len() - 1) as f64
}

/// CDF of Student's t-distribution via the regularized incomplete beta:
/// `F_T(t) = 1 - I_x(df/2, 1/2) / 2` for `t >= 0` with `x = df/(df + t^2)`.
pub fn student_t_cdf(t: f64, df: f64) -> f64 {
    let x = df / (df + t * t);
    let tail = 0.5 * regularized_incomplete_beta(df / 2.0, 0.5, x);
    if t >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Inverse CDF by bisection on [-50, 50]; plenty for confidence intervals.
pub fn student_t_quantile(p: f64, df: f64) -> f64 {
    let mut lo = -50.0f64;
    let mut hi = 50.0f64;
    for _ in 0..120 {
        let mid = 0.5 * (lo + hi);
        if student_t_cdf(mid, df) < p {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    // Use the symmetry so the continued fraction converges quickly.
    if x > (a + 1.0) / (a + b + 2.0) {
        return 1.0 - regularized_incomplete_beta(b, a, 1.0 - x);
    }
    let ln_beta = ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b);
    let front = (a * x.ln() + b * (1.0 - x).ln() - ln_beta).exp() / a;
    front * beta_continued_fraction(a, b, x)
}

/// Continued-fraction expansion of the incomplete beta, evaluated with the
/// modified Lentz method.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const TOLERANCE: f64 = 1e-11;
    const TINY: f64 = 1e-30;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=250 {
        let m = m as f64;
        let m2 = 2.0 * m;

        let even = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + even * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + even / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let odd = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + odd * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + odd / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < TOLERANCE {
            break;
        }
    }
    h
}

/// Lanczos approximation (g = 7) with reflection for z < 0.5.
fn ln_gamma(z: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_59,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_571_6e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if z < 0.5 {
        let pi = std::f64::consts::PI;
        (pi / (pi * z).sin()).ln() - ln_gamma(1.0 - z)
    } else {
        let z = z - 1.0;
        let mut sum = COEFFICIENTS[0];
        for (i, coefficient) in COEFFICIENTS.iter().enumerate().skip(1) {
            sum += coefficient / (z + i as f64);
        }
        let t = z + G + 0.5;
        0.5 * (2.0 * std::f64::consts::PI).ln() + (z + 0.5) * t.ln() - t + sum.ln()
    }
}

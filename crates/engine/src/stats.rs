//! Pluggable significance testing for variant comparisons.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Conversion counts for one arm of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmSample {
    pub participants: u64,
    pub conversions: u64,
}

impl ArmSample {
    pub fn rate(&self) -> Option<f64> {
        (self.participants > 0).then(|| self.conversions as f64 / self.participants as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignificanceOutcome {
    pub z_score: f64,
    pub p_value: f64,
    /// `1 - p_value`.
    pub confidence: f64,
}

impl SignificanceOutcome {
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

/// A named statistical method comparing a treatment arm with the control.
/// Returns `None` when the data does not support a conclusion. Minimum
/// sample sizes are enforced by the caller, not the method.
pub trait SignificanceTest: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, control: ArmSample, treatment: ArmSample) -> Option<SignificanceOutcome>;
}

/// Pooled two-proportion z-test, two-sided.
///
/// Assumes independent participants, a binary conversion outcome and arms
/// large enough for the normal approximation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TwoProportionZTest;

impl SignificanceTest for TwoProportionZTest {
    fn name(&self) -> &'static str {
        "two_proportion_z_test"
    }

    fn compare(&self, control: ArmSample, treatment: ArmSample) -> Option<SignificanceOutcome> {
        let p1 = control.rate()?;
        let p2 = treatment.rate()?;
        let n1 = control.participants as f64;
        let n2 = treatment.participants as f64;
        let pooled = (control.conversions + treatment.conversions) as f64 / (n1 + n2);
        let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
        if se == 0.0 || !se.is_finite() {
            return None;
        }
        let z = (p2 - p1) / se;
        let normal = Normal::new(0.0, 1.0).ok()?;
        let p_value = (2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0);
        Some(SignificanceOutcome {
            z_score: z,
            p_value,
            confidence: 1.0 - p_value,
        })
    }
}

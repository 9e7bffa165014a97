use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Link between the linear predictor and the mean of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    Logit,
    Identity,
}

impl LinkFunction {
    #[inline]
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Identity => eta,
            LinkFunction::Logit => {
                if eta >= 0.0 {
                    1.0 / (1.0 + (-eta).exp())
                } else {
                    let z = eta.exp();
                    z / (1.0 + z)
                }
            }
        }
    }
}

/// Response distribution as named in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    #[default]
    Normal,
    Binomial,
}

impl Distribution {
    pub fn canonical_link(self) -> LinkFunction {
        match self {
            Distribution::Normal => LinkFunction::Identity,
            Distribution::Binomial => LinkFunction::Logit,
        }
    }
}

/// Engine-level likelihood selector used by the fitting routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LikelihoodFamily {
    GaussianIdentity,
    BinomialLogit,
}

impl LikelihoodFamily {
    /// Resolves a distribution/link pair. Only canonical links are supported.
    pub fn resolve(
        distribution: Distribution,
        link: Option<LinkFunction>,
    ) -> Result<Self, &'static str> {
        match (distribution, link.unwrap_or(distribution.canonical_link())) {
            (Distribution::Normal, LinkFunction::Identity) => Ok(LikelihoodFamily::GaussianIdentity),
            (Distribution::Binomial, LinkFunction::Logit) => Ok(LikelihoodFamily::BinomialLogit),
            (Distribution::Normal, LinkFunction::Logit) => {
                Err("the normal distribution only supports the identity link")
            }
            (Distribution::Binomial, LinkFunction::Identity) => {
                Err("the binomial distribution only supports the logit link")
            }
        }
    }

    pub fn link(self) -> LinkFunction {
        match self {
            LikelihoodFamily::GaussianIdentity => LinkFunction::Identity,
            LikelihoodFamily::BinomialLogit => LinkFunction::Logit,
        }
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficients(pub Array1<f64>);

impl Coefficients {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPredictor(pub Array1<f64>);

impl LinearPredictor {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn mean(&self, link: LinkFunction) -> Array1<f64> {
        self.0.mapv(|eta| link.inverse(eta))
    }
}

impl Deref for LinearPredictor {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn canonical_links_resolve() {
        assert_eq!(
            LikelihoodFamily::resolve(Distribution::Normal, None).unwrap(),
            LikelihoodFamily::GaussianIdentity
        );
        assert_eq!(
            LikelihoodFamily::resolve(Distribution::Binomial, Some(LinkFunction::Logit)).unwrap(),
            LikelihoodFamily::BinomialLogit
        );
        assert!(LikelihoodFamily::resolve(Distribution::Normal, Some(LinkFunction::Logit)).is_err());
    }

    #[test]
    fn logit_inverse_is_stable_at_extremes() {
        assert_abs_diff_eq!(LinkFunction::Logit.inverse(0.0), 0.5, epsilon = 1e-15);
        assert!(LinkFunction::Logit.inverse(800.0) <= 1.0);
        assert!(LinkFunction::Logit.inverse(-800.0) >= 0.0);
        assert!(LinkFunction::Logit.inverse(-800.0).is_finite());
    }
}

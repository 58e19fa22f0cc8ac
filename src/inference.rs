//! Inference Simulator
//!
//! Worker-side policy that turns repeated probabilistic samples into a single
//! labeled result:
//! - draw `N` independent samples from the fixed label set
//! - pick the plurality label; ties go to the label seen first in the sequence
//! - confidence = 100 * votes_for_winner / N, rounded to two decimals

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;

/// Samples drawn per classification
pub const DEFAULT_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Healthy,
    #[serde(rename = "Possible-Disease")]
    PossibleDisease,
    Diseased,
}

impl Label {
    pub const ALL: [Label; 3] = [Label::Healthy, Label::PossibleDisease, Label::Diseased];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Healthy => "Healthy",
            Label::PossibleDisease => "Possible-Disease",
            Label::Diseased => "Diseased",
        }
    }

    /// Draw one label uniformly at random
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a plurality vote
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub label: Label,
    pub votes: usize,
    pub confidence: f64,
    pub samples: Vec<Label>,
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Plurality over `samples`; `None` for an empty sequence
pub fn plurality(samples: &[Label]) -> Option<Vote> {
    // (label, votes) in order of first occurrence
    let mut tally: Vec<(Label, usize)> = Vec::with_capacity(Label::ALL.len());
    for label in samples {
        match tally.iter_mut().find(|(l, _)| l == label) {
            Some(entry) => entry.1 += 1,
            None => tally.push((*label, 1)),
        }
    }

    // a strict `>` keeps the earliest label on ties
    let mut winner: Option<(Label, usize)> = None;
    for (label, votes) in &tally {
        match winner {
            Some((_, best)) if *votes <= best => {}
            _ => winner = Some((*label, *votes)),
        }
    }

    winner.map(|(label, votes)| Vote {
        label,
        votes,
        confidence: round2(100.0 * votes as f64 / samples.len() as f64),
        samples: samples.to_vec(),
    })
}

/// Sampling policy a worker follows for one image
#[derive(Debug, Clone)]
pub struct Simulator {
    samples: usize,
    sample_delay: Duration,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLES, Duration::from_secs(1))
    }
}

impl Simulator {
    pub fn new(samples: usize, sample_delay: Duration) -> Self {
        Self {
            samples: samples.max(1),
            sample_delay,
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Draw all samples synchronously from `rng` and vote
    pub fn classify_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Vote {
        let samples: Vec<Label> = (0..self.samples).map(|_| Label::sample(rng)).collect();
        // samples is never empty
        plurality(&samples).unwrap_or(Vote {
            label: Label::Healthy,
            votes: 0,
            confidence: 0.0,
            samples,
        })
    }

    /// Draw samples with the configured per-sample processing delay
    pub async fn classify(&self) -> Vote {
        let mut samples = Vec::with_capacity(self.samples);
        for _ in 0..self.samples {
            if !self.sample_delay.is_zero() {
                sleep(self.sample_delay).await;
            }
            samples.push(Label::sample(&mut rand::rng()));
        }
        plurality(&samples).unwrap_or(Vote {
            label: Label::Healthy,
            votes: 0,
            confidence: 0.0,
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use Label::*;

    #[test]
    fn test_tie_goes_to_earliest_label() {
        let vote = plurality(&[Healthy, Diseased, Healthy, Diseased, PossibleDisease]).unwrap();
        assert_eq!(vote.label, Healthy);
        assert_eq!(vote.votes, 2);
        assert_eq!(vote.confidence, 40.00);
    }

    #[test]
    fn test_tie_order_follows_sequence_not_label_order() {
        let vote = plurality(&[Diseased, Healthy, Healthy, Diseased]).unwrap();
        assert_eq!(vote.label, Diseased);
        assert_eq!(vote.confidence, 50.00);
    }

    #[test]
    fn test_confidence_formula() {
        let vote = plurality(&[Diseased, Diseased, Healthy, Diseased, Diseased]).unwrap();
        assert_eq!(vote.label, Diseased);
        assert_eq!(vote.confidence, 80.00);
    }

    #[test]
    fn test_all_distinct_picks_first() {
        let vote = plurality(&[PossibleDisease, Healthy, Diseased]).unwrap();
        assert_eq!(vote.label, PossibleDisease);
        assert_eq!(vote.confidence, 33.33);
    }

    #[test]
    fn test_empty_sequence() {
        assert!(plurality(&[]).is_none());
    }

    #[test]
    fn test_deterministic_for_fixed_sequence() {
        let samples = [Healthy, PossibleDisease, PossibleDisease, Healthy, Diseased];
        let first = plurality(&samples).unwrap();
        for _ in 0..10 {
            assert_eq!(plurality(&samples).unwrap(), first);
        }
    }

    #[test]
    fn test_seeded_simulator_is_reproducible() {
        let simulator = Simulator::new(5, Duration::ZERO);
        let a = simulator.classify_with(&mut StdRng::seed_from_u64(7));
        let b = simulator.classify_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.samples.len(), 5);
        // five samples over three labels always repeat one
        assert!(a.votes >= 2);
    }

    #[test]
    fn test_label_wire_names() {
        assert_eq!(serde_json::to_string(&PossibleDisease).unwrap(), "\"Possible-Disease\"");
        let label: Label = serde_json::from_str("\"Healthy\"").unwrap();
        assert_eq!(label, Healthy);
    }

    #[tokio::test]
    async fn test_async_classify_without_delay() {
        let vote = Simulator::new(3, Duration::ZERO).classify().await;
        assert_eq!(vote.samples.len(), 3);
        assert!(vote.confidence >= 33.33 && vote.confidence <= 100.0);
    }
}

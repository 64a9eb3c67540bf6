use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};
use crate::nodes::TestDataNode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalRounds {
    /// Every k-th round, counting from 1.
    Every(u64),
    At(Vec<u64>),
}

/// Which test nodes score the global model, and after which rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationStrategy {
    pub test_data_nodes: Vec<TestDataNode>,
    pub rounds: EvalRounds,
}

impl EvaluationStrategy {
    pub fn new(test_data_nodes: Vec<TestDataNode>, rounds: EvalRounds) -> Result<Self> {
        match &rounds {
            EvalRounds::Every(0) => return Err(PlatformError::invalid("evaluation", "evaluation frequency must be at least 1")),
            EvalRounds::At(r) if r.contains(&0) => return Err(PlatformError::invalid("evaluation", "rounds are numbered from 1")),
            _ => {}
        }
        Ok(Self { test_data_nodes, rounds })
    }

    pub fn every_round(test_data_nodes: Vec<TestDataNode>) -> Self {
        Self { test_data_nodes, rounds: EvalRounds::Every(1) }
    }

    pub fn should_evaluate(&self, round: u64) -> bool {
        match &self.rounds {
            EvalRounds::Every(k) => *k > 0 && round > 0 && round % k == 0,
            EvalRounds::At(rounds) => rounds.contains(&round),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_and_explicit_rounds() {
        let every2 = EvaluationStrategy::new(vec![], EvalRounds::Every(2)).unwrap();
        assert_eq!((1..=5).filter(|r| every2.should_evaluate(*r)).collect::<Vec<_>>(), vec![2, 4]);
        let at = EvaluationStrategy::new(vec![], EvalRounds::At(vec![1, 3])).unwrap();
        assert!(at.should_evaluate(3) && !at.should_evaluate(2));
        assert!(EvaluationStrategy::every_round(vec![]).should_evaluate(1));
    }

    #[test]
    fn zero_rejected() {
        assert!(EvaluationStrategy::new(vec![], EvalRounds::Every(0)).is_err());
        assert!(EvaluationStrategy::new(vec![], EvalRounds::At(vec![0])).is_err());
    }
}

//! Draft tokens from repeated n-grams in the sequence itself.
//!
//! The longest suffix (between `min_n` and `max_n` tokens) that also occurs
//! earlier in the sequence is located; the tokens that followed its earliest
//! occurrence are proposed. Pure host-side work, no model call.

use super::DraftProposer;

#[derive(Debug, Clone)]
pub struct NGramConfig {
    /// Shortest suffix worth matching (inclusive).
    pub min_n: usize,
    /// Longest suffix tried (inclusive).
    pub max_n: usize,
    /// Upper bound on proposed tokens per step.
    pub num_speculative_tokens: usize,
}

impl Default for NGramConfig {
    fn default() -> Self {
        Self {
            min_n: 1,
            max_n: 5,
            num_speculative_tokens: 5,
        }
    }
}

#[derive(Debug, Default)]
pub struct NGramProposer {
    config: NGramConfig,
}

impl NGramProposer {
    pub fn new(config: NGramConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NGramConfig {
        &self.config
    }
}

impl DraftProposer for NGramProposer {
    fn propose(&mut self, tokens: &[u32], max_tokens: usize) -> Vec<u32> {
        let k = max_tokens.min(self.config.num_speculative_tokens);
        match_suffix(tokens, self.config.min_n.max(1), self.config.max_n, k)
    }

    fn name(&self) -> &str {
        "ngram"
    }
}

/// Up to `k` tokens following the earliest earlier occurrence of the
/// longest matching suffix.
fn match_suffix(tokens: &[u32], min_n: usize, max_n: usize, k: usize) -> Vec<u32> {
    let total = tokens.len();
    if k == 0 || total < min_n + 1 {
        return Vec::new();
    }
    let longest = max_n.min(total - 1);
    for n in (min_n..=longest).rev() {
        let suffix = &tokens[total - n..];
        // Occurrences may overlap the suffix but must start before it.
        if let Some(start) = (0..total - n).find(|&j| &tokens[j..j + n] == suffix) {
            let from = start + n;
            let take = k.min(total - from);
            return tokens[from..from + take].to_vec();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposes_what_followed_the_suffix() {
        let tokens = [1, 2, 3, 4, 1, 2, 3];
        assert_eq!(match_suffix(&tokens, 2, 2, 3), vec![4, 1, 2]);
        assert_eq!(match_suffix(&tokens, 2, 2, 1), vec![4]);
    }

    #[test]
    fn longest_suffix_wins() {
        // [1, 2, 3, 4] recurs; the shorter [3, 4] first occurs earlier.
        let tokens = [3, 4, 9, 1, 2, 3, 4, 7, 1, 2, 3, 4];
        assert_eq!(match_suffix(&tokens, 2, 4, 2), vec![7, 1]);
        assert_eq!(match_suffix(&tokens, 2, 2, 2), vec![9, 1]);
    }

    #[test]
    fn earliest_occurrence_wins() {
        let tokens = [5, 6, 100, 5, 6, 200, 5, 6];
        assert_eq!(match_suffix(&tokens, 2, 2, 1), vec![100]);
    }

    #[test]
    fn no_repeat_means_no_proposal() {
        assert!(match_suffix(&[1, 2, 3, 4, 5], 1, 3, 4).is_empty());
        assert!(match_suffix(&[], 1, 3, 4).is_empty());
        assert!(match_suffix(&[1, 2, 1, 2], 2, 2, 0).is_empty());
    }

    #[test]
    fn overlapping_runs_match() {
        assert_eq!(match_suffix(&[5, 5, 5, 5], 1, 1, 2), vec![5, 5]);
        assert_eq!(match_suffix(&[7, 7], 1, 3, 5), vec![7]);
    }

    #[test]
    fn proposer_caps_by_config_and_request() {
        let mut proposer = NGramProposer::new(NGramConfig {
            min_n: 1,
            max_n: 3,
            num_speculative_tokens: 2,
        });
        let tokens = [1, 2, 3, 4, 5, 1, 2, 3];
        assert_eq!(proposer.propose(&tokens, 10), vec![4, 5]);
        assert_eq!(proposer.propose(&tokens, 1), vec![4]);
        assert_eq!(proposer.name(), "ngram");
    }
}

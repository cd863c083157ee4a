//! Consensus text and agreement scoring across OCR passes.
//!
//! The consensus text is built by per-character positional voting: all pass
//! outputs are aligned by raw character index, and the most frequent
//! character at each index wins. There is no gap insertion and no
//! edit-distance alignment, so outputs that drift in length corrupt the
//! vote past the point of divergence. That weakness is part of the
//! documented contract, not something to silently fix here.
//!
//! The confidence score is the mean pairwise normalized similarity of the
//! pass outputs, scaled to 0–100. For `k` passes this is `k·(k-1)/2`
//! comparisons, each quadratic in the text length, which is why the pass
//! count is capped at [`crate::verify::MAX_PASSES`].

use strsim::normalized_levenshtein;

/// The reconciled output of one page's OCR passes.
#[derive(Clone, Debug, PartialEq)]
pub struct Consensus {
    /// The consensus text.
    pub text: String,

    /// Agreement between the passes, 0–100. This measures how much the
    /// passes agreed with each other, not ground-truth accuracy.
    pub confidence: f64,
}

/// Reconcile the raw outputs of a page's completed passes.
///
/// With no inputs (every pass failed) the consensus is empty text with
/// confidence 0. With one input there is nothing to compare, so the text is
/// returned unchanged with confidence 100.
pub fn reconcile(texts: &[String]) -> Consensus {
    match texts {
        [] => Consensus {
            text: String::new(),
            confidence: 0.0,
        },
        [text] => Consensus {
            text: text.clone(),
            confidence: 100.0,
        },
        _ => Consensus {
            text: consensus_text(texts),
            confidence: agreement_score(texts),
        },
    }
}

/// Build the consensus text by positional character voting.
///
/// The output length always equals the length (in characters) of the longest
/// input: positions past the end of a shorter input simply contribute no
/// vote. Ties are broken in favor of the character seen first at that
/// position.
pub fn consensus_text(texts: &[String]) -> String {
    let chars: Vec<Vec<char>> = texts.iter().map(|t| t.chars().collect()).collect();
    let max_len = chars.iter().map(Vec::len).max().unwrap_or(0);

    let mut consensus = String::with_capacity(max_len);
    for i in 0..max_len {
        // Candidate counts, in first-encountered order.
        let mut candidates: Vec<(char, usize)> = vec![];
        for text in &chars {
            if let Some(&c) = text.get(i) {
                match candidates.iter_mut().find(|(candidate, _)| *candidate == c) {
                    Some((_, count)) => *count += 1,
                    None => candidates.push((c, 1)),
                }
            }
        }

        let mut winner = None;
        let mut winner_count = 0;
        for &(candidate, count) in &candidates {
            // Strict comparison keeps the first-encountered candidate on ties.
            if count > winner_count {
                winner = Some(candidate);
                winner_count = count;
            }
        }
        if let Some(winner) = winner {
            consensus.push(winner);
        }
    }
    consensus
}

/// Score agreement between pass outputs as the mean pairwise normalized
/// similarity, scaled to 0–100.
pub fn agreement_score(texts: &[String]) -> f64 {
    if texts.len() <= 1 {
        return 100.0;
    }

    let mut similarities = vec![];
    for i in 0..texts.len() {
        for j in (i + 1)..texts.len() {
            similarities.push(normalized_levenshtein(&texts[i], &texts[j]) * 100.0);
        }
    }
    similarities.iter().sum::<f64>() / similarities.len() as f64
}

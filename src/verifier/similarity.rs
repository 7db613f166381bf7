//! Similarity scoring strategies.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, EmbeddingProvider, LlmProvider};

/// Scores how similar two replies are.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score(&self, previous: &str, candidate: &str) -> Result<f64, LlmError>;
}

/// Cosine similarity in [-1, 1]. A zero vector scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, String> {
    if a.len() != b.len() {
        return Err(format!("embedding length mismatch: {} vs {}", a.len(), b.len()));
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

/// Cosine similarity of provider embeddings.
pub struct EmbeddingScorer {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingScorer {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl SimilarityScorer for EmbeddingScorer {
    fn name(&self) -> &'static str {
        "embedding"
    }

    async fn score(&self, previous: &str, candidate: &str) -> Result<f64, LlmError> {
        let (a, b) = futures::future::try_join(
            self.embedder.embed(previous),
            self.embedder.embed(candidate),
        )
        .await?;
        cosine_similarity(&a, &b).map_err(|reason| LlmError::InvalidResponse {
            provider: self.embedder.model_name().to_string(),
            reason,
        })
    }
}

const JUDGE_PROMPT: &str = "Rate how similar the two texts below are. Reply with a single number \
between 0 and 1 with two decimal places, where 0 means completely different and 1 means identical. \
Reply with the number only.

Criteria:
1. Judge semantic similarity, not only wording.
2. Consider whether the core meaning is the same.
3. Texts expressing the same emotion or attitude count as highly similar.

If you understand, reply \"Resolve OK\". The two texts will follow, labelled 'A:' and 'B:'.";

/// Asks a chat model to rate similarity.
pub struct LlmJudgeScorer {
    judge: Arc<dyn LlmProvider>,
}

impl LlmJudgeScorer {
    pub fn new(judge: Arc<dyn LlmProvider>) -> Self {
        Self { judge }
    }

    fn request(previous: &str, candidate: &str) -> CompletionRequest {
        CompletionRequest::new(vec![
            ChatMessage::system(JUDGE_PROMPT),
            ChatMessage::assistant("Resolve OK"),
            ChatMessage::user(format!("A: {previous}\nB: {candidate}")),
        ])
        .with_temperature(0.0)
        .with_max_tokens(16)
    }
}

#[async_trait]
impl SimilarityScorer for LlmJudgeScorer {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn score(&self, previous: &str, candidate: &str) -> Result<f64, LlmError> {
        let response = self.judge.complete(Self::request(previous, candidate)).await?;
        Ok(extract_similarity_score(&response.content))
    }
}

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(\.\d+)?").expect("valid number pattern"));

/// First decimal number in the text, clamped to [0, 1]. Defaults to 0.
pub fn extract_similarity_score(text: &str) -> f64 {
    NUMBER
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|score| score.clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_is_symmetric_and_bounded() {
        let a = [0.3f32, -1.2, 4.0, 0.0];
        let b = [2.0f32, 0.5, -0.7, 9.1];
        let ab = cosine_similarity(&a, &b).unwrap();
        let ba = cosine_similarity(&b, &a).unwrap();
        assert!((ab - ba).abs() < 1e-12);
        assert!((-1.0..=1.0).contains(&ab));
    }

    #[test]
    fn cosine_edge_cases() {
        let v = [1.5f32, 2.5, -3.0];
        assert!((cosine_similarity(&v, &v).unwrap() - 1.0).abs() < 1e-9);
        let neg: Vec<f32> = v.iter().map(|x| -x).collect();
        assert!((cosine_similarity(&v, &neg).unwrap() + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]).unwrap(), 0.0);
        assert!(cosine_similarity(&[1.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn score_extraction() {
        assert_eq!(extract_similarity_score("0.87"), 0.87);
        assert_eq!(extract_similarity_score("Similarity: 0.42 overall"), 0.42);
        assert_eq!(extract_similarity_score("5"), 1.0);
        assert_eq!(extract_similarity_score("no idea"), 0.0);
    }

    #[test]
    fn judge_request_primes_assistant_turn() {
        let req = LlmJudgeScorer::request("old", "new");
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[1].content, "Resolve OK");
        assert_eq!(req.messages[2].content, "A: old\nB: new");
    }
}

//! LLM listwise reranker.
//!
//! Sends the query and numbered passages to a chat-completions model and
//! parses the returned index permutation. Scores are linear by rank in
//! `0..1`. Explicit opt-in only; callers go through the per-user sliding
//! window limiter first.

use std::time::Duration;

use crate::types::RerankError;

pub struct LlmListwiseReranker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl LlmListwiseReranker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RerankError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RerankError::Backend(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    fn prompt(query: &str, documents: &[String]) -> String {
        let mut prompt = format!(
            "Rank the following passages by relevance to the query.\n\
             Query: {query}\n\nPassages:\n"
        );
        for (i, doc) in documents.iter().enumerate() {
            let snippet: String = doc.chars().take(500).collect();
            prompt.push_str(&format!("[{i}] {snippet}\n"));
        }
        prompt.push_str(
            "\nRespond with only a JSON array of passage indices, most relevant first.",
        );
        prompt
    }

    /// Rank `documents`, returning one score per input document.
    pub async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": Self::prompt(query, documents)}],
            "temperature": 0,
        });
        let mut request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RerankError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RerankError::Backend(format!(
                "listwise reranker returned {}",
                response.status()
            )));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RerankError::MalformedResponse(e.to_string()))?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| RerankError::MalformedResponse("missing message content".into()))?;
        let permutation = parse_permutation(content, documents.len())?;
        Ok(scores_from_permutation(&permutation, documents.len()))
    }
}

/// Extract a JSON index array from the model output, tolerating surrounding
/// prose. Out-of-range and duplicate indices are rejected.
pub fn parse_permutation(content: &str, n: usize) -> Result<Vec<usize>, RerankError> {
    let start = content
        .find('[')
        .ok_or_else(|| RerankError::MalformedResponse("no JSON array in response".into()))?;
    let end = content[start..]
        .find(']')
        .map(|i| start + i + 1)
        .ok_or_else(|| RerankError::MalformedResponse("unterminated JSON array".into()))?;
    let indices: Vec<usize> = serde_json::from_str(&content[start..end])
        .map_err(|e| RerankError::MalformedResponse(e.to_string()))?;

    let mut seen = vec![false; n];
    for &index in &indices {
        if index >= n || seen[index] {
            return Err(RerankError::MalformedResponse(format!(
                "invalid permutation index {index}"
            )));
        }
        seen[index] = true;
    }
    Ok(indices)
}

/// Linear-by-rank scores: first-ranked gets 1.0, descending evenly.
/// Documents the model omitted score 0.
pub fn scores_from_permutation(permutation: &[usize], n: usize) -> Vec<f32> {
    let mut scores = vec![0.0f32; n];
    let total = permutation.len().max(1) as f32;
    for (rank, &index) in permutation.iter().enumerate() {
        scores[index] = (total - rank as f32) / total;
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_with_surrounding_prose() {
        let permutation = parse_permutation("Sure! The ranking is [2, 0, 1].", 3).unwrap();
        assert_eq!(permutation, vec![2, 0, 1]);
    }

    #[test]
    fn rejects_out_of_range_and_duplicates() {
        assert!(parse_permutation("[0, 3]", 3).is_err());
        assert!(parse_permutation("[1, 1]", 3).is_err());
        assert!(parse_permutation("no array here", 3).is_err());
    }

    #[test]
    fn scores_are_linear_by_rank() {
        let scores = scores_from_permutation(&[2, 0, 1], 3);
        assert_eq!(scores[2], 1.0);
        assert!((scores[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((scores[1] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn omitted_documents_score_zero() {
        let scores = scores_from_permutation(&[1], 3);
        assert_eq!(scores[0], 0.0);
        assert_eq!(scores[1], 1.0);
        assert_eq!(scores[2], 0.0);
    }
}

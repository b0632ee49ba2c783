//! Deterministic embeddings and cosine-similarity matching for the semantic
//! cache fallback described in [`crate::CacheService`].
//!
//! There is no real embedding model here: the "embedding" is a 16-bucket
//! char-code histogram of a normalized string, used purely to catch
//! near-duplicate URLs (same page reachable under a slightly different path)
//! without a network call or a model dependency.

use url::Url;

use docsync_shared::CanonicalUrl;

const EMBEDDING_BUCKETS: usize = 16;

/// A lightweight stand-in for a cached document, carrying just enough to
/// embed and rank it: a title and its canonical URL. Real document content
/// is not needed for matching.
#[derive(Debug, Clone)]
pub struct SemanticCandidate {
    pub url: CanonicalUrl,
    pub title: String,
}

/// The default embedding provider: a deterministic, dependency-free
/// character-code histogram. Bucket `i` accumulates the ord-value of every
/// alphanumeric character whose position in the normalized string is `i`
/// modulo [`EMBEDDING_BUCKETS`], then the whole vector is L2-normalized.
pub fn default_embedding(text: &str) -> Vec<f64> {
    let normalized = text.to_lowercase();
    let normalized = normalized.trim();
    let normalized = if normalized.is_empty() { "unknown" } else { normalized };

    let mut vector = vec![0.0f64; EMBEDDING_BUCKETS];
    for (index, ch) in normalized.chars().enumerate() {
        if !ch.is_alphanumeric() {
            continue;
        }
        vector[index % EMBEDDING_BUCKETS] += ch as u32 as f64;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    let norm = if norm == 0.0 { 1.0 } else { norm };
    vector.into_iter().map(|v| v / norm).collect()
}

/// Reduce a URL to a semantic-friendly slug: path with `-`/`_` turned into
/// spaces, lowercased, with the fragment (if any) appended.
pub fn normalize_url_for_semantic(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_lowercase();
    };
    let mut slug = parsed.path().replace(['-', '_'], " ").trim().to_lowercase();
    if let Some(fragment) = parsed.fragment() {
        if !fragment.is_empty() {
            slug = format!("{slug} #{}", fragment.to_lowercase());
            slug = slug.trim().to_string();
        }
    }
    if slug.is_empty() { url.to_lowercase() } else { slug }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Ranks cached candidates against a query embedding, restricted to the
/// query's own host, above a similarity threshold.
pub struct SemanticCacheMatcher {
    similarity_threshold: f64,
    return_limit: usize,
}

impl SemanticCacheMatcher {
    pub fn new(similarity_threshold: f64, return_limit: usize) -> Self {
        Self { similarity_threshold, return_limit }
    }

    /// Returns the ranked matches above threshold (highest score first,
    /// capped at `limit` or the configured `return_limit`) and whether any
    /// of them was confident enough to treat as a cache hit.
    pub fn find_similar(
        &self,
        query_url: &str,
        query_embedding: &[f64],
        candidates: &[SemanticCandidate],
        embedding_provider: &(dyn Fn(&str) -> Vec<f64> + Send + Sync),
        limit: Option<usize>,
    ) -> (Vec<(f64, SemanticCandidate)>, bool) {
        let request_host = Url::parse(query_url).ok().and_then(|u| u.host_str().map(str::to_lowercase));

        let mut scored: Vec<(f64, SemanticCandidate)> = Vec::new();
        for candidate in candidates {
            let candidate_host = Url::parse(candidate.url.as_str()).ok().and_then(|u| u.host_str().map(str::to_lowercase));
            if let (Some(req), Some(cand)) = (&request_host, &candidate_host) {
                if req != cand {
                    continue;
                }
            }

            let payload = format!("{} {}", candidate.title, normalize_url_for_semantic(candidate.url.as_str()));
            let candidate_vector = embedding_provider(&payload);
            let similarity = cosine_similarity(query_embedding, &candidate_vector);
            scored.push((similarity, candidate.clone()));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let max_results = limit.unwrap_or(self.return_limit);
        let mut matches = Vec::new();
        let mut confident = false;
        for (similarity, candidate) in scored.iter() {
            if matches.len() >= max_results {
                break;
            }
            if *similarity < self.similarity_threshold {
                continue;
            }
            confident = true;
            matches.push((*similarity, candidate.clone()));
        }

        if !confident {
            if let Some((top_similarity, top_candidate)) = scored.first() {
                tracing::info!(
                    requested_url = query_url,
                    candidate_url = top_candidate.url.as_str(),
                    score = top_similarity,
                    threshold = self.similarity_threshold,
                    "semantic cache candidate rejected"
                );
            }
        }

        (matches, confident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_similarity_one() {
        let a = default_embedding("getting started guide");
        let b = default_embedding("getting started guide");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_text_has_low_similarity() {
        let a = default_embedding("getting started guide");
        let b = default_embedding("zzz qqq xylophone");
        assert!(cosine_similarity(&a, &b) < 0.82);
    }

    #[test]
    fn find_similar_filters_by_host() {
        let matcher = SemanticCacheMatcher::new(0.5, 3);
        let candidates = vec![
            SemanticCandidate { url: CanonicalUrl::new_unchecked("https://docs.example.com/guide/"), title: "Guide".into() },
            SemanticCandidate { url: CanonicalUrl::new_unchecked("https://other.example.com/guide/"), title: "Guide".into() },
        ];
        let query_embedding = default_embedding("guide docs.example.com guide");
        let (matches, _) = matcher.find_similar(
            "https://docs.example.com/guide/",
            &query_embedding,
            &candidates,
            &default_embedding,
            None,
        );
        assert!(matches.iter().all(|(_, c)| c.url.as_str().contains("docs.example.com")));
    }

    #[test]
    fn normalize_url_appends_fragment() {
        let slug = normalize_url_for_semantic("https://docs.example.com/getting-started#install");
        assert_eq!(slug, "getting started #install");
    }
}

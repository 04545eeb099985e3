//! Lesson Manager (§4.3): embedding-based dedup and confidence-weighted
//! pruning of accumulated lessons.

use crate::history::Lesson;
use quoracle_llm::{LLMProvider, ModelSpec};
use std::sync::Arc;

pub const DEFAULT_MAX_LESSONS: usize = 100;
pub const DEFAULT_SIM_THRESHOLD: f32 = 0.90;

/// LRU-cached embedding lookups, shared by one owning actor (§5: "The
/// embedding cache is an LRU owned by a single actor to serialize writes").
pub struct EmbeddingCache {
    cache: moka::future::Cache<String, Arc<Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: moka::future::Cache::new(capacity),
        }
    }

    async fn embed(
        &self,
        provider: &dyn LLMProvider,
        model: &ModelSpec,
        text: &str,
    ) -> Option<Arc<Vec<f32>>> {
        if let Some(hit) = self.cache.get(text).await {
            return Some(hit);
        }
        let vector = provider.embed(text, model).await.ok()?;
        let vector = Arc::new(vector);
        self.cache.insert(text.to_string(), vector.clone()).await;
        Some(vector)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Accumulate `new_lessons` into `existing_lessons` per §4.3: embed each new
/// lesson, merge into the closest existing lesson above `sim_threshold`
/// (bumping its confidence and replacing its content), otherwise append at
/// confidence 1. Prunes to `max` by confidence when over budget. A failed
/// embedding call degrades that single comparison to "no match" and never
/// blocks accumulation.
pub async fn accumulate(
    provider: &dyn LLMProvider,
    embedding_model: &ModelSpec,
    cache: &EmbeddingCache,
    mut existing_lessons: Vec<Lesson>,
    new_lessons: Vec<Lesson>,
    max: usize,
    sim_threshold: f32,
) -> Vec<Lesson> {
    for new_lesson in new_lessons {
        let new_embedding = cache.embed(provider, embedding_model, &new_lesson.content).await;

        let mut best: Option<(usize, f32)> = None;
        if let Some(new_vec) = new_embedding.as_deref() {
            for (idx, existing) in existing_lessons.iter().enumerate() {
                let Some(existing_vec) = cache.embed(provider, embedding_model, &existing.content).await
                else {
                    continue; // embedding failure: skip this comparison, never block
                };
                let sim = cosine_similarity(new_vec, &existing_vec);
                if sim >= sim_threshold && best.map(|(_, s)| sim > s).unwrap_or(true) {
                    best = Some((idx, sim));
                }
            }
        }

        match best {
            Some((idx, _)) => {
                let existing = &mut existing_lessons[idx];
                existing.content = new_lesson.content;
                existing.confidence += 1;
            }
            None => existing_lessons.push(new_lesson),
        }
    }

    if existing_lessons.len() > max {
        // Stable sort descending by confidence: ties keep first-seen order.
        existing_lessons.sort_by(|a, b| b.confidence.cmp(&a.confidence));
        existing_lessons.truncate(max);
    }

    existing_lessons
}

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::ai::{Embedder, GeneratorError};
use crate::store::TermStore;

/// Queries embedded per request in [`Retriever::search_many`].
const QUERY_BATCH: usize = 64;

/// Read-only view over a [`TermStore`]; cheap to share between workers.
#[derive(Clone)]
pub struct Retriever {
    store: Arc<TermStore>,
    embedder: Arc<dyn Embedder>,
    relevance_floor: f32,
}

impl Retriever {
    pub fn new(store: Arc<TermStore>, embedder: Arc<dyn Embedder>, relevance_floor: f32) -> Self {
        Self {
            store,
            embedder,
            relevance_floor,
        }
    }

    /// Up to `k` stored contents, most similar first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<String>, GeneratorError> {
        let query = query.trim();
        if query.is_empty() || k == 0 || self.store.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors
            .first()
            .ok_or_else(|| GeneratorError::InvalidResponse("no embedding returned".into()))?;
        Ok(self.lookup(vector, k))
    }

    /// Deduplicated union of the top-`k` results of every query.
    pub async fn search_many<I, S>(&self, queries: I, k: usize) -> Result<BTreeSet<String>, GeneratorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: BTreeSet<String> = BTreeSet::new();
        for query in queries {
            let query = query.as_ref().trim();
            if !query.is_empty() {
                unique.insert(query.to_string());
            }
        }

        let mut context = BTreeSet::new();
        if unique.is_empty() || k == 0 || self.store.is_empty() {
            return Ok(context);
        }

        let queries: Vec<String> = unique.into_iter().collect();
        for batch in queries.chunks(QUERY_BATCH) {
            let vectors = self.embedder.embed(batch).await?;
            if vectors.len() != batch.len() {
                return Err(GeneratorError::InvalidResponse(format!(
                    "expected {} query embeddings, received {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            for vector in &vectors {
                context.extend(self.lookup(vector, k));
            }
        }

        debug!(
            "retrieved {} reference entries for {} queries",
            context.len(),
            queries.len()
        );
        Ok(context)
    }

    fn lookup(&self, vector: &[f32], k: usize) -> Vec<String> {
        self.store
            .nearest(vector, k, self.relevance_floor)
            .into_iter()
            .map(|hit| hit.document.content.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HashingEmbedder;

    async fn retriever_with(pairs: &[(&str, &str)]) -> Retriever {
        let embedder = Arc::new(HashingEmbedder::default());
        let mut store = TermStore::new();
        store
            .rebuild(
                pairs.iter().map(|(s, t)| (s.to_string(), t.to_string())),
                embedder.as_ref(),
                16,
            )
            .await
            .unwrap();
        Retriever::new(Arc::new(store), embedder, 0.0)
    }

    #[tokio::test]
    async fn exact_value_recall() {
        let pairs = [
            ("Ender Pearl", "末影珍珠"),
            ("Iron Ingot", "铁锭"),
            ("Redstone Dust", "红石粉"),
        ];
        let retriever = retriever_with(&pairs).await;

        for (source, target) in pairs {
            let hits = retriever.search(source, 1).await.unwrap();
            assert_eq!(hits, vec![format!("{source}={target}")]);
        }
    }

    #[tokio::test]
    async fn empty_store_or_query_returns_nothing() {
        let retriever = retriever_with(&[]).await;
        assert!(retriever.search("Ender Pearl", 3).await.unwrap().is_empty());

        let retriever = retriever_with(&[("Stick", "木棍")]).await;
        assert!(retriever.search("   ", 3).await.unwrap().is_empty());
        assert!(retriever.search("Stick", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrelated_query_falls_below_floor() {
        let retriever = retriever_with(&[("Stick", "木棍")]).await;
        let hits = retriever.search("qwertyuiop", 3).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_many_unions_and_deduplicates() {
        let retriever = retriever_with(&[("Ender Pearl", "末影珍珠"), ("Iron Ingot", "铁锭")]).await;
        let context = retriever
            .search_many(["Ender Pearl", "A magical Ender Pearl.", "Iron Ingot", ""], 1)
            .await
            .unwrap();

        let expected: BTreeSet<String> = ["Ender Pearl=末影珍珠", "Iron Ingot=铁锭"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(context, expected);
    }
}

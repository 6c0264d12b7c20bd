use super::cache::{CacheEntry, EdgeCache};
use super::{dedupe_edges, KnowledgeEdge, SourceType};
use crate::config::ExtractionOptions;
use crate::oracle::{ImageRef, Oracle, OracleRequest, Purpose, SamplingParams};
use crate::parse;
use crate::prompts;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SUMMARY_MAX_LINES: usize = 12;
const SUMMARY_MAX_CHARS: usize = 800;

/// What the vision model saw in an image, plus edges extracted from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisualKnowledge {
    pub description: String,
    pub summary: String,
    /// Image-typed edges with local source ids (remap before merging).
    pub edges: Vec<KnowledgeEdge>,
}

struct Extraction {
    edges: Vec<KnowledgeEdge>,
    /// False when any oracle call failed; such results are not cached.
    complete: bool,
}

/// Builds and caches edge sets, keyed by content hash.
///
/// Lookups go to the in-process map first, then to the persisted
/// [`EdgeCache`]. Misses call the extraction oracle once per text chunk.
/// Extraction never fails: oracle errors and unreadable output give fewer
/// (possibly zero) edges.
pub struct FactGraphStore {
    oracle: Arc<dyn Oracle>,
    cache: Arc<dyn EdgeCache>,
    options: ExtractionOptions,
    vision_model: String,
    params: SamplingParams,
    edges: RwLock<HashMap<String, Arc<Vec<KnowledgeEdge>>>>,
    visuals: RwLock<HashMap<String, Arc<VisualKnowledge>>>,
}

impl FactGraphStore {
    pub fn new(oracle: Arc<dyn Oracle>, cache: Arc<dyn EdgeCache>, options: ExtractionOptions) -> Self {
        let params = SamplingParams::new(0.0, options.max_tokens);
        Self {
            oracle,
            cache,
            vision_model: options.model.clone(),
            options,
            params,
            edges: RwLock::new(HashMap::new()),
            visuals: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_vision_model(mut self, model: impl Into<String>) -> Self {
        self.vision_model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = temperature;
        self
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    /// Hex SHA-256 over kind, extraction settings, model and content.
    fn content_key(&self, kind: &str, model: &str, content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.options.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.options.chunk_words.to_le_bytes());
        hasher.update(self.options.max_chunks.to_le_bytes());
        hasher.update(content);
        format!("{:x}", hasher.finalize())
    }

    async fn persisted(&self, key: &str, model: &str) -> Option<CacheEntry> {
        match self.cache.get(key).await {
            Ok(Some(entry)) if entry.is_compatible(model) => Some(entry),
            Ok(Some(entry)) => {
                debug!(
                    key = &key[..12],
                    cached_model = %entry.source_model,
                    cached_version = entry.version,
                    "stale cache entry"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "fact cache read failed");
                None
            }
        }
    }

    async fn persist(&self, key: &str, entry: CacheEntry) {
        if let Err(e) = self.cache.put(key, entry).await {
            warn!(error = %e, "fact cache write failed");
        }
    }

    /// Edges extracted from a text source.
    pub async fn edges_for(&self, text: &str) -> Arc<Vec<KnowledgeEdge>> {
        let key = self.content_key("text", &self.options.model, text.as_bytes());

        if let Some(edges) = self.edges.read().await.get(&key) {
            debug!(key = &key[..12], "fact graph memory hit");
            return Arc::clone(edges);
        }

        if let Some(entry) = self.persisted(&key, &self.options.model).await {
            debug!(key = &key[..12], edges = entry.edges.len(), "fact graph cache hit");
            let edges = Arc::new(entry.edges);
            self.edges.write().await.insert(key, Arc::clone(&edges));
            return edges;
        }

        let extraction = self.extract(text, SourceType::Text).await;
        let edges = Arc::new(extraction.edges);
        info!(
            key = &key[..12],
            edges = edges.len(),
            complete = extraction.complete,
            "extracted text facts"
        );

        if extraction.complete {
            self.edges.write().await.insert(key.clone(), Arc::clone(&edges));
            self.persist(&key, CacheEntry::new(&self.options.model, edges.to_vec()))
                .await;
        }
        edges
    }

    /// Description, summary and image-typed edges for an image.
    pub async fn visual_knowledge(&self, image: &ImageRef) -> Arc<VisualKnowledge> {
        let key = self.content_key("image", &self.vision_model, image.digest().as_bytes());

        if let Some(known) = self.visuals.read().await.get(&key) {
            return Arc::clone(known);
        }

        if let Some(entry) = self.persisted(&key, &self.vision_model).await {
            if let Some(description) = entry.description {
                let summary = entry
                    .summary
                    .unwrap_or_else(|| summarize_description(&description));
                let known = Arc::new(VisualKnowledge {
                    description,
                    summary,
                    edges: entry.edges,
                });
                self.visuals.write().await.insert(key, Arc::clone(&known));
                return known;
            }
        }

        let request = OracleRequest::new(
            Purpose::VisualDescription,
            &self.vision_model,
            prompts::visual_description(),
        )
        .with_image(image)
        .with_params(self.params);

        let raw = match self.oracle.generate(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "image description failed");
                return Arc::new(VisualKnowledge::default());
            }
        };

        let (description, summary) = parse::parse_visual_description(&raw);
        let summary = summary.unwrap_or_else(|| summarize_description(&description));
        let extraction = self.extract(&description, SourceType::Image).await;
        info!(
            edges = extraction.edges.len(),
            complete = extraction.complete,
            "extracted visual facts"
        );

        let known = Arc::new(VisualKnowledge {
            description,
            summary,
            edges: extraction.edges,
        });
        if extraction.complete {
            self.visuals.write().await.insert(key.clone(), Arc::clone(&known));
            let entry = CacheEntry::new(&self.vision_model, known.edges.clone())
                .with_description(known.description.clone(), known.summary.clone());
            self.persist(&key, entry).await;
        }
        known
    }

    /// One extraction call per chunk; source ids are 1-based call indices.
    async fn extract(&self, text: &str, source_type: SourceType) -> Extraction {
        let chunks = chunk_text(text, self.options.chunk_words, self.options.max_chunks);
        let mut edges = Vec::new();
        let mut complete = true;

        for (i, chunk) in chunks.iter().enumerate() {
            let source_id = i as u32 + 1;
            let request = OracleRequest::new(
                Purpose::Extraction,
                &self.options.model,
                prompts::extraction(chunk, source_type),
            )
            .with_params(self.params);

            match self.oracle.generate(request).await {
                Ok(raw) => match parse::parse_edges(&raw, Some(source_id), source_type) {
                    Ok(found) => edges.extend(found),
                    Err(reason) => debug!(source_id, %reason, "unreadable extraction output"),
                },
                Err(e) => {
                    warn!(source_id, error = %e, "extraction call failed");
                    complete = false;
                }
            }
        }

        Extraction {
            edges: dedupe_edges(edges),
            complete,
        }
    }
}

/// Split text into paragraph groups of roughly `target_words` words.
///
/// Paragraphs are separated by blank lines and never split. At most
/// `max_chunks` chunks are returned.
pub fn chunk_text(text: &str, target_words: usize, max_chunks: usize) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    let mut buf: Vec<&str> = Vec::new();
    let mut buf_words = 0;

    for para in normalized.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let words = para.split_whitespace().count();
        if !buf.is_empty() && buf_words + words > target_words {
            chunks.push(buf.join("\n\n"));
            buf.clear();
            buf_words = 0;
        }
        buf.push(para);
        buf_words += words;
    }
    if !buf.is_empty() {
        chunks.push(buf.join("\n\n"));
    }

    chunks.truncate(max_chunks);
    chunks
}

/// First non-empty lines of a description, capped in length.
pub fn summarize_description(description: &str) -> String {
    let joined = description
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(SUMMARY_MAX_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    joined.chars().take(SUMMARY_MAX_CHARS).collect()
}

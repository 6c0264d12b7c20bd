//! Oracle abstraction over generation and verification models.
//!
//! Every model call in the engine is an [`OracleRequest`] sent through the
//! [`Oracle`] trait. The request names its [`Purpose`], so test doubles can
//! route scripted replies and logs can say what a call was for.
//!
//! ```text
//!   engine component ──► RetryingOracle ──► ClaudeOracle ──► Messages API
//!                         (attempts,        (image + text
//!                          timeout)          content blocks)
//! ```

mod anthropic;
mod retry;

pub use self::anthropic::ClaudeOracle;
pub use self::retry::RetryingOracle;

use crate::error::OracleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Solver capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverTier {
    Medium,
    Strong,
}

/// What a solver is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeVariant {
    /// Question plus image.
    WithImage,
    /// Image withheld, solver told to answer from text alone.
    TextOnly,
    /// Image withheld, ordinary solver instructions.
    NoImage,
}

/// Why an oracle call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Extraction,
    VisualDescription,
    StepGeneration,
    StepRevision,
    Solve {
        tier: SolverTier,
        variant: ProbeVariant,
    },
    Review,
    VisualVerification,
    ReviewFeedback,
    FinalCompose,
    FinalRevise,
    /// Stem rewrite that hides surface cues of a final candidate.
    Obfuscate,
    MediumRationale,
    Reflection,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purpose::Extraction => write!(f, "extraction"),
            Purpose::VisualDescription => write!(f, "visual_description"),
            Purpose::StepGeneration => write!(f, "step_generation"),
            Purpose::StepRevision => write!(f, "step_revision"),
            Purpose::Solve { tier, variant } => write!(f, "solve:{tier:?}:{variant:?}"),
            Purpose::Review => write!(f, "review"),
            Purpose::VisualVerification => write!(f, "visual_verification"),
            Purpose::ReviewFeedback => write!(f, "review_feedback"),
            Purpose::FinalCompose => write!(f, "final_compose"),
            Purpose::FinalRevise => write!(f, "final_revise"),
            Purpose::Obfuscate => write!(f, "obfuscate"),
            Purpose::MediumRationale => write!(f, "medium_rationale"),
            Purpose::Reflection => write!(f, "reflection"),
        }
    }
}

/// An image shared by every call of an episode.
///
/// Cloning is cheap; bytes are reference counted.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageRef {
    media_type: String,
    bytes: Arc<[u8]>,
    digest: String,
}

impl ImageRef {
    pub fn new(media_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let digest = format!("{:x}", Sha256::digest(&bytes));
        Self {
            media_type: media_type.into(),
            bytes: Arc::from(bytes),
            digest,
        }
    }

    /// Load an image file, inferring the media type from its extension.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let media_type = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => "image/jpeg",
        };
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(media_type, bytes))
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex SHA-256 of the image bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRef")
            .field("media_type", &self.media_type)
            .field("len", &self.bytes.len())
            .field("digest", &&self.digest[..12.min(self.digest.len())])
            .finish()
    }
}

/// Sampling parameters for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: usize,
    pub top_p: Option<f32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 4096,
            top_p: None,
        }
    }
}

impl SamplingParams {
    pub fn new(temperature: f32, max_tokens: usize) -> Self {
        Self {
            temperature,
            max_tokens,
            top_p: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A single oracle call.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub purpose: Purpose,
    pub model: String,
    pub prompt: String,
    pub image: Option<ImageRef>,
    pub params: SamplingParams,
}

impl OracleRequest {
    pub fn new(purpose: Purpose, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            model: model.into(),
            prompt: prompt.into(),
            image: None,
            params: SamplingParams::default(),
        }
    }

    pub fn with_image(mut self, image: &ImageRef) -> Self {
        self.image = Some(image.clone());
        self
    }

    /// Attach the image only when one is given.
    pub fn with_optional_image(mut self, image: Option<&ImageRef>) -> Self {
        self.image = image.cloned();
        self
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }
}

/// A text generator that may also look at an image.
///
/// Implementations return the raw model text; interpreting it is the
/// caller's job (see [`crate::parse`]).
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn generate(&self, request: OracleRequest) -> Result<String, OracleError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: Oracle + ?Sized> Oracle for Arc<T> {
    async fn generate(&self, request: OracleRequest) -> Result<String, OracleError> {
        (**self).generate(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_digest_is_stable() {
        let a = ImageRef::new("image/png", b"pixels".to_vec());
        let b = ImageRef::new("image/png", b"pixels".to_vec());
        let c = ImageRef::new("image/png", b"other".to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 64);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_image_from_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plot.PNG");
        tokio::fs::write(&path, b"\x89PNG").await.unwrap();

        let image = ImageRef::from_path(&path).await.unwrap();
        assert_eq!(image.media_type(), "image/png");
        assert_eq!(image.bytes(), b"\x89PNG");
    }

    #[test]
    fn test_request_builder() {
        let image = ImageRef::new("image/jpeg", vec![1, 2, 3]);
        let request = OracleRequest::new(Purpose::Review, "m", "prompt")
            .with_image(&image)
            .with_params(SamplingParams::new(0.3, 512));
        assert_eq!(request.params.max_tokens, 512);
        assert!(request.image.is_some());

        let bare = request.clone().with_optional_image(None);
        assert!(bare.image.is_none());
    }
}

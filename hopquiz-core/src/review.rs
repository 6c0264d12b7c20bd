//! Independent review and visual-claim verification.

use crate::config::EngineConfig;
use crate::error::OracleError;
use crate::oracle::{ImageRef, Oracle, OracleRequest, Purpose, SamplingParams};
use crate::parse::{self, AnswerKey, ReviewVerdict};
use crate::prompts;
use std::sync::Arc;
use tracing::{debug, warn};

/// A second model that checks questions it did not write.
pub struct Reviewer {
    oracle: Arc<dyn Oracle>,
    model: String,
    params: SamplingParams,
}

impl Reviewer {
    pub fn new(oracle: Arc<dyn Oracle>, model: impl Into<String>) -> Self {
        Self {
            oracle,
            model: model.into(),
            params: SamplingParams::default(),
        }
    }

    pub fn from_config(oracle: Arc<dyn Oracle>, config: &EngineConfig) -> Self {
        Self::new(oracle, &config.models.review)
            .with_params(SamplingParams::new(config.temperature, config.max_tokens))
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    fn request(&self, purpose: Purpose, prompt: String, image: &ImageRef) -> OracleRequest {
        OracleRequest::new(purpose, &self.model, prompt)
            .with_image(image)
            .with_params(self.params)
    }

    /// Is the keyed answer right and the question sound?
    pub async fn review(
        &self,
        question: &str,
        answer: &AnswerKey,
        image: &ImageRef,
    ) -> Result<ReviewVerdict, OracleError> {
        let raw = self
            .oracle
            .generate(self.request(Purpose::Review, prompts::review(question, answer), image))
            .await?;
        let verdict = parse::parse_review(&raw);
        debug!(decision = ?verdict.decision, "review verdict");
        Ok(verdict)
    }

    /// Whether every visual claim in `stem` shows up in the image.
    ///
    /// A failed call passes the candidate.
    pub async fn verify_visual_claims(&self, stem: &str, image: &ImageRef) -> bool {
        let request = self.request(
            Purpose::VisualVerification,
            prompts::visual_verification(stem),
            image,
        );
        match self.oracle.generate(request).await {
            Ok(raw) => parse::parse_verification(&raw),
            Err(e) => {
                warn!(error = %e, "visual verification failed, passing candidate");
                true
            }
        }
    }

    /// Revision advice for a rejected question. Empty when the call fails.
    pub async fn feedback(
        &self,
        question: &str,
        answer: &AnswerKey,
        verdict: &ReviewVerdict,
        image: &ImageRef,
    ) -> Vec<String> {
        let request = self.request(
            Purpose::ReviewFeedback,
            prompts::review_feedback(question, answer, verdict),
            image,
        );
        match self.oracle.generate(request).await {
            Ok(raw) => parse::parse_bullets(&raw),
            Err(e) => {
                warn!(error = %e, "reviewer feedback failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_image, ScriptedOracle};

    #[tokio::test]
    async fn test_review_verdicts() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .on_sequence(
                    Purpose::Review,
                    [
                        "<answer>correct</answer><reason>fine</reason>",
                        "<answer>incorrect</answer><reason>C is also right</reason>",
                        "I am not sure.",
                    ],
                ),
        );
        let reviewer = Reviewer::new(oracle.clone(), "reviewer");
        let image = sample_image();
        let answer = AnswerKey::parse("B").unwrap();

        let first = reviewer.review("Q", &answer, &image).await.unwrap();
        assert!(first.approved());
        let second = reviewer.review("Q", &answer, &image).await.unwrap();
        assert_eq!(second.decision, Some(false));
        assert_eq!(second.reason.as_deref(), Some("C is also right"));
        let third = reviewer.review("Q", &answer, &image).await.unwrap();
        assert_eq!(third.decision, None);

        assert!(oracle.calls().iter().all(|c| c.image.is_some() && c.model == "reviewer"));
    }

    #[tokio::test]
    async fn test_verification_is_soft() {
        let image = sample_image();

        let rejecting = Reviewer::new(
            Arc::new(ScriptedOracle::new().on(Purpose::VisualVerification, "<verified>no</verified>")),
            "m",
        );
        assert!(!rejecting.verify_visual_claims("stem", &image).await);

        let failing = Reviewer::new(
            Arc::new(ScriptedOracle::new().fail_on(Purpose::VisualVerification, "down")),
            "m",
        );
        assert!(failing.verify_visual_claims("stem", &image).await);
    }

    #[tokio::test]
    async fn test_feedback_bullets() {
        let oracle = Arc::new(ScriptedOracle::new().on(
            Purpose::ReviewFeedback,
            "<feedback>\n- Make option C clearly wrong.\n- Drop the unit from the stem.\n</feedback>",
        ));
        let reviewer = Reviewer::new(oracle, "m");
        let verdict = ReviewVerdict {
            decision: Some(false),
            reason: Some("C also fits".into()),
            raw: String::new(),
        };
        let answer = AnswerKey::parse("B").unwrap();
        let bullets = reviewer.feedback("Q", &answer, &verdict, &sample_image()).await;
        assert_eq!(bullets, vec!["Make option C clearly wrong.", "Drop the unit from the stem."]);
    }
}

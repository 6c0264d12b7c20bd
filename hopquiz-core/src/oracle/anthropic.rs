use super::{Oracle, OracleRequest};
use crate::error::OracleError;
use async_trait::async_trait;
use claude::{Claude, ContentBlock, Message, Request};

/// Oracle backed by the Claude Messages API.
#[derive(Clone)]
pub struct ClaudeOracle {
    client: Claude,
}

impl ClaudeOracle {
    pub fn new(client: Claude) -> Self {
        Self { client }
    }

    /// Create from environment (ANTHROPIC_API_KEY).
    pub fn from_env() -> Result<Self, OracleError> {
        Ok(Self::new(Claude::from_env()?))
    }

    fn build_request(request: &OracleRequest) -> Request {
        let message = match &request.image {
            Some(image) => Message::user_with_image(
                ContentBlock::image(image.media_type(), image.bytes()),
                request.prompt.clone(),
            ),
            None => Message::user(request.prompt.clone()),
        };

        let mut api_request = Request::new(vec![message])
            .with_max_tokens(request.params.max_tokens)
            .with_temperature(request.params.temperature);
        if !request.model.is_empty() {
            api_request = api_request.with_model(request.model.clone());
        }
        if let Some(top_p) = request.params.top_p {
            api_request = api_request.with_top_p(top_p);
        }
        api_request
    }
}

#[async_trait]
impl Oracle for ClaudeOracle {
    async fn generate(&self, request: OracleRequest) -> Result<String, OracleError> {
        let response = self.client.complete(Self::build_request(&request)).await?;
        Ok(response.text())
    }

    fn name(&self) -> &str {
        "claude"
    }
}

//! Testing utilities for the synthesis engine.
//!
//! This module provides tools for tests that must not call a real model:
//! - `ScriptedOracle`, which answers each [`Purpose`] from a script
//! - fixtures for images, edges and well-formed generator responses

use crate::error::OracleError;
use crate::graph::KnowledgeEdge;
use crate::oracle::{ImageRef, Oracle, OracleRequest, Purpose};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

type Matcher = Box<dyn Fn(&OracleRequest) -> bool + Send + Sync>;

/// One scripted answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    /// Fails with a retryable [`OracleError::Unavailable`].
    Unavailable(String),
    /// Fails with a non-retryable [`OracleError::Rejected`].
    Rejected(String),
}

impl ScriptedReply {
    fn produce(&self) -> Result<String, OracleError> {
        match self {
            ScriptedReply::Text(text) => Ok(text.clone()),
            ScriptedReply::Unavailable(msg) => Err(OracleError::Unavailable(msg.clone())),
            ScriptedReply::Rejected(msg) => Err(OracleError::Rejected(msg.clone())),
        }
    }
}

struct Route {
    matcher: Matcher,
    replies: Vec<ScriptedReply>,
}

/// An oracle that answers from a script.
///
/// Requests go to the first route whose matcher accepts them. A route
/// replays its replies in order and then keeps repeating the last one.
/// Unrouted requests get the fallback reply, or a non-retryable error.
/// Every request is recorded.
pub struct ScriptedOracle {
    routes: Vec<Route>,
    cursors: Mutex<Vec<usize>>,
    fallback: Option<ScriptedReply>,
    calls: Mutex<Vec<OracleRequest>>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            cursors: Mutex::new(Vec::new()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Route requests matching `matcher` to `replies`.
    pub fn route<F>(mut self, matcher: F, replies: Vec<ScriptedReply>) -> Self
    where
        F: Fn(&OracleRequest) -> bool + Send + Sync + 'static,
    {
        self.routes.push(Route {
            matcher: Box::new(matcher),
            replies,
        });
        self.cursors
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(0);
        self
    }

    /// Always answer `purpose` with `reply`.
    pub fn on(self, purpose: Purpose, reply: impl Into<String>) -> Self {
        self.on_sequence(purpose, [reply.into()])
    }

    /// Answer `purpose` with `replies` in order, then repeat the last.
    pub fn on_sequence<I, S>(self, purpose: Purpose, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies = replies
            .into_iter()
            .map(|r| ScriptedReply::Text(r.into()))
            .collect();
        self.route(move |req| req.purpose == purpose, replies)
    }

    /// Fail every `purpose` request with a retryable error.
    pub fn fail_on(self, purpose: Purpose, message: impl Into<String>) -> Self {
        let reply = ScriptedReply::Unavailable(message.into());
        self.route(move |req| req.purpose == purpose, vec![reply])
    }

    /// Answer requests whose prompt contains `needle`.
    pub fn on_prompt(self, purpose: Purpose, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        let needle = needle.into();
        self.route(
            move |req| req.purpose == purpose && req.prompt.contains(&needle),
            vec![ScriptedReply::Text(reply.into())],
        )
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(ScriptedReply::Text(reply.into()));
        self
    }

    /// Every request received so far.
    pub fn calls(&self) -> Vec<OracleRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Requests received for one purpose.
    pub fn calls_for(&self, purpose: Purpose) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.purpose == purpose)
            .count()
    }

    fn next_reply(&self, request: &OracleRequest) -> Option<ScriptedReply> {
        let index = self.routes.iter().position(|r| (r.matcher)(request))?;
        let replies = &self.routes[index].replies;
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.get_mut(index)?;
        let reply = replies.get(*cursor).or_else(|| replies.last())?.clone();
        *cursor += 1;
        Some(reply)
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn generate(&self, request: OracleRequest) -> Result<String, OracleError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        match self.next_reply(&request).or_else(|| self.fallback.clone()) {
            Some(reply) => reply.produce(),
            None => Err(OracleError::Rejected(format!(
                "no scripted reply for {}",
                request.purpose
            ))),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A tiny image. The bytes are not a decodable PNG; nothing here decodes.
pub fn sample_image() -> ImageRef {
    ImageRef::new("image/png", b"\x89PNG\r\n\x1a\nfixture".to_vec())
}

pub fn edge(head: &str, relation: &str, tail: &str, source_id: u32) -> KnowledgeEdge {
    KnowledgeEdge::new(head, relation, tail).with_source(source_id)
}

/// A hop question that passes every cheap rule.
pub fn hop_question(k: usize) -> String {
    format!(
        "In the figure, when the film is {} nm thick, which layer compared with the substrate shows the higher peak?\n\
         A. oxide\nB. nitride\nC. metal\nD. glass",
        (k + 1) * 10
    )
}

/// Generator output for a hop.
pub fn step_response(question: &str, answer: char, modal_use: &str) -> String {
    format!(
        "<question>{question}</question>\n<answer>{answer}</answer>\n\
         <evidence>Figure 2</evidence>\n<modal_use>{modal_use}</modal_use>\n\
         <cross_modal_bridge>true</cross_modal_bridge>\n<reasoning>read the peak</reasoning>"
    )
}

/// A final question with a well-formed single-select block.
pub fn final_question() -> String {
    "In the figure, given the film at 30 nm, which layer compared with the 10 nm sample shifts its peak furthest?\n\
     A. oxide\nB. nitride\nC. metal\nD. glass"
        .to_string()
}

/// Composer output for a final question.
pub fn stage_response(question: &str, answer: &str) -> String {
    format!(
        "<question>{question}</question>\n<answer>{answer}</answer>\n<reasoning>chain of hops</reasoning>"
    )
}

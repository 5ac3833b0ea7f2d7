//! Planner/reviewer negotiation over the course outline.
//!
//! The planner proposes, the reviewer either approves with the literal
//! `APPROVE` or sends feedback, and the planner tries again with the whole
//! exchange in view. The outline is whatever the planner last proposed when
//! approval arrives.
//!
//! ```text
//! AwaitingPlan --planner--> AwaitingReview --APPROVE--> Approved
//!      ^                          |
//!      +--------feedback----------+
//! any state --cancel--> Aborted
//! ```

use crate::error::{PipelineError, PipelineResult};
use crate::extract::{extract_outline_fields, extract_structured};
use crate::generation::Generator;
use crate::model::Outline;
use crate::prompts::AgentRole;
use tokio_util::sync::CancellationToken;

/// The reviewer's approval token.
pub const APPROVAL_TOKEN: &str = "APPROVE";

/// Whether a reviewer reply mentions the approval token anywhere.
///
/// Case-sensitive, so "APPROVED." counts and "I approve of X" does not.
pub fn is_approval(reply: &str) -> bool {
    reply.contains(APPROVAL_TOKEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingPlan,
    AwaitingReview,
    Approved,
    Aborted,
}

/// One entry of the shared transcript. `role` is `None` for the seed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Option<AgentRole>,
    pub text: String,
}

impl Turn {
    fn speaker(&self) -> &'static str {
        self.role.map(AgentRole::name).unwrap_or("user")
    }
}

/// How a negotiation ended. Running out of rounds is an error, not an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Approved { outline: Outline, rounds: u32 },
    Aborted { rounds: u32 },
}

/// A single plan negotiation.
#[derive(Debug)]
pub struct Negotiation {
    state: NegotiationState,
    transcript: Vec<Turn>,
    candidate: Option<String>,
    rounds: u32,
    max_rounds: u32,
}

impl Negotiation {
    /// Start in `AwaitingPlan` with `task` as the first transcript entry.
    pub fn new(task: impl Into<String>, max_rounds: u32) -> Self {
        Self {
            state: NegotiationState::AwaitingPlan,
            transcript: vec![Turn {
                role: None,
                text: task.into(),
            }],
            candidate: None,
            rounds: 0,
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    /// Planner rounds started so far.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// The shared transcript as sent to either role.
    pub fn render(&self) -> String {
        self.transcript
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker(), turn.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Drive the exchange to a terminal state.
    ///
    /// Fails with `MalformedOutline` if the round cap is reached without
    /// approval or the approved candidate has no usable outline. Remote
    /// failures are returned as-is for the caller's retry policy.
    pub async fn run(
        &mut self,
        generator: &dyn Generator,
        cancel: &CancellationToken,
    ) -> PipelineResult<NegotiationOutcome> {
        loop {
            match self.state {
                NegotiationState::AwaitingPlan => {
                    if self.abort_if_cancelled(cancel) {
                        continue;
                    }
                    if self.rounds >= self.max_rounds {
                        tracing::warn!(rounds = self.rounds, "plan never approved");
                        return Err(PipelineError::malformed(format!(
                            "no approval after {} rounds",
                            self.rounds
                        )));
                    }
                    self.rounds += 1;
                    tracing::info!(round = self.rounds, "requesting course plan");

                    let reply = generator
                        .generate(AgentRole::CoursePlanner, &self.render())
                        .await?;
                    self.push(AgentRole::CoursePlanner, reply.clone());
                    self.candidate = Some(reply);
                    self.state = NegotiationState::AwaitingReview;
                }
                NegotiationState::AwaitingReview => {
                    if self.abort_if_cancelled(cancel) {
                        continue;
                    }
                    let reply = generator
                        .generate(AgentRole::PlanReviewer, &self.render())
                        .await?;
                    let approved = is_approval(&reply);
                    self.push(AgentRole::PlanReviewer, reply);

                    if self.abort_if_cancelled(cancel) {
                        continue;
                    }
                    if approved {
                        tracing::info!(round = self.rounds, "course plan approved");
                        self.state = NegotiationState::Approved;
                    } else {
                        tracing::debug!(round = self.rounds, "reviewer requested changes");
                        self.state = NegotiationState::AwaitingPlan;
                    }
                }
                NegotiationState::Approved => {
                    let outline = self.approved_outline()?;
                    return Ok(NegotiationOutcome::Approved {
                        outline,
                        rounds: self.rounds,
                    });
                }
                NegotiationState::Aborted => {
                    return Ok(NegotiationOutcome::Aborted {
                        rounds: self.rounds,
                    });
                }
            }
        }
    }

    fn push(&mut self, role: AgentRole, text: String) {
        self.transcript.push(Turn {
            role: Some(role),
            text,
        });
    }

    fn abort_if_cancelled(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            tracing::info!(round = self.rounds, "negotiation aborted");
            self.state = NegotiationState::Aborted;
            true
        } else {
            false
        }
    }

    fn approved_outline(&self) -> PipelineResult<Outline> {
        let candidate = self
            .candidate
            .as_deref()
            .ok_or_else(|| PipelineError::malformed("approved without a plan"))?;
        parse_outline(candidate)
    }
}

/// Parse and validate a planner reply, falling back to field extraction.
///
/// The fallback also runs when structured parsing found something that is
/// not a usable outline, such as a lone module object picked out of a plan
/// whose outer JSON is broken.
pub fn parse_outline(text: &str) -> PipelineResult<Outline> {
    let rejected = match extract_structured::<Outline>(text, "course plan") {
        Ok(outline) => match outline.validate() {
            Ok(()) => return Ok(outline),
            Err(reason) => reason,
        },
        Err(e) => e.to_string(),
    };

    tracing::warn!(reason = %rejected, "falling back to field extraction for course plan");
    let outline = extract_outline_fields(text)
        .ok_or_else(|| PipelineError::malformed(format!("no outline in plan: {rejected}")))?;
    outline.validate().map_err(PipelineError::malformed)?;
    Ok(outline)
}

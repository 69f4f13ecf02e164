//! Executor role: assemble the execution prompt and exchange it with the agent.

use std::time::{Duration, Instant};

use tracing::{instrument, warn};

use crate::core::types::AgentReply;
use crate::error::{AgentError, EngineError};
use crate::io::prompt::{ExecutionPrompt, PromptAssembler, RenderedPrompt};
use crate::io::session::Agent;

/// One prompt/reply exchange.
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub prompt: RenderedPrompt,
    pub reply: AgentReply,
    pub agent_ms: u64,
}

pub struct ExecutorAgent<'a> {
    assembler: &'a PromptAssembler,
    agent_timeout: Duration,
}

impl<'a> ExecutorAgent<'a> {
    pub fn new(assembler: &'a PromptAssembler, agent_timeout: Duration) -> Self {
        Self {
            assembler,
            agent_timeout,
        }
    }

    /// Run one exchange bounded by the agent timeout and the iteration deadline.
    ///
    /// A reply timeout is not an error here: the partial output comes back as a
    /// timed-out reply so validation can judge it. Anything else the agent
    /// raises has already survived restart attempts and is fatal.
    #[instrument(skip_all, fields(task = %request.task.id, iteration = request.iteration))]
    pub fn run<A: Agent>(
        &self,
        agent: &mut A,
        request: &ExecutionPrompt<'_>,
        deadline: Instant,
    ) -> Result<ExecutionAttempt, EngineError> {
        let prompt = self.assembler.execution(request)?;
        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .min(self.agent_timeout);

        let started = Instant::now();
        let reply = match agent.exchange(&prompt.content, timeout) {
            Ok(reply) => reply,
            Err(AgentError::Timeout { timeout, partial }) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "agent reply timed out");
                AgentReply::timed_out(partial)
            }
            Err(source) => {
                return Err(EngineError::Agent {
                    task: request.task.id.clone(),
                    source,
                });
            }
        };

        Ok(ExecutionAttempt {
            prompt,
            reply,
            agent_ms: started.elapsed().as_millis() as u64,
        })
    }
}

//! Agent Core State Machine (§4.8): a `kameo::Actor` wrapping [`AgentState`]
//! and the collaborators a consensus cycle needs — the LLM pool, the model
//! catalog, the Action Router, the event bus, the embedding cache, and the
//! persistence store.
//!
//! Grounded on the teacher's `SessionActor` (`agent/session_actor.rs`): one
//! actor per unit of work, `#[derive(Actor)]` plus hand-written `Message<T>`
//! impls, `ctx.spawn()` for detached long-running work that reports back via
//! a self-`tell`, and a generation counter (`TurnState`) for discarding
//! stale completions — reused here as `AgentState::wait_timer`'s generation.

use crate::agent_messages::{
    ActionAck, ActionResult, AgentMessage as AgentMessageEvent, ChildDismissed, ChildRestored,
    ChildSpawned, GetState, ParentDown, SetDismissing, Shutdown, SwitchModelPool,
    TriggerConsensus, UpdateTodos, UserMessage as UserMessageEvent, WaitExpired,
};
use crate::condenser;
use crate::consensus::{self, ConsensusOutcome};
use crate::error::RuntimeError;
use crate::event_bus::EventBus;
use crate::events::PublishedEvent;
use crate::history::{
    AgentState, ChildRef, HistoryEntry, PendingAction, QueuedMessage, Wait, WaitTimer,
};
use crate::lesson_manager::EmbeddingCache;
use crate::mcp::McpClientPool;
use crate::persistence::{PersistenceRecord, PersistenceStore};
use crate::router::ActionRouter;
use crate::tokens::TokenCalculator;
use kameo::Actor;
use kameo::actor::ActorRef;
use kameo::message::{Context, Message};
use quoracle_llm::{CostAccumulator, ModelSpec, SharedLLMProvider, SharedModelCatalog};
use rand::Rng;
use std::sync::Arc;

/// How many times a retryable consensus failure is retried before the
/// failure is escalated to the parent (§4.8 consensus cycle: `retry_count < 2`).
const DEFAULT_CONSENSUS_RETRY_BUDGET: u32 = 2;

/// Collaborators the Agent Core needs but does not own the lifecycle of.
/// Kept as a single struct so `AgentCoreArgs` stays small.
pub struct AgentDeps {
    pub provider: SharedLLMProvider,
    pub catalog: SharedModelCatalog,
    pub router: Arc<dyn ActionRouter>,
    pub event_bus: Arc<EventBus>,
    pub persistence: Arc<dyn PersistenceStore>,
    pub mcp_pool: Arc<McpClientPool>,
    pub embedding_model: ModelSpec,
    pub lesson_manager_max: usize,
    pub lesson_manager_sim_threshold: f32,
    pub embedding_cache_capacity: u64,
    pub consensus_retry_budget: u32,
    pub parent: Option<ActorRef<AgentCore>>,
}

pub struct AgentCoreArgs {
    pub state: AgentState,
    pub deps: AgentDeps,
}

/// The Agent Core actor (§3, §4.8). Single-threaded per agent by
/// construction — `kameo` only ever runs one `handle` at a time for a given
/// actor instance, which is exactly invariant 2's "at most one of these is
/// armed" guarantee extended to the whole event loop.
pub struct AgentCore {
    state: AgentState,
    deps: AgentDeps,
    cost_accumulator: CostAccumulator,
    embedding_cache: EmbeddingCache,
}

impl Actor for AgentCore {
    type Args = AgentCoreArgs;
    type Error = kameo::error::Infallible;

    async fn on_start(args: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let embedding_cache = EmbeddingCache::new(args.deps.embedding_cache_capacity);
        Ok(Self {
            state: args.state,
            deps: args.deps,
            cost_accumulator: CostAccumulator::new(),
            embedding_cache,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> Result<(), Self::Error> {
        self.deps.mcp_pool.shutdown_all().await;
        self.persist_best_effort().await;
        Ok(())
    }
}

impl AgentCore {
    fn agent_id(&self) -> &str {
        &self.state.config.agent_id
    }

    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn calculator(&self) -> TokenCalculator {
        TokenCalculator::new(self.deps.catalog.clone())
    }

    /// §9 `restoration_mode`: the first mutation after a restore is not
    /// re-persisted, so a restore never storms the store on its own account.
    async fn persist_best_effort(&mut self) {
        if self.state.restoration_mode {
            self.state.restoration_mode = false;
            return;
        }
        let record = PersistenceRecord::from_state(&self.state);
        if let Err(err) = self.deps.persistence.save(&record).await {
            tracing::error!(agent_id = %self.agent_id(), error = %err, "failed to persist agent state");
        }
    }

    /// §4.8: move any batched messages into every model's history, FIFO.
    fn flush_queued_messages(&mut self) {
        let queued = std::mem::take(&mut self.state.queued_messages);
        for QueuedMessage {
            sender, content, ..
        } in queued
        {
            self.state
                .append_to_all_histories(HistoryEntry::event(format!("{sender}: {content}"), self.now()));
        }
    }

    /// §5: any stimulus that means "new input arrived" cancels the armed
    /// wait timer. A late `wait_expired` for the old timer is then a no-op
    /// via the generation check in [`WaitExpired`]'s handler.
    fn cancel_wait_timer(&mut self) {
        self.state.wait_timer = None;
    }

    /// After appending any entry, condense any model whose history has
    /// grown past its context window (§4.4 — reactive, no headroom).
    async fn condense_as_needed(&mut self) {
        let calculator = self.calculator();
        let models: Vec<ModelSpec> = self.state.config.model_pool.clone();
        for model in models {
            let history = match self.state.model_histories.get(&model) {
                Some(h) => h,
                None => continue,
            };
            if !condenser::needs_condensation(&calculator, &model, history) {
                continue;
            }
            if let Err(err) = condenser::condense_model(
                self.deps.provider.as_ref(),
                &self.deps.embedding_model,
                &self.embedding_cache,
                &calculator,
                &mut self.state,
                &model,
                self.deps.lesson_manager_max,
                self.deps.lesson_manager_sim_threshold,
            )
            .await
            {
                tracing::warn!(agent_id = %self.agent_id(), model = %model.0, error = %err, "condensation failed");
            }
        }
    }

    fn schedule_consensus(&mut self, ctx: &Context<Self, ()>) {
        self.state.consensus_scheduled = true;
        let actor_ref = ctx.actor_ref().clone();
        tokio::spawn(async move {
            let _ = actor_ref.tell(TriggerConsensus).await;
        });
    }

    /// §5: arm `wait_timer` with a fresh `(timer_id, generation)` and spawn
    /// a background sleep that self-sends `WaitExpired` when it elapses.
    fn arm_wait_timer(&mut self, millis: u64, ctx: &Context<Self, ()>) {
        let generation = self
            .state
            .wait_timer
            .map(|t| t.generation + 1)
            .unwrap_or(1);
        let timer_id: u64 = rand::thread_rng().r#gen();
        self.state.wait_timer = Some(WaitTimer { timer_id, generation });

        let actor_ref = ctx.actor_ref().clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
            let _ = actor_ref
                .tell(WaitExpired {
                    timer_id,
                    generation,
                })
                .await;
        });
    }

    fn publish(&self, event: PublishedEvent) {
        self.deps.event_bus.publish(event);
    }

    /// §4.8 NO_EXECUTE wrapping: wrap an untrusted action's result in a
    /// per-entry random-token delimiter so the prompt can teach the model to
    /// treat the content as inert data.
    fn wrap_no_execute(value: &serde_json::Value) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let normalized = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        format!("<NO_EXECUTE_{token}>\n{normalized}\n</NO_EXECUTE_{token}>")
    }

    /// §4.8 wait handling, applied after a decision's action has either run
    /// synchronously (self-contained) or been dispatched (I/O, pending).
    fn apply_wait(&mut self, wait: Wait, self_contained: bool, ctx: &Context<Self, ()>) {
        match wait {
            Wait::No | Wait::Timed(0) if self_contained => self.schedule_consensus(ctx),
            Wait::No | Wait::Timed(0) => { /* I/O action: stay ready, action_result drives the next cycle */ }
            Wait::Indefinite => { /* idle until an external event arrives */ }
            Wait::Timed(ms) => self.arm_wait_timer(ms, ctx),
        }
    }

    /// Execute the winning decision (§4.8 consensus cycle step 3).
    async fn execute_decision(
        &mut self,
        decision: crate::history::Decision,
        ctx: &Context<Self, ()>,
    ) {
        self.state
            .append_to_all_histories(HistoryEntry::decision(decision.clone()));
        self.condense_as_needed().await;

        let self_contained = self.deps.router.is_self_contained(&decision.action);
        let untrusted = self.deps.router.is_untrusted(&decision.action);

        if self_contained {
            match self
                .deps
                .router
                .execute(&decision.action, &decision.params, self.agent_id())
                .await
            {
                Ok(envelope) => {
                    let text = if untrusted {
                        Self::wrap_no_execute(&envelope.value)
                    } else {
                        envelope.value.to_string()
                    };
                    self.state.append_to_all_histories(HistoryEntry::result(
                        text,
                        self.now(),
                        "self-contained",
                        decision.action.clone(),
                    ));
                    self.publish(PublishedEvent::ActionCompleted {
                        agent_id: self.agent_id().to_string(),
                        action_id: "self-contained".to_string(),
                        result: envelope.value,
                    });
                }
                Err(reason) => {
                    tracing::warn!(agent_id = %self.agent_id(), action = %decision.action, %reason, "self-contained action failed");
                }
            }
            self.apply_wait(decision.wait, true, ctx);
        } else {
            let action_id = uuid::Uuid::new_v4().to_string();
            self.state.pending_actions.insert(
                action_id.clone(),
                PendingAction {
                    kind: decision.action.clone(),
                    async_acked: false,
                    dispatched_at: self.now(),
                },
            );

            let router = self.deps.router.clone();
            let action = decision.action.clone();
            let params = decision.params.clone();
            let agent_id = self.agent_id().to_string();
            let actor_ref = ctx.actor_ref().clone();
            tokio::spawn(async move {
                let outcome = router.execute(&action, &params, &agent_id).await;
                let result = match outcome {
                    Ok(envelope) => envelope.value,
                    Err(reason) => serde_json::json!({ "error": reason }),
                };
                let _ = actor_ref
                    .tell(ActionResult {
                        action_id,
                        action_type: action,
                        result,
                    })
                    .await;
            });

            self.apply_wait(decision.wait, false, ctx);
        }
    }

    /// §4.8 consensus cycle. Entry point for [`TriggerConsensus`].
    async fn run_consensus_cycle(&mut self, ctx: &Context<Self, ()>) {
        self.flush_queued_messages();

        let condense_deps = consensus::CondenseDeps {
            embedding_model: &self.deps.embedding_model,
            cache: &self.embedding_cache,
            lesson_manager_max: self.deps.lesson_manager_max,
            lesson_manager_sim_threshold: self.deps.lesson_manager_sim_threshold,
        };
        let outcome = consensus::run_consensus(
            self.deps.provider.clone(),
            &self.deps.catalog,
            self.deps.router.as_ref(),
            &mut self.state,
            &condense_deps,
            Some(&self.cost_accumulator),
        )
        .await;

        match outcome {
            Ok(ConsensusOutcome::Consensus { decision, .. })
            | Ok(ConsensusOutcome::ForcedDecision { decision, .. }) => {
                self.state.consensus_retry_count = 0;
                self.state.consensus_scheduled = false;
                self.execute_decision(decision, ctx).await;
            }
            Err(err) => {
                self.state.consensus_scheduled = false;
                if err.is_consensus_retryable()
                    && self.state.consensus_retry_count < self.deps.consensus_retry_budget
                {
                    self.state.consensus_retry_count += 1;
                    self.schedule_consensus(ctx);
                } else if err.is_consensus_retryable() {
                    if let Some(parent) = self.deps.parent.clone() {
                        let message = format!(
                            "Consensus failed after {} attempts: {err}",
                            self.state.consensus_retry_count
                        );
                        let sender = self.agent_id().to_string();
                        tokio::spawn(async move {
                            let _ = parent
                                .tell(AgentMessageEvent {
                                    sender,
                                    content: message,
                                })
                                .await;
                        });
                    }
                } else {
                    tracing::error!(agent_id = %self.agent_id(), error = %err, "consensus failed non-retryably, stalling");
                }
            }
        }

        self.persist_best_effort().await;
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  Stimuli
// ══════════════════════════════════════════════════════════════════════════

impl AgentCore {
    /// Shared by `agent_message` and `user_message` (§4.8: "Same as
    /// `agent_message(:user, content)`").
    async fn handle_incoming_message(&mut self, sender: String, content: String, ctx: &Context<Self, ()>) {
        self.cancel_wait_timer();
        self.publish(PublishedEvent::MessageReceived {
            agent_id: self.agent_id().to_string(),
            sender: sender.clone(),
        });

        if self.state.must_queue_stimuli() {
            self.state.queued_messages.push(QueuedMessage {
                sender,
                content,
                queued_at: self.now(),
            });
        } else {
            self.state
                .append_to_all_histories(HistoryEntry::event(format!("{sender}: {content}"), self.now()));
            self.schedule_consensus(ctx);
        }
    }
}

impl Message<AgentMessageEvent> for AgentCore {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: AgentMessageEvent,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.handle_incoming_message(msg.sender, msg.content, ctx).await
    }
}

impl Message<UserMessageEvent> for AgentCore {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: UserMessageEvent,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.handle_incoming_message("user".to_string(), msg.content, ctx).await
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  Action lifecycle
// ══════════════════════════════════════════════════════════════════════════

impl Message<ActionResult> for AgentCore {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ActionResult,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.cancel_wait_timer();
        self.state.pending_actions.remove(&msg.action_id);

        let text = if self.deps.router.is_untrusted(&msg.action_type) {
            Self::wrap_no_execute(&msg.result)
        } else {
            msg.result.to_string()
        };
        self.state
            .append_to_all_histories(HistoryEntry::result(text, self.now(), msg.action_id.clone(), msg.action_type.clone()));
        self.condense_as_needed().await;

        self.publish(PublishedEvent::ActionCompleted {
            agent_id: self.agent_id().to_string(),
            action_id: msg.action_id,
            result: msg.result,
        });

        self.flush_queued_messages();
        self.schedule_consensus(ctx);
        self.persist_best_effort().await;
    }
}

impl Message<ActionAck> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, msg: ActionAck, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if let Some(pending) = self.state.pending_actions.get_mut(&msg.action_id) {
            pending.async_acked = true;
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  Wait timer / consensus scheduling (internal)
// ══════════════════════════════════════════════════════════════════════════

impl Message<WaitExpired> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, msg: WaitExpired, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let current = match self.state.wait_timer {
            Some(t) => t,
            None => return,
        };
        if current.timer_id != msg.timer_id || current.generation != msg.generation {
            return;
        }
        self.state.wait_timer = None;
        self.state
            .append_to_all_histories(HistoryEntry::event("wait_timeout", self.now()));
        self.schedule_consensus(ctx);
    }
}

impl Message<TriggerConsensus> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, _msg: TriggerConsensus, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if !(self.state.consensus_scheduled || self.state.wait_timer.is_some()) {
            return;
        }
        self.run_consensus_cycle(ctx).await;
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  Tree lifecycle
// ══════════════════════════════════════════════════════════════════════════

impl Message<ChildSpawned> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, msg: ChildSpawned, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.state.children.push(ChildRef {
            child_agent_id: msg.child_agent_id,
            spawned_at: self.now(),
        });
        self.persist_best_effort().await;
    }
}

impl Message<ChildDismissed> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, msg: ChildDismissed, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.state
            .children
            .retain(|c| c.child_agent_id != msg.child_agent_id);
        self.persist_best_effort().await;
    }
}

impl Message<ChildRestored> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, msg: ChildRestored, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if !self
            .state
            .children
            .iter()
            .any(|c| c.child_agent_id == msg.child_agent_id)
        {
            self.state.children.push(ChildRef {
                child_agent_id: msg.child_agent_id,
                spawned_at: self.now(),
            });
        }
    }
}

impl Message<ParentDown> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, _msg: ParentDown, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        tracing::warn!(agent_id = %self.agent_id(), "parent actor went down");
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  Administrative
// ══════════════════════════════════════════════════════════════════════════

impl Message<UpdateTodos> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, msg: UpdateTodos, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.state.todos = msg.items.clone();
        self.publish(PublishedEvent::TodosUpdated {
            agent_id: self.agent_id().to_string(),
            items: serde_json::Value::Array(msg.items),
        });
        self.persist_best_effort().await;
    }
}

impl Message<SwitchModelPool> for AgentCore {
    type Reply = Result<(), RuntimeError>;

    async fn handle(&mut self, msg: SwitchModelPool, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        crate::pool_switch::switch_model_pool(
            self.deps.provider.as_ref(),
            &self.deps.catalog,
            &self.embedding_cache,
            &self.deps.embedding_model,
            &mut self.state,
            msg.new_pool,
            self.deps.lesson_manager_max,
            self.deps.lesson_manager_sim_threshold,
        )
        .await?;
        self.persist_best_effort().await;
        Ok(())
    }
}

impl Message<SetDismissing> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, msg: SetDismissing, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.state.dismissing = msg.dismissing;
    }
}

impl Message<GetState> for AgentCore {
    type Reply = AgentState;

    async fn handle(&mut self, _msg: GetState, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.state.clone()
    }
}

impl Message<Shutdown> for AgentCore {
    type Reply = ();

    async fn handle(&mut self, _msg: Shutdown, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.persist_best_effort().await;
        ctx.actor_ref().kill();
    }
}

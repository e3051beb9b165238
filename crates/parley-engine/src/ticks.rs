// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::{error, info, warn};

use parley_runtime::helpers::publish_agent_finished;
use parley_runtime::{AgentRuntime, EffectExecutor, EngineContext};
use parley_stack::{keys, InteractionStack, Session};

/// Process one session tick: under the conversation's tick fence, run the
/// agent runtime for every registered agent.  Returns `true` when any
/// agent progressed (emitted effects or reached a terminal state); the
/// worker re-enqueues itself while progress continues, bounded by
/// `max_rounds`.
pub async fn process_session_tick(ctx: &EngineContext, conversation_id: &str, round: u32) -> bool {
    let fence = keys::tick_fence(conversation_id);
    if !ctx
        .store
        .set_nx_ex(&fence, "1", ctx.config.tick.fence_ttl_secs)
    {
        info!(conversation_id, "tick already in progress, skipping");
        return false;
    }

    let progressed = run_tick(ctx, conversation_id, round).await;
    ctx.store.del(&fence);
    progressed
}

async fn run_tick(ctx: &EngineContext, conversation_id: &str, round: u32) -> bool {
    let session = ctx.session(conversation_id);
    let agents = session.agents();
    if agents.is_empty() {
        error!(conversation_id, "tick aborted, no live agents");
        return false;
    }

    let mut has_work = false;
    for agent_id in agents {
        has_work |= process_agent_tick(ctx, conversation_id, &agent_id).await;
    }

    if has_work {
        if round < ctx.config.tick.max_rounds {
            ctx.queues.enqueue_tick_round(conversation_id, round + 1);
        } else {
            warn!(conversation_id, round, "max rounds reached for tick chain");
        }
    }
    info!(conversation_id, has_work, "session tick processed");
    has_work
}

/// One agent's slice of a tick.  Returns whether the agent progressed.
pub async fn process_agent_tick(ctx: &EngineContext, conversation_id: &str, agent_id: &str) -> bool {
    let session = ctx.session(conversation_id);
    let stack = session.stack_for(agent_id);

    let finished_on_entry = top_is_terminal(&stack);

    let Some(agent) = ctx.agents.get(agent_id) else {
        error!(agent_id, "agent not found");
        return false;
    };

    let branch_id = stack.current_branch();
    // Pin the episode id before any pushes so the whole burst groups.
    let _ = stack.current_episode_id();

    let rounds_key = keys::round_by_branch(conversation_id, agent_id, &branch_id);
    let before_len = stack.length(None);

    let effects = AgentRuntime::new(ctx, agent, &stack).step().await;
    let after_len = stack.length(None);

    let mut progressed = !effects.is_empty();
    if !progressed && after_len > before_len {
        progressed = top_is_terminal(&stack);
    }

    let rounds = if progressed {
        ctx.store.del(&rounds_key);
        0
    } else {
        let r = ctx.store.incr(&rounds_key);
        ctx.store
            .expire(&rounds_key, ctx.config.stack.key_ttl_secs);
        r
    };

    let parent_agent_id = stack.parent_agent_id();

    // A root agent idling on its terminal marker is done: record it and
    // drain it from the conversation.
    if finished_on_entry
        && effects.is_empty()
        && top_is_terminal(&stack)
        && parent_agent_id.is_none()
    {
        finalize_root(ctx, &session, &stack, conversation_id, agent_id, &branch_id);
        return false;
    }

    // Round-stall protection: an agent that keeps producing nothing is
    // force-finished so the barrier can drain.
    if rounds > ctx.config.tick.max_rounds as i64 {
        warn!(
            conversation_id,
            agent_id, branch_id, rounds, "max idle rounds reached, branch throttled"
        );
        ctx.metrics.emit(
            "stalled_agent_finalised",
            1.0,
            &[
                ("conversation_id", conversation_id),
                ("agent_id", agent_id),
                ("branch", branch_id.as_str()),
            ],
        );
        publish_agent_finished(ctx, conversation_id, agent_id, &branch_id);
        session.add_finished(agent_id);
        session.ack_tick(agent_id, session.tick());
        return false;
    }

    EffectExecutor::new(ctx).execute(effects, conversation_id);

    session.ack_tick(agent_id, session.tick());

    if top_is_terminal(&stack) && parent_agent_id.is_none() {
        finalize_root(ctx, &session, &stack, conversation_id, agent_id, &branch_id);
    }

    info!(conversation_id, agent_id, progressed, "agent tick processed");
    progressed
}

fn top_is_terminal(stack: &InteractionStack) -> bool {
    matches!(stack.current(None), Some(e) if e.state.is_terminal())
}

fn finalize_root(
    ctx: &EngineContext,
    session: &Session,
    _stack: &InteractionStack,
    conversation_id: &str,
    agent_id: &str,
    branch_id: &str,
) {
    publish_agent_finished(ctx, conversation_id, agent_id, branch_id);
    session.add_finished(agent_id);
    session.ack_tick(agent_id, session.tick());
    session.unregister_agent(agent_id, true);
}

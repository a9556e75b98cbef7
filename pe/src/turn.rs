//! Oracle-assisted turn processing
//!
//! Free-form messages go to the oracle first (single attempt, the user is
//! waiting). A handled response may patch several context fields at once,
//! append a story, and jump the stage. Anything else - oracle unavailable,
//! call failure, or a response that did nothing - falls back to the
//! deterministic stage machine, so a turn always produces a reply.

use tracing::debug;

use crate::error::PrdError;
use crate::oracle::{Oracle, SessionSnapshot, StoryPatch, TurnRequest, TurnResponse};
use crate::priority;
use crate::score;
use crate::session::{PrdSession, Role, Stage};
use crate::stage;

/// Process one free-form message
pub async fn process(
    session: &mut PrdSession,
    input: &str,
    conversation_tail: &str,
    oracle: &Oracle,
) -> Result<String, PrdError> {
    let Some(call) = oracle.turn.as_ref() else {
        return stage::handle_input(session, input, oracle).await;
    };

    let req = TurnRequest {
        snapshot: SessionSnapshot {
            session: session.clone(),
            conversation_tail: conversation_tail.to_string(),
        },
        input: input.to_string(),
    };

    let resp = match call(req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(chat_id = session.chat_id, category = %e.category, "Oracle turn failed, falling back");
            return stage::handle_input(session, input, oracle).await;
        }
    };

    if !is_handled(&resp) {
        debug!(chat_id = session.chat_id, "Oracle turn had nothing, falling back");
        return stage::handle_input(session, input, oracle).await;
    }

    apply(session, resp, oracle).await
}

/// A response counts as handled when it carries anything actionable,
/// including a bare readiness assertion
fn is_handled(resp: &TurnResponse) -> bool {
    resp.reply.is_some()
        || resp.next_question.is_some()
        || !resp.session_patch.is_empty()
        || resp.story.is_some()
        || resp.suggested_stage.as_deref().and_then(Stage::parse).is_some()
        || resp.ready_to_apply
}

async fn apply(session: &mut PrdSession, resp: TurnResponse, oracle: &Oracle) -> Result<String, PrdError> {
    let mut patched = 0usize;
    for (field, value) in resp.session_patch.entries() {
        if let Some(value) = value
            && session.set_context_field(field, value)
        {
            patched += 1;
        }
    }

    let mut story_note = None;
    if let Some(patch) = resp.story {
        story_note = commit_story_patch(session, patch, oracle).await;
    }

    // A readiness claim, from either side, parks the flow at story intake;
    // otherwise the oracle suggests and the clarity evaluator breaks ties.
    let clarity = score::heuristic(session);
    session.stage = if resp.ready_to_apply || clarity.ready {
        Stage::AwaitStoryTitle
    } else {
        resp.suggested_stage
            .as_deref()
            .and_then(Stage::parse)
            .unwrap_or(clarity.recommended_stage)
    };
    session.touch();
    debug!(
        chat_id = session.chat_id,
        patched,
        stage = %session.stage,
        score = clarity.score,
        "Applied oracle turn"
    );

    let mut parts = Vec::new();
    if let Some(reply) = resp.reply.filter(|r| !r.trim().is_empty()) {
        parts.push(reply);
    }
    if let Some(note) = story_note {
        parts.push(note);
    }
    if let Some(q) = resp.next_question.filter(|q| !q.trim().is_empty()) {
        parts.push(q);
    }
    if parts.is_empty() {
        parts.push(stage::prompt_for(session.stage).to_string());
    }
    Ok(parts.join("\n"))
}

/// Append a story from an oracle patch, or reject the patch quietly
///
/// A usable patch needs a title, a description and a known role. A positive
/// priority in the patch is taken as-is (clamped like a manual value is not -
/// the oracle estimate path clamps, a patch priority is treated as manual).
async fn commit_story_patch(session: &mut PrdSession, patch: StoryPatch, oracle: &Oracle) -> Option<String> {
    let (Some(title), Some(description)) = (patch.title, patch.description) else {
        debug!(chat_id = session.chat_id, "Story patch missing title/description, ignored");
        return None;
    };
    if title.trim().is_empty() || description.trim().is_empty() {
        return None;
    }
    let role: Role = match patch.role.as_deref().unwrap_or_default().parse() {
        Ok(role) => role,
        Err(_) => {
            debug!(chat_id = session.chat_id, role = ?patch.role, "Story patch role unknown, ignored");
            return None;
        }
    };
    let manual = patch.priority.filter(|p| *p > 0).map(|p| p as u32);

    let (priority_value, _) = priority::resolve(oracle, session, &title, &description, role, manual).await;
    let id = session.push_story(title.clone(), description, role, priority_value);
    Some(format!("Story {} added: \"{}\" ({}, priority {}).", id, title, role, priority_value))
}

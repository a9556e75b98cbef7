//! Deterministic stage machine
//!
//! The fallback authority for every turn the oracle does not handle, and the
//! only authority for structured quick-form input. Every transition is a
//! total function: malformed input errors without mutating the stage, so the
//! user stays at the same prompt.

use tracing::debug;

use crate::error::PrdError;
use crate::oracle::Oracle;
use crate::priority::{self, PrioritySource};
use crate::score;
use crate::session::{ContextField, PrdSession, Role, Stage};

/// Prompt shown for a stage
pub fn prompt_for(stage: Stage) -> &'static str {
    match stage {
        Stage::AwaitProduct => "What product or feature are we writing requirements for?",
        Stage::AwaitProblem => ContextField::Problem.prompt(),
        Stage::AwaitGoal => ContextField::Goal.prompt(),
        Stage::AwaitInScope => ContextField::InScope.prompt(),
        Stage::AwaitOutOfScope => ContextField::OutOfScope.prompt(),
        Stage::AwaitAcceptance => ContextField::Acceptance.prompt(),
        Stage::AwaitConstraints => ContextField::Constraints.prompt(),
        Stage::AwaitStoryTitle => {
            "Next story: send 'title | description | role [priority]' in one line, or just a title. /prd score to check readiness."
        }
        Stage::AwaitStoryDesc => "Describe that story in a sentence or two.",
        Stage::AwaitStoryRole => "Which role owns it? (manager/planner/developer/qa, optionally 'role 1200')",
        Stage::AwaitStoryPriority => "Priority for this story? (positive integer, or 'default' to auto-resolve)",
    }
}

/// Parsed `title | description | role [priority]` quick form
#[derive(Debug, PartialEq)]
struct QuickForm {
    title: String,
    description: String,
    role: Role,
    priority: Option<u32>,
}

fn parse_quick_form(input: &str) -> Result<QuickForm, PrdError> {
    let parts: Vec<&str> = input.split('|').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(PrdError::InvalidQuickFormat(input.to_string()));
    }
    let (title, description, tail) = (parts[0], parts[1], parts[2]);
    if title.is_empty() || description.is_empty() || tail.is_empty() {
        return Err(PrdError::InvalidQuickFormat(input.to_string()));
    }

    let mut tokens = tail.split_whitespace();
    let role_token = tokens.next().unwrap_or_default();
    let role: Role = role_token
        .parse()
        .map_err(|_| PrdError::InvalidRole(role_token.to_string()))?;

    let priority = match tokens.next() {
        Some(token) => Some(parse_priority(token)?),
        None => None,
    };
    if tokens.next().is_some() {
        return Err(PrdError::InvalidQuickFormat(input.to_string()));
    }

    Ok(QuickForm {
        title: title.to_string(),
        description: description.to_string(),
        role,
        priority,
    })
}

fn parse_priority(token: &str) -> Result<u32, PrdError> {
    match token.parse::<i64>() {
        Ok(v) if v > 0 => Ok(v as u32),
        _ => Err(PrdError::InvalidPriority(token.to_string())),
    }
}

/// Re-derive the right stage for sessions carrying an out-of-set stage
///
/// Unknown stage strings deserialize to `await_product`; a session that
/// already has a product name cannot legitimately be there, so the clarity
/// evaluator's recommendation takes over.
fn normalize_stage(session: &mut PrdSession) {
    if session.stage == Stage::AwaitProduct && !session.product_name.trim().is_empty() {
        let recommended = score::heuristic(session).recommended_stage;
        debug!(chat_id = session.chat_id, stage = %recommended, "Reset out-of-set stage");
        session.stage = recommended;
    }
}

async fn commit_story(
    session: &mut PrdSession,
    oracle: &Oracle,
    title: String,
    description: String,
    role: Role,
    manual: Option<u32>,
) -> String {
    let (priority_value, source) = priority::resolve(oracle, session, &title, &description, role, manual).await;
    let id = session.push_story(title.clone(), description, role, priority_value);
    debug!(chat_id = session.chat_id, %id, priority = priority_value, source = source.as_str(), "Committed story");

    session.stage = Stage::AwaitStoryTitle;
    format!(
        "Story {} added: \"{}\" ({}, priority {}, {}).\n{}",
        id,
        title,
        role,
        priority_value,
        match source {
            PrioritySource::Manual => "as given",
            PrioritySource::Codex => "estimated",
            PrioritySource::FallbackRoleProfile => "role default",
        },
        prompt_for(Stage::AwaitStoryTitle)
    )
}

/// Process one deterministic turn; the reply re-prompts for the next stage
///
/// Oracle use here is limited to priority resolution when a story commits;
/// the caller holds no store lock across this call.
pub async fn handle_input(session: &mut PrdSession, input: &str, oracle: &Oracle) -> Result<String, PrdError> {
    normalize_stage(session);

    let input = input.trim();
    if input.is_empty() {
        return Ok(prompt_for(session.stage).to_string());
    }

    match session.stage {
        Stage::AwaitProduct => {
            session.product_name = input.to_string();
            session.touch();
            session.stage = score::heuristic(session).recommended_stage;
            Ok(format!("Working on \"{}\". {}", input, prompt_for(session.stage)))
        }

        Stage::AwaitProblem
        | Stage::AwaitGoal
        | Stage::AwaitInScope
        | Stage::AwaitOutOfScope
        | Stage::AwaitAcceptance
        | Stage::AwaitConstraints => {
            let field = match session.stage {
                Stage::AwaitProblem => ContextField::Problem,
                Stage::AwaitGoal => ContextField::Goal,
                Stage::AwaitInScope => ContextField::InScope,
                Stage::AwaitOutOfScope => ContextField::OutOfScope,
                Stage::AwaitAcceptance => ContextField::Acceptance,
                _ => ContextField::Constraints,
            };
            session.set_context_field(field, input);
            session.stage = score::heuristic(session).recommended_stage;

            let ack = if crate::session::is_assumed(session.context.get(field)) {
                format!("Assumed a default for {} (replace it later for full readiness). ", field.key())
            } else {
                String::new()
            };
            Ok(format!("{}{}", ack, prompt_for(session.stage)))
        }

        Stage::AwaitStoryTitle => {
            if input.contains('|') {
                let quick = parse_quick_form(input)?;
                return Ok(commit_story(session, oracle, quick.title, quick.description, quick.role, quick.priority).await);
            }
            session.draft_title = Some(input.to_string());
            session.stage = Stage::AwaitStoryDesc;
            session.touch();
            Ok(prompt_for(Stage::AwaitStoryDesc).to_string())
        }

        Stage::AwaitStoryDesc => {
            session.draft_desc = Some(input.to_string());
            session.stage = Stage::AwaitStoryRole;
            session.touch();
            Ok(prompt_for(Stage::AwaitStoryRole).to_string())
        }

        Stage::AwaitStoryRole => {
            let mut tokens = input.split_whitespace();
            let role_token = tokens.next().unwrap_or_default();
            let role: Role = role_token
                .parse()
                .map_err(|_| PrdError::InvalidRole(role_token.to_string()))?;
            let manual = match tokens.next() {
                Some(token) => Some(parse_priority(token)?),
                None => None,
            };

            let title = session.draft_title.clone().ok_or(PrdError::IncompleteDraft("title"))?;
            let description = session.draft_desc.clone().ok_or(PrdError::IncompleteDraft("description"))?;
            Ok(commit_story(session, oracle, title, description, role, manual).await)
        }

        Stage::AwaitStoryPriority => {
            let manual = if matches!(input.to_lowercase().as_str(), "default" | "skip") {
                None
            } else {
                Some(parse_priority(input)?)
            };

            let title = session.draft_title.clone().ok_or(PrdError::IncompleteDraft("title"))?;
            let description = session.draft_desc.clone().ok_or(PrdError::IncompleteDraft("description"))?;
            let role = session.draft_role.ok_or(PrdError::IncompleteDraft("role"))?;
            Ok(commit_story(session, oracle, title, description, role, manual).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_product_then_context_flow() {
        let mut s = PrdSession::new(1);
        let oracle = Oracle::disabled();

        handle_input(&mut s, "Wallet", &oracle).await.unwrap();
        assert_eq!(s.product_name, "Wallet");
        assert_eq!(s.stage, Stage::AwaitProblem);

        handle_input(&mut s, "payments fail silently", &oracle).await.unwrap();
        assert_eq!(s.stage, Stage::AwaitGoal);
        assert_eq!(s.context.problem, "payments fail silently");
    }

    #[tokio::test]
    async fn test_skip_advances_but_is_revisited() {
        let mut s = PrdSession::new(1);
        let oracle = Oracle::disabled();

        handle_input(&mut s, "Wallet", &oracle).await.unwrap();
        let reply = handle_input(&mut s, "skip", &oracle).await.unwrap();
        assert!(reply.contains("Assumed a default"));
        // Flow continues to the next empty field, not back to problem yet
        assert_eq!(s.stage, Stage::AwaitGoal);
        assert_eq!(s.assumptions.len(), 1);
    }

    #[tokio::test]
    async fn test_skipped_constraints_still_reaches_story_intake() {
        let mut s = PrdSession::new(1);
        let oracle = Oracle::disabled();

        handle_input(&mut s, "Wallet", &oracle).await.unwrap();
        for answer in [
            "payments fail silently",
            "recover 95% of failures",
            "retry pipeline",
            "refunds",
            "retried within 5 minutes",
        ] {
            handle_input(&mut s, answer, &oracle).await.unwrap();
        }
        assert_eq!(s.stage, Stage::AwaitConstraints);

        // The prompt invites a skip; it must not trap the flow in a re-ask
        handle_input(&mut s, "skip", &oracle).await.unwrap();
        assert_eq!(s.stage, Stage::AwaitStoryTitle);

        handle_input(&mut s, "retry | retry failed payments | developer", &oracle)
            .await
            .unwrap();
        assert_eq!(s.stories.len(), 1);
    }

    #[tokio::test]
    async fn test_quick_form_appends_story_and_stays() {
        let mut s = PrdSession::new(1);
        s.product_name = "Wallet".into();
        s.stage = Stage::AwaitStoryTitle;
        let oracle = Oracle::disabled();

        let reply = handle_input(&mut s, "결제 실패 자동 복구 | 실패시 재시도와 알림 | developer", &oracle)
            .await
            .unwrap();
        assert!(reply.contains("added"));
        assert_eq!(s.stories.len(), 1);
        assert_eq!(s.stories[0].title, "결제 실패 자동 복구");
        assert_eq!(s.stories[0].role, Role::Developer);
        assert_eq!(s.stories[0].priority, 1000); // auto-resolved role default
        assert_eq!(s.stage, Stage::AwaitStoryTitle);
    }

    #[tokio::test]
    async fn test_quick_form_with_manual_priority() {
        let mut s = PrdSession::new(1);
        s.stage = Stage::AwaitStoryTitle;
        let oracle = Oracle::disabled();

        handle_input(&mut s, "retry | retry failed payments | qa 42", &oracle)
            .await
            .unwrap();
        assert_eq!(s.stories[0].priority, 42);
    }

    #[tokio::test]
    async fn test_bad_quick_form_keeps_stage() {
        let mut s = PrdSession::new(1);
        s.stage = Stage::AwaitStoryTitle;
        let oracle = Oracle::disabled();

        let err = handle_input(&mut s, "only-title | no role part", &oracle).await.unwrap_err();
        assert!(matches!(err, PrdError::InvalidQuickFormat(_)));
        assert_eq!(s.stage, Stage::AwaitStoryTitle);
        assert!(s.stories.is_empty());
    }

    #[tokio::test]
    async fn test_bad_role_keeps_stage() {
        let mut s = PrdSession::new(1);
        s.stage = Stage::AwaitStoryTitle;
        let oracle = Oracle::disabled();

        handle_input(&mut s, "retry payments", &oracle).await.unwrap();
        handle_input(&mut s, "retry with backoff", &oracle).await.unwrap();
        assert_eq!(s.stage, Stage::AwaitStoryRole);

        let err = handle_input(&mut s, "ops", &oracle).await.unwrap_err();
        assert!(matches!(err, PrdError::InvalidRole(_)));
        assert_eq!(s.stage, Stage::AwaitStoryRole);

        // Legacy numeric alias works
        handle_input(&mut s, "3", &oracle).await.unwrap();
        assert_eq!(s.stories.len(), 1);
        assert_eq!(s.stories[0].role, Role::Developer);
        assert_eq!(s.stage, Stage::AwaitStoryTitle);
    }

    #[tokio::test]
    async fn test_non_positive_priority_rejected() {
        let mut s = PrdSession::new(1);
        s.stage = Stage::AwaitStoryTitle;
        let oracle = Oracle::disabled();

        let err = handle_input(&mut s, "t | d | qa 0", &oracle).await.unwrap_err();
        assert!(matches!(err, PrdError::InvalidPriority(_)));
        assert!(s.stories.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_priority_stage_default_resolves() {
        let mut s = PrdSession::new(1);
        s.draft_title = Some("retry".into());
        s.draft_desc = Some("with backoff".into());
        s.draft_role = Some(Role::Qa);
        s.stage = Stage::AwaitStoryPriority;
        let oracle = Oracle::disabled();

        handle_input(&mut s, "default", &oracle).await.unwrap();
        assert_eq!(s.stories.len(), 1);
        assert_eq!(s.stories[0].priority, 1100);
        assert_eq!(s.stage, Stage::AwaitStoryTitle);
    }

    #[tokio::test]
    async fn test_priority_stage_without_draft_role_errors() {
        let mut s = PrdSession::new(1);
        s.draft_title = Some("retry".into());
        s.draft_desc = Some("with backoff".into());
        s.stage = Stage::AwaitStoryPriority;
        let oracle = Oracle::disabled();

        let err = handle_input(&mut s, "500", &oracle).await.unwrap_err();
        assert!(matches!(err, PrdError::IncompleteDraft("role")));
        assert_eq!(s.stage, Stage::AwaitStoryPriority);
    }

    #[tokio::test]
    async fn test_out_of_set_stage_resets_to_recommendation() {
        let mut s = PrdSession::new(1);
        s.product_name = "Wallet".into();
        s.context.problem = "payments fail".into();
        // Simulates an unknown stage string read from disk
        s.stage = Stage::AwaitProduct;
        let oracle = Oracle::disabled();

        handle_input(&mut s, "faster recovery", &oracle).await.unwrap();
        // Landed on goal (the first empty field), not on product
        assert_eq!(s.context.goal, "faster recovery");
        assert_eq!(s.product_name, "Wallet");
    }

    #[tokio::test]
    async fn test_empty_input_reprompts_without_mutation() {
        let mut s = PrdSession::new(1);
        let oracle = Oracle::disabled();

        let reply = handle_input(&mut s, "   ", &oracle).await.unwrap();
        assert_eq!(reply, prompt_for(Stage::AwaitProduct));
        assert_eq!(s.stage, Stage::AwaitProduct);
    }
}

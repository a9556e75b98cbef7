//! Story priority resolution
//!
//! Manual priorities are stored as given. Auto-resolved priorities come from
//! the oracle estimator, clamped to [100, 3000]; any failure falls back to
//! the session's per-role override (or the fixed role default).

use tracing::debug;

use crate::oracle::{Oracle, PriorityRequest, with_linear_backoff};
use crate::session::{PrdSession, Role};

/// Clamp bounds for oracle-estimated priorities
pub const PRIORITY_MIN: u32 = 100;
pub const PRIORITY_MAX: u32 = 3000;

const PRIORITY_RETRIES: u32 = 3;
const PRIORITY_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

/// Where a story's priority came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioritySource {
    /// User-supplied, stored as given
    Manual,
    /// Oracle estimate, clamped
    Codex,
    /// Session override or fixed role default
    FallbackRoleProfile,
}

impl PrioritySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrioritySource::Manual => "manual",
            PrioritySource::Codex => "codex",
            PrioritySource::FallbackRoleProfile => "fallback_role_profile",
        }
    }
}

/// Resolve a priority for a story under construction
///
/// `manual` bypasses resolution entirely. Otherwise the oracle estimator is
/// tried (bounded retries); failures and non-positive estimates fall back to
/// the role profile.
pub async fn resolve(
    oracle: &Oracle,
    session: &PrdSession,
    title: &str,
    description: &str,
    role: Role,
    manual: Option<u32>,
) -> (u32, PrioritySource) {
    if let Some(value) = manual {
        return (value, PrioritySource::Manual);
    }

    if let Some(call) = oracle.priority.as_ref() {
        let req = PriorityRequest {
            title: title.to_string(),
            description: description.to_string(),
            role: role.as_str().to_string(),
            product: session.product_name.clone(),
        };
        match with_linear_backoff(PRIORITY_RETRIES, PRIORITY_RETRY_DELAY, || call(req.clone())).await {
            Ok(resp) if resp.priority > 0 => {
                let clamped = (resp.priority as u64).clamp(PRIORITY_MIN as u64, PRIORITY_MAX as u64) as u32;
                debug!(raw = resp.priority, clamped, reason = %resp.reason, "Oracle priority estimate");
                return (clamped, PrioritySource::Codex);
            }
            Ok(resp) => {
                debug!(raw = resp.priority, "Oracle priority non-positive, using role profile");
            }
            Err(e) => {
                debug!(category = %e.category, "Oracle priority failed, using role profile");
            }
        }
    }

    (session.role_priority(role), PrioritySource::FallbackRoleProfile)
}

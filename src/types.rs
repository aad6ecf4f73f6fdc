use chrono::{DateTime, Utc};

use crate::data::{EndpointStat, User};

/// What a user sees about their own account.
#[derive(serde::Serialize, Debug)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub is_admin: bool,
    pub api_calls_used: i64,
}

impl From<&User> for Account {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            is_admin: user.is_admin,
            api_calls_used: user.api_calls_used,
        }
    }
}

#[derive(serde::Serialize, Debug)]
pub struct Profile {
    #[serde(flatten)]
    pub account: Account,
    pub api_calls_remaining: u64,
}

impl Profile {
    #[must_use]
    pub fn new(user: &User, free_calls: u64) -> Self {
        let used = u64::try_from(user.api_calls_used).unwrap_or(0);
        Self {
            account: Account::from(user),
            api_calls_remaining: free_calls.saturating_sub(used),
        }
    }
}

/// Row of the admin user list.
#[derive(serde::Serialize, Debug)]
pub struct UserSummary {
    #[serde(flatten)]
    pub account: Account,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            account: Account::from(user),
            created_at: user.created_at,
        }
    }
}

#[derive(serde::Serialize, Debug)]
pub struct UserStats {
    pub id: i64,
    pub email: String,
    pub total_requests: i64,
    pub endpoint_breakdown: Vec<EndpointStat>,
}

impl UserStats {
    /// Falls back to the running counter when there is no breakdown, e.g.
    /// for calls made before per-endpoint tracking existed.
    #[must_use]
    pub fn new(user: &User, endpoint_breakdown: Vec<EndpointStat>) -> Self {
        let total: i64 =
            endpoint_breakdown.iter().map(|e| e.request_count).sum();
        Self {
            id: user.id,
            email: user.email.clone(),
            total_requests: if total == 0 { user.api_calls_used } else { total },
            endpoint_breakdown,
        }
    }
}

#[derive(serde::Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub success: bool,
    pub response: String,
    pub has_exceeded_limit: bool,
    pub api_calls_remaining: u64,
    pub api_calls_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// User service request bodies
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct UpdateUserRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// User as returned by the backend (never carries the password)
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct UserResponse {
    pub id: u32,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

// Pagination query for the list endpoint
#[derive(Deserialize, Debug, Default)]
pub struct ListUsersQuery {
    pub page: Option<String>,
    pub page_size: Option<String>,
}

impl ListUsersQuery {
    pub fn page(&self) -> u32 {
        parse_or(self.page.as_deref(), 1)
    }

    pub fn page_size(&self) -> u32 {
        parse_or(self.page_size.as_deref(), 10)
    }
}

fn parse_or(value: Option<&str>, default: u32) -> u32 {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

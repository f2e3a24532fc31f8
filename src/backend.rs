//! Clients for the user service sitting behind the gateway.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::normalize_base_url;
use crate::models::{CreateUserRequest, UpdateUserRequest, UserResponse};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("user service returned status {0}")]
    Status(u16),

    #[error("user {0} not found")]
    NotFound(u32),
}

#[async_trait]
pub trait UserService: Send + Sync {
    async fn create_user(&self, req: &CreateUserRequest) -> Result<UserResponse, BackendError>;

    async fn get_user(&self, id: u32) -> Result<UserResponse, BackendError>;

    async fn update_user(&self, id: u32, req: &UpdateUserRequest) -> Result<UserResponse, BackendError>;

    async fn delete_user(&self, id: u32) -> Result<(), BackendError>;

    async fn list_users(&self, page: u32, page_size: u32) -> Result<Vec<UserResponse>, BackendError>;
}

/// Forwards every call to the user service over HTTP.
pub struct HttpUserService {
    client: Client,
    base_url: String,
}

impl HttpUserService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            debug!(status = status.as_u16(), "User service returned an error status");
            return Err(BackendError::Status(status.as_u16()));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        Ok(self.send(request).await?.json::<T>().await?)
    }
}

#[async_trait]
impl UserService for HttpUserService {
    async fn create_user(&self, req: &CreateUserRequest) -> Result<UserResponse, BackendError> {
        self.send_json(self.client.post(self.url("/users")).json(req)).await
    }

    async fn get_user(&self, id: u32) -> Result<UserResponse, BackendError> {
        self.send_json(self.client.get(self.url(&format!("/users/{}", id))))
            .await
    }

    async fn update_user(&self, id: u32, req: &UpdateUserRequest) -> Result<UserResponse, BackendError> {
        self.send_json(self.client.put(self.url(&format!("/users/{}", id))).json(req))
            .await
    }

    async fn delete_user(&self, id: u32) -> Result<(), BackendError> {
        self.send(self.client.delete(self.url(&format!("/users/{}", id))))
            .await
            .map(|_| ())
    }

    async fn list_users(&self, page: u32, page_size: u32) -> Result<Vec<UserResponse>, BackendError> {
        let path = format!("/users?page={}&page_size={}", page, page_size);
        self.send_json(self.client.get(self.url(&path))).await
    }
}

struct MockUsers {
    users: BTreeMap<u32, UserResponse>,
    next_id: u32,
}

/// In-memory stand-in for the user service, seeded with two users.
pub struct MockUserService {
    inner: Mutex<MockUsers>,
}

impl MockUserService {
    pub fn new() -> Self {
        let mut users = BTreeMap::new();
        for (id, username, email) in [
            (1, "john_doe", "john@example.com"),
            (2, "jane_smith", "jane@example.com"),
        ] {
            users.insert(id, mock_user(id, username, email));
        }

        Self {
            inner: Mutex::new(MockUsers { users, next_id: 3 }),
        }
    }
}

impl Default for MockUserService {
    fn default() -> Self {
        Self::new()
    }
}

fn mock_user(id: u32, username: &str, email: &str) -> UserResponse {
    let now = Utc::now();
    UserResponse {
        id,
        username: username.to_string(),
        email: email.to_string(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl UserService for MockUserService {
    async fn create_user(&self, req: &CreateUserRequest) -> Result<UserResponse, BackendError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let user = mock_user(id, &req.username, &req.email);
        inner.users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: u32) -> Result<UserResponse, BackendError> {
        self.inner
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or(BackendError::NotFound(id))
    }

    async fn update_user(&self, id: u32, req: &UpdateUserRequest) -> Result<UserResponse, BackendError> {
        let mut inner = self.inner.lock();
        let user = inner.users.get_mut(&id).ok_or(BackendError::NotFound(id))?;

        if let Some(username) = &req.username {
            user.username = username.clone();
        }
        if let Some(email) = &req.email {
            user.email = email.clone();
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn delete_user(&self, id: u32) -> Result<(), BackendError> {
        self.inner
            .lock()
            .users
            .remove(&id)
            .map(|_| ())
            .ok_or(BackendError::NotFound(id))
    }

    async fn list_users(&self, page: u32, page_size: u32) -> Result<Vec<UserResponse>, BackendError> {
        let skip = page.saturating_sub(1).saturating_mul(page_size) as usize;
        Ok(self
            .inner
            .lock()
            .users
            .values()
            .skip(skip)
            .take(page_size as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_seeded_users() {
        let service = MockUserService::new();
        assert_eq!(service.get_user(1).await.unwrap().username, "john_doe");
        assert_eq!(service.get_user(2).await.unwrap().username, "jane_smith");
        assert!(matches!(service.get_user(9).await, Err(BackendError::NotFound(9))));
    }

    #[tokio::test]
    async fn test_mock_create_update_delete() {
        let service = MockUserService::new();
        let created = service
            .create_user(&CreateUserRequest {
                username: "new_user".into(),
                email: "new@example.com".into(),
                password: "hunter22".into(),
            })
            .await
            .unwrap();
        assert_eq!(created.id, 3);

        let updated = service
            .update_user(
                3,
                &UpdateUserRequest {
                    email: Some("changed@example.com".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.username, "new_user");
        assert_eq!(updated.email, "changed@example.com");

        service.delete_user(3).await.unwrap();
        assert!(service.delete_user(3).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_pagination() {
        let service = MockUserService::new();
        assert_eq!(service.list_users(1, 10).await.unwrap().len(), 2);

        let second = service.list_users(2, 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, 2);

        assert!(service.list_users(3, 1).await.unwrap().is_empty());
    }

    #[test]
    fn test_http_service_normalizes_base_url() {
        let service = HttpUserService::new("localhost:8081/", Duration::from_secs(5)).unwrap();
        assert_eq!(service.url("/users"), "http://localhost:8081/users");
    }
}

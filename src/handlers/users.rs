use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::models::{CreateUserRequest, ListUsersQuery, UpdateUserRequest, UserResponse};
use crate::state::AppState;

fn parse_user_id(raw: &str) -> Result<u32, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest("invalid user ID".to_string()))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let req = body(payload)?;
    let user = state
        .users
        .create_user(&req)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to create user: {}", e)))?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    let id = parse_user_id(&id)?;
    // any backend failure is reported as a missing user
    let user = state
        .users
        .get_user(id)
        .await
        .map_err(|e| ApiError::NotFound(format!("failed to get user: {}", e)))?;
    Ok(Json(user))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<UserResponse>, ApiError> {
    let id = parse_user_id(&id)?;
    let req = body(payload)?;
    let user = state
        .users
        .update_user(id, &req)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to update user: {}", e)))?;
    Ok(Json(user))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_user_id(&id)?;
    state
        .users
        .delete_user(id)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to delete user: {}", e)))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    let users = state
        .users
        .list_users(query.page(), query.page_size())
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to list users: {}", e)))?;
    Ok(Json(users))
}

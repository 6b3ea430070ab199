//! Read-only persona endpoints. Unlike session lookups, an unknown id here
//! is a 404 rather than a fallback to the default persona.

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct CharacterQuery {
    pub category: Option<String>,
}

pub async fn list_characters(
    state: web::Data<AppState>,
    query: web::Query<CharacterQuery>,
) -> AppResult<HttpResponse> {
    let characters: Vec<_> = state
        .personas
        .list()
        .into_iter()
        .filter(|persona| {
            query
                .category
                .as_deref()
                .map_or(true, |category| persona.category.eq_ignore_ascii_case(category))
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "default": state.personas.default_id(),
        "count": characters.len(),
        "characters": characters
    })))
}

pub async fn get_character(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let id = path.into_inner();
    let persona = state
        .personas
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Character not found: {}", id)))?;

    Ok(HttpResponse::Ok().json(persona))
}

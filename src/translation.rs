//! Schnittstelle zum Übersetzungsdienst
//!
//! Der Dienst selbst ist extern. Hier liegen nur Request/Response, der
//! Fehlertyp (mit dem unübersetzten bzw. teilweisen Ergebnis) und ein
//! Timeout-Wrapper.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationRequest {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}

impl TranslationRequest {
    pub fn new(
        text: impl Into<String>,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            source_language: source_language.into(),
            target_language: target_language.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationResponse {
    pub translated_text: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
}

/// Inhalt einer `translation` Nachricht auf dem Data Channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationPayload {
    pub original_text: String,
    pub translated_text: String,
    pub source_language: String,
    pub target_language: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
}

impl TranslationPayload {
    pub fn from_result(request: &TranslationRequest, response: &TranslationResponse) -> Self {
        Self {
            original_text: request.text.clone(),
            translated_text: response.translated_text.clone(),
            source_language: response
                .detected_language
                .clone()
                .unwrap_or_else(|| request.source_language.clone()),
            target_language: request.target_language.clone(),
            confidence: response.confidence,
            speaker_id: None,
        }
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler des Übersetzungsdienstes, immer mit dem Ausgangstext
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationServiceError {
    #[error("Translation service unavailable: {reason}")]
    Unavailable {
        reason: String,
        request: TranslationRequest,
    },

    #[error("Translation timed out after {timeout_ms}ms")]
    Timeout {
        timeout_ms: u64,
        request: TranslationRequest,
    },

    #[error("Translation incomplete: {reason}")]
    Partial {
        reason: String,
        request: TranslationRequest,
        partial: TranslationResponse,
    },
}

impl TranslationServiceError {
    pub fn request(&self) -> &TranslationRequest {
        match self {
            TranslationServiceError::Unavailable { request, .. }
            | TranslationServiceError::Timeout { request, .. }
            | TranslationServiceError::Partial { request, .. } => request,
        }
    }

    /// Der unübersetzte Text
    pub fn untranslated_text(&self) -> &str {
        &self.request().text
    }

    /// Teilergebnis, falls der Dienst eins geliefert hat
    pub fn partial(&self) -> Option<&TranslationResponse> {
        match self {
            TranslationServiceError::Partial { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Bester verfügbarer Text: Teilübersetzung oder Original
    pub fn best_effort_text(&self) -> &str {
        self.partial()
            .map(|p| p.translated_text.as_str())
            .unwrap_or_else(|| self.untranslated_text())
    }
}

// ============================================================================
// SERVICE TRAIT
// ============================================================================

#[async_trait]
pub trait TranslationService: Send + Sync {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<TranslationResponse, TranslationServiceError>;
}

/// Ruft den Dienst mit einer Obergrenze für die Wartezeit auf
pub async fn translate_with_timeout(
    service: &dyn TranslationService,
    request: &TranslationRequest,
    timeout: Duration,
) -> Result<TranslationResponse, TranslationServiceError> {
    match tokio::time::timeout(timeout, service.translate(request)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                "Translation {} -> {} timed out after {:?}",
                request.source_language,
                request.target_language,
                timeout
            );
            Err(TranslationServiceError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
                request: request.clone(),
            })
        }
    }
}

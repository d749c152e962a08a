use std::fmt;

use anyhow::Error;
use serde::Serialize;
use serde_json::Value;

/// Fatal configuration and reference failures.
///
/// Every kind owns a distinct process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    CheckpointNotFound,
    SamplerNotFound,
    UpscalerNotFound,
    StyleNotFound,
    ControlNetModelNotFound,
    ControlNetModuleNotFound,
    AdetailerModelNotFound,
    InvalidPatternToken,
    InvalidBackendToken,
    SamplerMismatch,
    InvalidOverlay,
}

impl FatalKind {
    pub fn exit_code(self) -> i32 {
        match self {
            FatalKind::CheckpointNotFound => 10,
            FatalKind::SamplerNotFound => 12,
            FatalKind::UpscalerNotFound => 13,
            FatalKind::StyleNotFound => 14,
            FatalKind::ControlNetModelNotFound => 15,
            FatalKind::ControlNetModuleNotFound => 16,
            FatalKind::AdetailerModelNotFound => 17,
            FatalKind::InvalidPatternToken => 20,
            FatalKind::InvalidBackendToken => 21,
            FatalKind::SamplerMismatch => 22,
            FatalKind::InvalidOverlay => 23,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            FatalKind::CheckpointNotFound => "checkpoint_not_found",
            FatalKind::SamplerNotFound => "sampler_not_found",
            FatalKind::UpscalerNotFound => "upscaler_not_found",
            FatalKind::StyleNotFound => "style_not_found",
            FatalKind::ControlNetModelNotFound => "controlnet_model_not_found",
            FatalKind::ControlNetModuleNotFound => "controlnet_module_not_found",
            FatalKind::AdetailerModelNotFound => "adetailer_model_not_found",
            FatalKind::InvalidPatternToken => "invalid_pattern_token",
            FatalKind::InvalidBackendToken => "invalid_backend_token",
            FatalKind::SamplerMismatch => "sampler_mismatch",
            FatalKind::InvalidOverlay => "invalid_overlay",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodedError {
    pub kind: FatalKind,
    pub message: String,
    pub details: Option<Value>,
}

impl CodedError {
    pub fn new(kind: FatalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.kind.code().to_string(),
                exit_code: self.exit_code(),
                message: self.message.clone(),
                details: self.details.clone(),
            },
        }
    }
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for CodedError {}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub exit_code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Error {
    Error::new(CodedError::new(kind, message))
}

pub fn find_coded_error(error: &Error) -> Option<&CodedError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<CodedError>())
}

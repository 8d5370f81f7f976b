//! Allowed model map: the set of model ids the gateway
//! accepts, plus the two virtual models that override the default tool
//! set.

pub const MODEL_GEMINI_IMAGEN: &str = "gemini-imagen";
pub const MODEL_GEMINI_VEO: &str = "gemini-veo";

pub const ALLOWED_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.5-pro",
    MODEL_GEMINI_IMAGEN,
    MODEL_GEMINI_VEO,
];

pub fn is_known_model(model_id: &str) -> bool {
    ALLOWED_MODELS.contains(&model_id)
}

pub fn is_virtual_model(model_id: &str) -> bool {
    matches!(model_id, MODEL_GEMINI_IMAGEN | MODEL_GEMINI_VEO)
}

/// Virtual models translate to a tools spec that overrides, and mutually
/// excludes, the default tool set.
pub fn tools_spec_for_model(model_id: &str) -> serde_json::Value {
    match model_id {
        MODEL_GEMINI_IMAGEN => serde_json::json!({"imageGenerationSpec": {}}),
        MODEL_GEMINI_VEO => serde_json::json!({"videoGenerationSpec": {}}),
        _ => serde_json::json!({"webGroundingSpec": {}}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_models_override_default_tools() {
        assert_eq!(
            tools_spec_for_model(MODEL_GEMINI_IMAGEN),
            serde_json::json!({"imageGenerationSpec": {}})
        );
        assert_eq!(
            tools_spec_for_model("gemini-2.5-flash"),
            serde_json::json!({"webGroundingSpec": {}})
        );
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert!(!is_known_model("not-a-real-model"));
    }
}

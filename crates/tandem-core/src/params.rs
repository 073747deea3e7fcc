use serde::{Deserialize, Serialize};

/// Per-call training hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningParams {
    /// Step size of the gradient update.
    pub learning_rate: f32,
    /// Rescale input-side deltas of every non-first layer to `learning_rate / max|delta|`.
    pub normalize: bool,
}

impl LearningParams {
    pub fn new(learning_rate: f32, normalize: bool) -> Self {
        Self {
            learning_rate,
            normalize,
        }
    }
}

impl Default for LearningParams {
    fn default() -> Self {
        Self::new(0.1, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let params: LearningParams = serde_json::from_str(r#"{ "normalize": true }"#).unwrap();
        assert_eq!(params, LearningParams::new(0.1, true));

        let json = serde_json::to_string(&LearningParams::new(0.5, false)).unwrap();
        assert_eq!(json, r#"{"learning_rate":0.5,"normalize":false}"#);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_max_output_chars() -> usize {
    2000
}

/// One sandbox step: run `code` against `context`/`query` plus the carried
/// `state`, and hand back the next `state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub context: String,
    pub query: String,
    pub code: String,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResponse {
    pub ok: bool,
    pub output: String,
    pub error: Option<String>,
    pub state: Value,
}

impl StepResponse {
    pub fn failure(error: impl Into<String>, state: Value) -> Self {
        Self {
            ok: false,
            output: String::new(),
            error: Some(error.into()),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_apply() {
        let request: StepRequest =
            serde_json::from_str(r#"{"context":"c","query":"q","code":"print(1)"}"#).unwrap();
        assert_eq!(request.max_output_chars, 2000);
        assert!(request.state.is_none());
    }

    #[test]
    fn response_round_trips() {
        let response = StepResponse {
            ok: true,
            output: "42\n".to_owned(),
            error: None,
            state: serde_json::json!({"x": 1}),
        };
        let raw = serde_json::to_string(&response).unwrap();
        let back: StepResponse = serde_json::from_str(&raw).unwrap();
        assert!(back.ok);
        assert_eq!(back.output, "42\n");
        assert_eq!(back.state["x"], 1);
    }
}

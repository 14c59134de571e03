//! Wire contract between the driver (inside the sandbox) and the host.
//!
//! The driver is configured only through the environment variables below and
//! reports through exactly one JSON file in its output directory. The host
//! treats the absence of that file as a driver crash.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RESULT_FILE_NAME: &str = "result.json";

pub const ENV_MODE: &str = "SANDRUN_MODE";
pub const ENV_PAYLOAD: &str = "SANDRUN_PAYLOAD";
pub const ENV_DATASET: &str = "SANDRUN_DATASET";
pub const ENV_OUT_DIR: &str = "SANDRUN_OUT_DIR";
pub const ENV_QUERY_STEP_BUDGET: &str = "SANDRUN_QUERY_STEP_BUDGET";
pub const ENV_DRIVER_LOG: &str = "SANDRUN_DRIVER_LOG";

/// Well-known variable a script assigns to hand back a structured value.
pub const RETURN_VARIABLE: &str = "output_data";
/// Well-known name the dataset is bound to inside a script.
pub const DATASET_VARIABLE: &str = "df";

/// Prefix of `error` when the driver itself failed rather than the payload.
pub const INTERNAL_ERROR_PREFIX: &str = "InternalError: ";

/// Extensions the driver reports as artifacts.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultProtocol {
    pub stdout: String,
    pub error: String,
    #[serde(default)]
    pub return_obj: Option<Value>,
    #[serde(default)]
    pub plots: Vec<String>,
}

impl ResultProtocol {
    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn internal_error(&self) -> Option<&str> {
        self.error.strip_prefix(INTERNAL_ERROR_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_reference_shape() {
        let raw = r#"{"stdout":"hi\n","error":"","return_obj":{"a":[1,2]},"plots":["chart.png"]}"#;
        let parsed: ResultProtocol = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.stdout, "hi\n");
        assert!(!parsed.has_error());
        assert_eq!(parsed.return_obj, Some(json!({"a": [1, 2]})));
        assert_eq!(parsed.plots, vec!["chart.png".to_string()]);
    }

    #[test]
    fn test_null_return_and_missing_plots() {
        let parsed: ResultProtocol =
            serde_json::from_str(r#"{"stdout":"","error":"boom","return_obj":null}"#).unwrap();
        assert!(parsed.has_error());
        assert!(parsed.return_obj.is_none());
        assert!(parsed.plots.is_empty());
    }

    #[test]
    fn test_rejects_wrong_types() {
        assert!(serde_json::from_str::<ResultProtocol>(r#"{"stdout":1,"error":""}"#).is_err());
        assert!(serde_json::from_str::<ResultProtocol>(r#"{"error":""}"#).is_err());
        assert!(
            serde_json::from_str::<ResultProtocol>(r#"{"stdout":"","error":"","extra":true}"#)
                .is_err()
        );
    }
}

//! Task-solver body rewrite
//!
//! Some task-solver upstreams expect the account credentials inside the JSON
//! body and a provider-specific `task.type`. For those models the body is
//! rewritten before forwarding:
//!
//! ```text
//! in:  {"task": {"websiteURL": "..."}}            headers: appId, clientKey
//! out: {"appId": "..", "clientKey": "..",
//!       "task": {"websiteURL": "...", "type": "AntiTurnstileTaskProxyLess"}}
//! ```
//!
//! The credential entries are removed from the outbound header overlay once
//! they have been moved into the body.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::ForwardError;

/// Model name to upstream `task.type`
pub const TASK_TYPES: &[(&str, &str)] = &[
    ("CapchaTurnstileTask", "AntiTurnstileTaskProxyLess"),
    ("CapchaHCaptchaEnterpriseTask", "HCaptchaEnterpriseTaskProxyLess"),
    ("CapchaReCaptchaV2Task", "ReCaptchaV2TaskProxyLess"),
    ("CapchaReCaptchaV3Task", "ReCaptchaV3TaskProxyLess"),
    ("CapchaReCaptchaV2EnterpriseTask", "ReCaptchaV2EnterpriseTaskProxyLess"),
    ("CapchaReCaptchaV3EnterpriseTask", "ReCaptchaV3EnterpriseTaskProxyLess"),
    ("CapchaGeeTestTask", "GeeTestTaskProxyLess"),
    ("MTCaptchaTask", "MtCaptchaTaskProxyLess"),
    ("AwsWafTask", "AntiAwsWafTaskProxyLess"),
];

const MODEL_PREFIX: &str = "capcha";
const APP_ID: &str = "appId";
const CLIENT_KEY: &str = "clientKey";

/// Upstream task type for a model
#[must_use]
pub fn task_type_for(model: &str) -> Option<&'static str> {
    TASK_TYPES
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, task_type)| *task_type)
}

/// Whether requests for `model` go through the rewrite
#[must_use]
pub fn applies_to(model: &str) -> bool {
    let prefixed = model
        .get(..MODEL_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(MODEL_PREFIX));
    prefixed || task_type_for(model).is_some()
}

/// Rewrite a task request body for `model`
///
/// Moves `appId` and `clientKey` out of `credential_headers` into the body
/// (empty strings when absent) and stamps `task.type` when `task` is an
/// object.
///
/// # Errors
///
/// [`ForwardError::BadRequest`] when the body is not a JSON object, or when
/// `task` is an object but the model has no task type.
pub fn rewrite_task_body(
    model: &str,
    body: &[u8],
    credential_headers: &mut BTreeMap<String, String>,
) -> Result<Bytes, ForwardError> {
    let mut root: Map<String, Value> = serde_json::from_slice(body)
        .map_err(|e| ForwardError::BadRequest(format!("invalid JSON body: {e}")))?;

    if let Some(Value::Object(task)) = root.get_mut("task") {
        let task_type = task_type_for(model).ok_or_else(|| {
            ForwardError::BadRequest(format!("model {model} has no task type mapping"))
        })?;
        task.insert("type".to_string(), Value::String(task_type.to_string()));
    }

    let app_id = credential_headers.remove(APP_ID).unwrap_or_default();
    let client_key = credential_headers.remove(CLIENT_KEY).unwrap_or_default();
    root.insert(APP_ID.to_string(), Value::String(app_id));
    root.insert(CLIENT_KEY.to_string(), Value::String(client_key));

    let encoded = serde_json::to_vec(&root)
        .map_err(|e| ForwardError::Internal(format!("failed to encode body: {e}")))?;
    Ok(Bytes::from(encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn creds() -> BTreeMap<String, String> {
        BTreeMap::from([
            (APP_ID.to_string(), "app-1".to_string()),
            (CLIENT_KEY.to_string(), "key-1".to_string()),
            ("X-Extra".to_string(), "kept".to_string()),
        ])
    }

    #[test]
    fn test_applies_to() {
        assert!(applies_to("CapchaTurnstileTask"));
        assert!(applies_to("capchaSomethingNew"));
        assert!(applies_to("CAPCHA"));
        assert!(applies_to("MTCaptchaTask"));
        assert!(applies_to("AwsWafTask"));
        assert!(!applies_to("gpt-4o"));
        assert!(!applies_to("cap"));
    }

    #[test]
    fn test_rewrite_sets_type_and_moves_credentials() {
        let mut headers = creds();
        let body = json!({"task": {"websiteURL": "https://site"}, "callbackUrl": "x"});

        let out = rewrite_task_body(
            "CapchaTurnstileTask",
            &serde_json::to_vec(&body).unwrap(),
            &mut headers,
        )
        .unwrap();

        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            value,
            json!({
                "appId": "app-1",
                "clientKey": "key-1",
                "callbackUrl": "x",
                "task": {"websiteURL": "https://site", "type": "AntiTurnstileTaskProxyLess"}
            })
        );
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("X-Extra"));
    }

    #[test]
    fn test_every_mapping_is_applied() {
        for (model, task_type) in TASK_TYPES {
            let mut headers = BTreeMap::new();
            let out = rewrite_task_body(model, br#"{"task":{}}"#, &mut headers).unwrap();
            let value: Value = serde_json::from_slice(&out).unwrap();
            assert_eq!(value["task"]["type"], json!(task_type));
            assert_eq!(value["appId"], json!(""));
        }
    }

    #[test]
    fn test_unmapped_model_with_task_is_bad_request() {
        let mut headers = creds();
        let err = rewrite_task_body("capchaUnknown", br#"{"task":{"a":1}}"#, &mut headers)
            .unwrap_err();
        assert!(matches!(err, ForwardError::BadRequest(_)));
        // Nothing moved on failure
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_unmapped_model_without_task_only_moves_credentials() {
        let mut headers = creds();
        let out = rewrite_task_body("capchaGetBalance", br#"{"taskId":"t-9"}"#, &mut headers)
            .unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            value,
            json!({"taskId": "t-9", "appId": "app-1", "clientKey": "key-1"})
        );
    }

    #[test]
    fn test_non_object_body_is_bad_request() {
        let mut headers = creds();
        for body in [&b""[..], b"not json", b"[1,2]", b"\"str\""] {
            let err = rewrite_task_body("CapchaGeeTestTask", body, &mut headers).unwrap_err();
            assert!(matches!(err, ForwardError::BadRequest(_)));
        }
    }
}

//! InferenceService helpers: deployment classification and computed fields

use serde_json::Value;

use modelwatch_types::DeploymentMode;

pub const DEPLOYMENT_MODE_ANNOTATION: &str = "serving.kserve.io/deploymentMode";
pub const LEGACY_RAW_ANNOTATION: &str = "serving.kubeflow.org/raw";

/// Computed top-level field attached to every emitted InferenceService
pub const DEPLOYMENT_MODE_FIELD: &str = "deploymentMode";

fn annotation<'a>(isvc: &'a Value, key: &str) -> Option<&'a str> {
    isvc.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(key))
        .and_then(Value::as_str)
}

/// Classify an InferenceService from its annotations
pub fn deployment_mode(isvc: &Value) -> DeploymentMode {
    let mode = annotation(isvc, DEPLOYMENT_MODE_ANNOTATION)
        .unwrap_or_default()
        .to_lowercase();

    match mode.as_str() {
        "modelmesh" => DeploymentMode::ModelMesh,
        "rawdeployment" | "standard" => DeploymentMode::RawDeployment,
        _ if annotation(isvc, LEGACY_RAW_ANNOTATION)
            .is_some_and(|raw| raw.eq_ignore_ascii_case("true")) =>
        {
            DeploymentMode::RawDeployment
        }
        _ => DeploymentMode::Serverless,
    }
}

/// Attach the computed `deploymentMode` field; non-objects pass through untouched
pub fn with_deployment_mode(mut isvc: Value) -> Value {
    let mode = deployment_mode(&isvc);
    if let Some(fields) = isvc.as_object_mut() {
        fields.insert(
            DEPLOYMENT_MODE_FIELD.to_string(),
            Value::String(mode.as_str().to_string()),
        );
    }
    isvc
}

pub fn name(isvc: &Value) -> &str {
    isvc.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

pub fn namespace(isvc: &Value) -> &str {
    isvc.pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// `status.components.<component>.latestReadyRevision`
pub fn latest_ready_revision<'a>(isvc: &'a Value, component: &str) -> Option<&'a str> {
    isvc.get("status")?
        .get("components")?
        .get(component)?
        .get("latestReadyRevision")?
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn isvc_with(annotations: Value) -> Value {
        json!({"metadata": {"name": "flowers", "namespace": "ns", "annotations": annotations}})
    }

    #[test]
    fn test_modelmesh_mode() {
        let isvc = isvc_with(json!({DEPLOYMENT_MODE_ANNOTATION: "ModelMesh"}));
        assert_eq!(deployment_mode(&isvc), DeploymentMode::ModelMesh);
    }

    #[test]
    fn test_raw_modes() {
        let isvc = isvc_with(json!({DEPLOYMENT_MODE_ANNOTATION: "RawDeployment"}));
        assert_eq!(deployment_mode(&isvc), DeploymentMode::RawDeployment);

        let isvc = isvc_with(json!({DEPLOYMENT_MODE_ANNOTATION: "Standard"}));
        assert_eq!(deployment_mode(&isvc), DeploymentMode::RawDeployment);

        let isvc = isvc_with(json!({LEGACY_RAW_ANNOTATION: "TRUE"}));
        assert_eq!(deployment_mode(&isvc), DeploymentMode::RawDeployment);
    }

    #[test]
    fn test_default_is_serverless() {
        assert_eq!(deployment_mode(&json!({})), DeploymentMode::Serverless);
        let isvc = isvc_with(json!({LEGACY_RAW_ANNOTATION: "false"}));
        assert_eq!(deployment_mode(&isvc), DeploymentMode::Serverless);
    }

    #[test]
    fn test_with_deployment_mode_sets_field() {
        let isvc = with_deployment_mode(isvc_with(json!({DEPLOYMENT_MODE_ANNOTATION: "modelmesh"})));
        assert_eq!(isvc[DEPLOYMENT_MODE_FIELD], "ModelMesh");
        assert_eq!(with_deployment_mode(json!("text")), json!("text"));
    }

    #[test]
    fn test_latest_ready_revision() {
        let isvc = json!({
            "status": {"components": {"predictor": {"latestReadyRevision": "flowers-predictor-00001"}}}
        });
        assert_eq!(
            latest_ready_revision(&isvc, "predictor"),
            Some("flowers-predictor-00001")
        );
        assert_eq!(latest_ready_revision(&isvc, "transformer"), None);
        assert_eq!(latest_ready_revision(&json!({}), "predictor"), None);
    }
}

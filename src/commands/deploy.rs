use crate::cli::DeployAction;

/* ============================= CONSTANTS ============================= */

const NAMESPACE: &str = "autopol";
const APP_NAME: &str = "autopol";
const IMAGE: &str = "192.168.1.68:5000/autopol:v0.1.0";

/* ============================= NAMESPACE ============================= */

pub fn generate_namespace() -> String {
    format!(
        r#"apiVersion: v1
kind: Namespace
metadata:
  name: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
"#
    )
}

/* ============================= RBAC ============================= */

pub fn generate_service_account() -> String {
    format!(
        r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: {APP_NAME}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
"#
    )
}

pub fn generate_cluster_role() -> String {
    format!(
        r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {APP_NAME}
  labels:
    app.kubernetes.io/name: {APP_NAME}
rules:
  - apiGroups: [""]
    resources: ["pods", "services", "endpoints", "namespaces"]
    verbs: ["get", "list", "watch"]
"#
    )
}

pub fn generate_cluster_role_binding() -> String {
    format!(
        r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {APP_NAME}
  labels:
    app.kubernetes.io/name: {APP_NAME}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {APP_NAME}
subjects:
  - kind: ServiceAccount
    name: {APP_NAME}
    namespace: {NAMESPACE}
"#
    )
}

/* ============================= DEPLOYMENT HELPER ============================= */

pub fn generate_deployment(component: &str, port: u16, args: &[&str]) -> String {
    let args_yaml: String = args.iter().map(|a| format!("            - \"{a}\"\n")).collect();

    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
spec:
  replicas: 1
  selector:
    matchLabels:
      app.kubernetes.io/name: {APP_NAME}
      app.kubernetes.io/component: {component}
  template:
    metadata:
      labels:
        app.kubernetes.io/name: {APP_NAME}
        app.kubernetes.io/component: {component}
    spec:
      serviceAccountName: {APP_NAME}
      containers:
        - name: {APP_NAME}
          image: {IMAGE}
          imagePullPolicy: IfNotPresent
          args:
{args_yaml}          ports:
            - containerPort: {port}
              protocol: TCP
          livenessProbe:
            httpGet:
              path: /healthz
              port: {port}
              scheme: HTTP
            initialDelaySeconds: 5
            periodSeconds: 10
          readinessProbe:
            httpGet:
              path: /readyz
              port: {port}
              scheme: HTTP
            initialDelaySeconds: 3
            periodSeconds: 5
          resources:
            requests:
              memory: "64Mi"
              cpu: "100m"
            limits:
              memory: "256Mi"
              cpu: "500m"
          securityContext:
            runAsNonRoot: true
            readOnlyRootFilesystem: true
"#
    )
}

/* ============================= DEPLOYMENTS ============================= */

/// One replica per cluster: the worker holds no shared state that would
/// benefit from a second replica, and netpolicy/syspolicy run as
/// independent instances per cluster (§4.8), not per replica.
pub fn generate_deployment_serve() -> String {
    generate_deployment("serve", 8080, &["serve", "--cluster", "default", "--addr", "0.0.0.0:8080"])
}

/* ============================= PDB HELPER ============================= */

pub fn generate_pdb(component: &str) -> String {
    format!(
        r#"apiVersion: policy/v1
kind: PodDisruptionBudget
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
spec:
  minAvailable: 0
  selector:
    matchLabels:
      app.kubernetes.io/name: {APP_NAME}
      app.kubernetes.io/component: {component}
"#
    )
}

pub fn generate_pdb_serve() -> String {
    generate_pdb("serve")
}

/* ============================= AGGREGATORS ============================= */

pub fn generate_all() -> String {
    let parts = [
        generate_namespace(),
        generate_service_account(),
        generate_cluster_role(),
        generate_cluster_role_binding(),
        generate_deployment_serve(),
        generate_pdb_serve(),
    ];
    parts.join("---\n")
}

pub fn generate_rbac() -> String {
    let parts = [generate_service_account(), generate_cluster_role(), generate_cluster_role_binding()];
    parts.join("---\n")
}

pub fn generate_deployments() -> String {
    generate_deployment_serve()
}

pub fn run(action: DeployAction) {
    let output = match action {
        DeployAction::GenerateAll => generate_all(),
        DeployAction::GenerateRbac => generate_rbac(),
        DeployAction::GenerateDeployments => generate_deployments(),
    };
    print!("{output}");
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_account_fields() {
        let yaml = generate_service_account();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");
        assert_eq!(doc["kind"], "ServiceAccount");
        assert_eq!(doc["metadata"]["name"], "autopol");
        assert_eq!(doc["metadata"]["namespace"], "autopol");
    }

    #[test]
    fn test_cluster_role_rules_count() {
        let yaml = generate_cluster_role();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");
        assert_eq!(doc["kind"], "ClusterRole");
        let rules = doc["rules"].as_sequence().expect("rules should be a sequence");
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_cluster_role_binding_references() {
        let yaml = generate_cluster_role_binding();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");
        assert_eq!(doc["roleRef"]["name"], "autopol");
        assert_eq!(doc["subjects"][0]["name"], "autopol");
    }

    #[test]
    fn test_deployment_serve_fields() {
        let yaml = generate_deployment_serve();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");
        assert_eq!(doc["kind"], "Deployment");
        assert_eq!(doc["metadata"]["name"], "autopol-serve");
        assert_eq!(doc["spec"]["replicas"], 1);
        let container = &doc["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["ports"][0]["containerPort"], 8080);
        assert_eq!(container["args"][0], "serve");
        assert_eq!(container["livenessProbe"]["httpGet"]["path"], "/healthz");
        assert_eq!(container["readinessProbe"]["httpGet"]["path"], "/readyz");
    }

    #[test]
    fn test_deployment_security_context_run_as_non_root() {
        let yaml = generate_deployment_serve();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");
        let sec = &doc["spec"]["template"]["spec"]["containers"][0]["securityContext"];
        assert_eq!(sec["runAsNonRoot"], true);
        assert_eq!(sec["readOnlyRootFilesystem"], true);
    }

    #[test]
    fn test_pdb_serve_fields() {
        let yaml = generate_pdb_serve();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");
        assert_eq!(doc["kind"], "PodDisruptionBudget");
        assert_eq!(
            doc["spec"]["selector"]["matchLabels"]["app.kubernetes.io/component"],
            "serve"
        );
    }

    #[test]
    fn test_generate_all_contains_all_kinds() {
        let output = generate_all();
        for kind in [
            "kind: Namespace",
            "kind: ServiceAccount",
            "kind: ClusterRole",
            "kind: ClusterRoleBinding",
            "kind: Deployment",
            "kind: PodDisruptionBudget",
        ] {
            assert!(output.contains(kind), "generate_all should contain {kind}");
        }
    }

    #[test]
    fn test_generate_rbac_has_three_docs() {
        let output = generate_rbac();
        let docs: Vec<&str> = output.split("---\n").collect();
        assert_eq!(docs.len(), 3);
    }

    #[test]
    fn test_label_consistency_deployment() {
        let yaml = generate_deployment_serve();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid YAML");
        assert_eq!(doc["metadata"]["labels"]["app.kubernetes.io/name"], "autopol");
        assert_eq!(
            doc["spec"]["template"]["metadata"]["labels"]["app.kubernetes.io/name"],
            "autopol"
        );
    }
}

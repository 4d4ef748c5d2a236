use crate::cli::ObservabilityAction;

/* ============================= SERVICE GENERATORS ============================= */

const NAMESPACE: &str = "autopol";
const APP_NAME: &str = "autopol";

pub fn generate_service(component: &str, port: u16) -> String {
    format!(
        r#"apiVersion: v1
kind: Service
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
spec:
  selector:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
  ports:
    - name: metrics
      port: {port}
      targetPort: {port}
      protocol: TCP
"#
    )
}

pub fn generate_service_serve() -> String {
    generate_service("serve", 8080)
}

/* ============================= SERVICEMONITOR GENERATORS ============================= */

pub fn generate_service_monitor(component: &str) -> String {
    format!(
        r#"apiVersion: monitoring.coreos.com/v1
kind: ServiceMonitor
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
    release: stable
spec:
  selector:
    matchLabels:
      app.kubernetes.io/name: {APP_NAME}
      app.kubernetes.io/component: {component}
  endpoints:
    - port: metrics
      path: /metrics
      interval: 15s
      scheme: http
"#
    )
}

pub fn generate_service_monitor_serve() -> String {
    generate_service_monitor("serve")
}

/* ============================= GRAFANA DASHBOARD ============================= */

pub fn generate_grafana_dashboard_configmap() -> String {
    let dashboard = build_dashboard_json();
    let dashboard_str = serde_json::to_string_pretty(&dashboard).expect("dashboard JSON is valid");

    let indented: String = dashboard_str.lines().map(|line| format!("    {line}")).collect::<Vec<_>>().join("\n");

    format!(
        r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {APP_NAME}-grafana-dashboard
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    grafana_dashboard: "1"
data:
  autopol.json: |
{indented}
"#
    )
}

fn build_dashboard_json() -> serde_json::Value {
    serde_json::json!({
        "annotations": { "list": [] },
        "editable": true,
        "fiscalYearStartMonth": 0,
        "graphTooltip": 1,
        "id": null,
        "links": [],
        "panels": [
            row_panel(0, "Discovery"),
            stat_panel(1, "Ticks Run", "autopol_discovery_ticks_total", 0),
            graph_panel(2, "Tick Rate", "rate(autopol_discovery_ticks_total[5m])", 0),
            graph_panel(3, "Tick Errors", "rate(autopol_discovery_tick_errors_total[5m])", 0),
            graph_panel(4, "Tick Duration", "histogram_quantile(0.99, rate(autopol_tick_duration_seconds_bucket[5m]))", 0),
            stat_panel(5, "Policies Synthesized", "autopol_policies_synthesized", 0),
        ],
        "schemaVersion": 39,
        "tags": ["kubernetes", "autopol"],
        "templating": { "list": [] },
        "time": { "from": "now-1h", "to": "now" },
        "title": "autopol Observability",
        "uid": "autopol-overview",
        "version": 1
    })
}

fn row_panel(id: u32, title: &str) -> serde_json::Value {
    serde_json::json!({ "id": id, "type": "row", "title": title, "collapsed": false, "panels": [] })
}

fn stat_panel(id: u32, title: &str, expr: &str, _row: u32) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "stat",
        "title": title,
        "targets": [{ "expr": expr, "refId": "A" }],
        "fieldConfig": {
            "defaults": {
                "thresholds": {
                    "steps": [
                        { "color": "green", "value": null },
                        { "color": "red", "value": 80 }
                    ]
                }
            }
        }
    })
}

fn graph_panel(id: u32, title: &str, expr: &str, _row: u32) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "timeseries",
        "title": title,
        "targets": [{ "expr": expr, "refId": "A" }],
        "fieldConfig": { "defaults": {} }
    })
}

/* ============================= GENERATE ALL ============================= */

pub fn generate_all() -> String {
    let parts = [generate_service_serve(), generate_service_monitor_serve(), generate_grafana_dashboard_configmap()];
    parts.join("---\n")
}

pub fn generate_service_monitors() -> String {
    generate_service_monitor_serve()
}

pub fn run(action: ObservabilityAction) {
    let output = match action {
        ObservabilityAction::GenerateAll => generate_all(),
        ObservabilityAction::GenerateServiceMonitors => generate_service_monitors(),
        ObservabilityAction::GenerateDashboard => generate_grafana_dashboard_configmap(),
    };
    print!("{output}");
}

/* ============================= TESTS ============================= */

//! HTTP end-to-end tests.
//!
//! These tests start a real `stackgate-server` in-process on a random port,
//! backed by an on-disk store with the mock version-control and provisioning
//! backends, and drive it with a real HTTP client.

use serde_json::{json, Value};
use stackgate_core::Engine;
use stackgate_schema::Config;
use stackgate_server::TestServer;

fn start_server() -> (TestServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::parse_str(&format!(
        r#"
root_folder = "{}"
store_dir = "{}"

[provisioner]
backend = "mock"

[vcs]
backend = "mock"
"#,
        dir.path().join("work").display(),
        dir.path().join("store").display(),
    ))
    .unwrap();
    let server = TestServer::start(Engine::from_config(&config).unwrap()).unwrap();
    (server, dir)
}

fn get(url: &str) -> Result<Value, u16> {
    match ureq::get(url).call() {
        Ok(mut resp) => {
            let body = resp.body_mut().read_to_string().unwrap();
            Ok(serde_json::from_str(&body).unwrap())
        }
        Err(ureq::Error::StatusCode(code)) => Err(code),
        Err(e) => panic!("GET {url}: {e}"),
    }
}

fn post(url: &str, body: &Value) -> Result<(u16, Value), u16> {
    let result = ureq::post(url)
        .header("Content-Type", "application/json")
        .send(body.to_string().as_bytes());
    match result {
        Ok(mut resp) => {
            let code = resp.status().as_u16();
            let text = resp.body_mut().read_to_string().unwrap();
            Ok((code, serde_json::from_str(&text).unwrap()))
        }
        Err(ureq::Error::StatusCode(code)) => Err(code),
        Err(e) => panic!("POST {url}: {e}"),
    }
}

fn register(server: &TestServer, body: &Value) -> Value {
    let (code, summary) = post(&format!("{}/environments", server.url), body).unwrap();
    assert_eq!(code, 201);
    summary
}

fn register_prod(server: &TestServer) {
    register(
        server,
        &json!({
            "id": 1,
            "name": "prod",
            "repo": "https://git.example.com/infra.git",
            "branch": "main",
            "variables": {"region": "eu-west-1"},
        }),
    );
}

#[test]
fn http_e2e_health() {
    let (server, _dir) = start_server();
    let health = get(&format!("{}/health", server.url)).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["active_runs"], 0);
}

#[test]
fn http_e2e_register_list_show() {
    let (server, _dir) = start_server();
    register_prod(&server);
    let staging = register(
        &server,
        &json!({"name": "staging", "repo": "https://git.example.com/infra.git"}),
    );
    assert_eq!(staging["id"], 2);
    assert_eq!(staging["branch"], "master");

    let list = get(&format!("{}/environments", server.url)).unwrap();
    let names: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["prod", "staging"]);

    let prod = get(&format!("{}/environments/1", server.url)).unwrap();
    assert_eq!(prod["variables"]["region"], "eu-west-1");
    assert_eq!(prod["changes"], json!([]));

    assert_eq!(get(&format!("{}/environments/9", server.url)), Err(404));
}

#[test]
fn http_e2e_register_rejects_conflicts_and_bad_bodies() {
    let (server, _dir) = start_server();
    register_prod(&server);
    let url = format!("{}/environments", server.url);

    assert_eq!(
        post(&url, &json!({"name": "prod", "repo": "r"})),
        Err(409)
    );
    assert_eq!(
        post(&url, &json!({"id": 1, "name": "other", "repo": "r"})),
        Err(409)
    );
    assert_eq!(post(&url, &json!({"name": "no repo"})), Err(400));
    assert_eq!(
        post(&url, &json!({"name": "bad name", "repo": "r"})),
        Err(400)
    );
}

#[test]
fn http_e2e_plan_then_apply() {
    let (server, _dir) = start_server();
    register_prod(&server);

    let (code, accepted) = post(
        &format!("{}/environments/1/plan", server.url),
        &json!({"revision": "abc123"}),
    )
    .unwrap();
    assert_eq!(code, 202);
    assert_eq!(accepted["revision"], "abc123");
    server.app.wait_idle();

    let change = get(&format!("{}/environments/1/changes/1", server.url)).unwrap();
    assert_eq!(change["revision"], "abc123");
    assert_eq!(change["status"], "planned");
    assert_eq!(change["plan_output"], "mock plan: no changes");

    let (code, accepted) =
        post(&format!("{}/environments/1/apply", server.url), &json!({})).unwrap();
    assert_eq!(code, 202);
    assert_eq!(accepted["change_id"], 1);
    server.app.wait_idle();

    let change = get(&format!("{}/environments/1/changes/1", server.url)).unwrap();
    assert_eq!(change["status"], "applied");
    assert!(change["state"].is_string());
}

#[test]
fn http_e2e_plan_from_push_webhook() {
    let (server, _dir) = start_server();
    register_prod(&server);

    let webhook = json!({
        "ref": "refs/heads/main",
        "head_commit": {"id": "def456", "message": "bump instance size"},
        "repository": {"full_name": "example/infra"},
    });
    let (code, _) = post(&format!("{}/environments/1/plan", server.url), &webhook).unwrap();
    assert_eq!(code, 202);
    server.app.wait_idle();

    let change = get(&format!("{}/environments/1/changes/1", server.url)).unwrap();
    assert_eq!(change["revision"], "def456");
}

#[test]
fn http_e2e_auto_apply() {
    let (server, _dir) = start_server();
    register(
        &server,
        &json!({"id": 3, "name": "dev", "repo": "r", "auto_apply": true}),
    );
    post(
        &format!("{}/environments/3/plan", server.url),
        &json!({"revision": "abc"}),
    )
    .unwrap();
    server.app.wait_idle();

    let env = get(&format!("{}/environments/3", server.url)).unwrap();
    let changes = env["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["status"], "applied");
}

#[test]
fn http_e2e_plan_and_apply_validation() {
    let (server, _dir) = start_server();
    register_prod(&server);

    assert_eq!(
        post(&format!("{}/environments/1/plan", server.url), &json!({})),
        Err(400)
    );
    assert_eq!(
        post(
            &format!("{}/environments/9/plan", server.url),
            &json!({"revision": "abc"})
        ),
        Err(404)
    );
    assert_eq!(
        post(&format!("{}/environments/1/apply", server.url), &json!({})),
        Err(409)
    );
    assert_eq!(
        post(
            &format!("{}/environments/1/apply", server.url),
            &json!({"change_id": 5})
        ),
        Err(404)
    );
    assert_eq!(get(&format!("{}/environments/1/changes/1", server.url)), Err(404));
}

#[test]
fn http_e2e_concurrent_plans_are_serialized() {
    let (server, _dir) = start_server();
    register_prod(&server);

    for i in 0..5 {
        let (code, _) = post(
            &format!("{}/environments/1/plan", server.url),
            &json!({"revision": format!("rev{i}")}),
        )
        .unwrap();
        assert_eq!(code, 202);
    }
    server.app.wait_idle();

    let env = get(&format!("{}/environments/1", server.url)).unwrap();
    let changes = env["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 5);
    let ids: Vec<u64> = changes.iter().map(|c| c["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(changes.iter().all(|c| c["status"] == "planned"));
}

#[test]
fn http_e2e_unknown_route_and_method() {
    let (server, _dir) = start_server();
    assert_eq!(get(&format!("{}/nowhere", server.url)), Err(404));
    assert_eq!(get(&format!("{}/environments/1/plan", server.url)), Err(405));
}

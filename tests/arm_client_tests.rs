
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use vmss_exec::azure::{ArmComputeClient, ArmInventory, ComputeClient, PollStatus, RunCommandInput};
use vmss_exec::error::VmssError;
use vmss_exec::runcmd::{RemoteCommandExecutor, RunCommandRequest};

use test_harness::{test_vm, StaticCredential, NODE_RESOURCE_GROUP, SUBSCRIPTION, VMSS};

const RUN_COMMAND_ROUTE: &str = "/subscriptions/:sub/resourceGroups/:rg/providers/Microsoft.Compute/virtualMachineScaleSets/:vmss/virtualMachines/:instance/runCommand";

/// How the mock answers the runCommand POST.
#[derive(Clone, Copy)]
enum Mode {
    AsyncOperation,
    LocationOnly,
    Synchronous,
    Rejected,
    OperationFails,
}

struct MockArm {
    base: String,
    mode: Mode,
    /// Status polls answered "InProgress" before completing.
    pending_polls: usize,
    polls: AtomicUsize,
    requests: Mutex<Vec<HeaderMap>>,
    bodies: Mutex<Vec<Value>>,
}

type Shared = Arc<MockArm>;

fn output(stdout: &str) -> Value {
    json!({
        "value": [{
            "code": "ProvisioningState/succeeded",
            "level": "Info",
            "displayStatus": "Provisioning succeeded",
            "message": format!("Enable succeeded: \n[stdout]\n{stdout}\n[stderr]\n\n")
        }]
    })
}

async fn run_command(
    State(mock): State<Shared>,
    Path((sub, rg, vmss, instance)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    mock.requests.lock().unwrap().push(headers);
    mock.bodies.lock().unwrap().push(body);
    assert_eq!(sub, SUBSCRIPTION);
    assert_eq!(rg, NODE_RESOURCE_GROUP);
    assert_eq!(vmss, VMSS);
    assert_eq!(instance, "0");

    let status_url = format!("{}/operations/op-1", mock.base);
    let result_url = format!("{}/results/op-1", mock.base);
    match mock.mode {
        Mode::AsyncOperation | Mode::OperationFails => (
            StatusCode::ACCEPTED,
            [("azure-asyncoperation", status_url), ("location", result_url)],
        )
            .into_response(),
        Mode::LocationOnly => (StatusCode::ACCEPTED, [("location", result_url)]).into_response(),
        Mode::Synchronous => (StatusCode::OK, Json(output("sync"))).into_response(),
        Mode::Rejected => (
            StatusCode::CONFLICT,
            Json(json!({"error": {"code": "OperationNotAllowed", "message": "busy"}})),
        )
            .into_response(),
    }
}

async fn operation_status(State(mock): State<Shared>, headers: HeaderMap) -> Json<Value> {
    mock.requests.lock().unwrap().push(headers);
    let n = mock.polls.fetch_add(1, Ordering::SeqCst);
    if n < mock.pending_polls {
        return Json(json!({"name": "op-1", "status": "InProgress"}));
    }
    match mock.mode {
        Mode::OperationFails => Json(json!({
            "name": "op-1",
            "status": "Failed",
            "error": {"code": "VMAgentStatusCommunicationError", "message": "agent unreachable"}
        })),
        _ => Json(json!({"name": "op-1", "status": "Succeeded"})),
    }
}

async fn operation_result(State(mock): State<Shared>, headers: HeaderMap) -> Response {
    mock.requests.lock().unwrap().push(headers);
    if let Mode::LocationOnly = mock.mode {
        let n = mock.polls.fetch_add(1, Ordering::SeqCst);
        if n < mock.pending_polls {
            return StatusCode::ACCEPTED.into_response();
        }
    }
    Json(output("hello from the node")).into_response()
}

async fn start_mock(mode: Mode, pending_polls: usize) -> Shared {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mock = Arc::new(MockArm {
        base: format!("http://{addr}"),
        mode,
        pending_polls,
        polls: AtomicUsize::new(0),
        requests: Mutex::new(Vec::new()),
        bodies: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route(RUN_COMMAND_ROUTE, post(run_command))
        .route("/operations/:id", get(operation_status))
        .route("/results/:id", get(operation_result))
        .route(
            "/subscriptions/:sub/resourceGroups/:rg/providers/Microsoft.ContainerService/managedClusters/:name",
            get(managed_cluster),
        )
        .route(
            "/subscriptions/:sub/resourceGroups/:rg/providers/Microsoft.Compute/virtualMachineScaleSets",
            get(list_scale_sets),
        )
        .route(
            "/subscriptions/:sub/resourceGroups/:rg/providers/Microsoft.Compute/virtualMachineScaleSets/:vmss/virtualMachines",
            get(list_instances),
        )
        .route("/pages/scale-sets-2", get(list_scale_sets_page_2))
        .with_state(mock.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    mock
}

fn client(mock: &MockArm) -> ArmComputeClient {
    ArmComputeClient::new(Arc::new(StaticCredential("test-token")))
        .unwrap()
        .with_endpoint(mock.base.clone())
}

fn executor(client: &ArmComputeClient) -> RemoteCommandExecutor<'_> {
    RemoteCommandExecutor::new(client)
        .poll_interval(Duration::from_millis(10))
        .watch_interrupts(false)
}

// =============================================================================
// runCommand
// =============================================================================

#[tokio::test]
async fn test_async_operation_flow() {
    let mock = start_mock(Mode::AsyncOperation, 2).await;
    let client = client(&mock);

    let result = executor(&client)
        .run(&RunCommandRequest::new(test_vm("0"), "uptime"))
        .await
        .unwrap();

    assert_eq!(result.stdout, "hello from the node");
    assert_eq!(mock.polls.load(Ordering::SeqCst), 3);

    let bodies = mock.bodies.lock().unwrap();
    assert_eq!(bodies[0]["commandId"], "RunShellScript");
    assert_eq!(
        bodies[0]["script"][0],
        "timeout 300 sh -c 'uptime | head -c 4096'"
    );
}

#[tokio::test]
async fn test_every_request_is_authenticated_and_tagged() {
    let mock = start_mock(Mode::AsyncOperation, 1).await;
    let client = client(&mock);

    executor(&client)
        .run(&RunCommandRequest::new(test_vm("0"), "true"))
        .await
        .unwrap();

    let requests = mock.requests.lock().unwrap();
    assert!(requests.len() >= 3);
    let mut ids = Vec::new();
    for headers in requests.iter() {
        assert_eq!(
            headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer test-token"
        );
        let id = headers
            .get("x-ms-client-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        ids.push(id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), requests.len());
}

#[tokio::test]
async fn test_location_only_flow() {
    let mock = start_mock(Mode::LocationOnly, 2).await;
    let client = client(&mock);

    let result = executor(&client)
        .run(&RunCommandRequest::new(test_vm("0"), "true"))
        .await
        .unwrap();

    assert_eq!(result.stdout, "hello from the node");
}

#[tokio::test]
async fn test_synchronous_completion() {
    let mock = start_mock(Mode::Synchronous, 0).await;
    let client = client(&mock);

    let mut poller = client
        .begin_run_command(&test_vm("0"), &RunCommandInput::shell_script("true"))
        .await
        .unwrap();
    match poller.poll().await.unwrap() {
        PollStatus::Done(response) => {
            assert_eq!(
                response.value[0].code.as_deref(),
                Some("ProvisioningState/succeeded")
            );
        }
        PollStatus::InProgress => panic!("synchronous result reported as in progress"),
    }
}

#[tokio::test]
async fn test_rejected_submission() {
    let mock = start_mock(Mode::Rejected, 0).await;
    let client = client(&mock);

    let err = executor(&client)
        .run(&RunCommandRequest::new(test_vm("0"), "true"))
        .await
        .unwrap_err();

    match err {
        VmssError::SubmissionFailed(msg) => {
            assert!(msg.contains("409"));
            assert!(msg.contains("OperationNotAllowed"));
        }
        other => panic!("expected SubmissionFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_operation_is_polling_error() {
    let mock = start_mock(Mode::OperationFails, 1).await;
    let client = client(&mock);

    let err = executor(&client)
        .run(&RunCommandRequest::new(test_vm("0"), "true"))
        .await
        .unwrap_err();

    match err {
        VmssError::PollingFailed(msg) => assert!(msg.contains("agent unreachable")),
        other => panic!("expected PollingFailed, got {other:?}"),
    }
}

// =============================================================================
// Inventory
// =============================================================================

async fn managed_cluster(Path((sub, rg, name)): Path<(String, String, String)>) -> Json<Value> {
    assert_eq!(sub, SUBSCRIPTION);
    assert_eq!(rg, "myrg");
    assert_eq!(name, "mycluster");
    Json(json!({
        "name": "mycluster",
        "properties": {"nodeResourceGroup": "MC_myrg_mycluster_eastus"}
    }))
}

async fn list_scale_sets(
    State(mock): State<Shared>,
    Path((_sub, rg)): Path<(String, String)>,
) -> Json<Value> {
    assert_eq!(rg, NODE_RESOURCE_GROUP);
    Json(json!({
        "value": [{"name": "aks-nodepool1-12345678-vmss"}],
        "nextLink": format!("{}/pages/scale-sets-2", mock.base)
    }))
}

async fn list_scale_sets_page_2() -> Json<Value> {
    Json(json!({"value": [{"name": "aks-userpool-87654321-vmss"}]}))
}

async fn list_instances(
    Path((_sub, _rg, vmss)): Path<(String, String, String)>,
) -> Json<Value> {
    let instances = if vmss == "aks-nodepool1-12345678-vmss" {
        json!([
            {
                "name": "aks-nodepool1-12345678-vmss_0",
                "instanceId": "0",
                "properties": {"osProfile": {"computerName": "AKS-NODEPOOL1-12345678-VMSS000000"}}
            },
            {
                "name": "aks-nodepool1-12345678-vmss_1",
                "instanceId": "1",
                "properties": {}
            }
        ])
    } else {
        json!([
            {
                "name": "aks-userpool-87654321-vmss_4",
                "instanceId": "4",
                "properties": {"osProfile": {"computerName": "aks-userpool-87654321-vmss000004"}}
            }
        ])
    };
    Json(json!({ "value": instances }))
}

#[tokio::test]
async fn test_inventory_lists_every_scale_set_page() {
    let mock = start_mock(Mode::AsyncOperation, 0).await;
    let inventory = ArmInventory::new(Arc::new(StaticCredential("test-token")))
        .unwrap()
        .with_endpoint(mock.base.clone());

    let nodes = inventory
        .list_coordinates(SUBSCRIPTION, "myrg", "mycluster")
        .await
        .unwrap();

    assert_eq!(nodes.len(), 3);

    let first = &nodes["aks-nodepool1-12345678-vmss000000"];
    assert_eq!(first, &test_vm("0"));

    // No OS profile: keyed by VM name.
    let second = &nodes["aks-nodepool1-12345678-vmss_1"];
    assert_eq!(second.instance_id(), "1");

    let user = &nodes["aks-userpool-87654321-vmss000004"];
    assert_eq!(user.scale_set(), "aks-userpool-87654321-vmss");
    assert_eq!(user.resource_group(), NODE_RESOURCE_GROUP);
}

use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use spoolcore::{EngineError, Value, WorkflowDefinition};
use spoolengine::{EngineConfig, HandlerCatalog, WorkflowRuntime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<WorkflowRuntime>,
}

/// Request body for starting a run
#[derive(Debug, Deserialize)]
struct StartRunRequest {
    #[serde(default)]
    inputs: HashMap<String, serde_json::Value>,
}

/// Response for workflow creation
#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: Uuid,
    message: String,
}

/// Response for run creation
#[derive(Debug, Serialize)]
struct StartRunResponse {
    run_id: Uuid,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn engine_error_response(err: EngineError) -> HttpResponse {
    match err {
        EngineError::Validation(errors) => HttpResponse::UnprocessableEntity().json(
            serde_json::json!({
                "error": "workflow failed validation",
                "details": errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            }),
        ),
        EngineError::WorkflowNotFound(_) | EngineError::RunNotFound(_) => {
            HttpResponse::NotFound().json(ErrorResponse {
                error: err.to_string(),
            })
        }
        EngineError::UnknownActionKind(_) => HttpResponse::UnprocessableEntity().json(
            ErrorResponse {
                error: err.to_string(),
            },
        ),
        other => HttpResponse::InternalServerError().json(ErrorResponse {
            error: other.to_string(),
        }),
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "spool"
    }))
}

/// List all workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let workflows = data.runtime.list_workflows().await;
    let workflow_list: Vec<_> = workflows
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "version": w.version,
                "description": w.description,
                "nodes": w.nodes.len(),
                "connections": w.connections.len(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(workflow_list))
}

/// Create a new workflow
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    workflow: web::Json<WorkflowDefinition>,
) -> ActixResult<impl Responder> {
    let workflow = workflow.into_inner();

    info!("Creating workflow: {} ({})", workflow.name, workflow.id);

    let workflow_id = data.runtime.register_workflow(workflow).await;

    Ok(HttpResponse::Created().json(WorkflowResponse {
        id: workflow_id,
        message: "Workflow created successfully".to_string(),
    }))
}

/// Get a specific workflow
#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();

    match data.runtime.workflow(workflow_id).await {
        Some(workflow) => Ok(HttpResponse::Ok().json(workflow.as_ref())),
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        })),
    }
}

/// Delete a workflow
#[actix_web::delete("/api/workflows/{id}")]
async fn delete_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();

    if data.runtime.remove_workflow(workflow_id).await {
        info!("Deleted workflow: {}", workflow_id);
        Ok(HttpResponse::Ok().json(serde_json::json!({
            "message": "Workflow deleted successfully"
        })))
    } else {
        Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        }))
    }
}

/// Validate a workflow without running it
#[post("/api/workflows/{id}/validate")]
async fn validate_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();

    match data.runtime.workflow(workflow_id).await {
        Some(workflow) => {
            let errors = workflow.validate();
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "valid": errors.is_empty(),
                "errors": errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            })))
        }
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        })),
    }
}

/// Start a run of a workflow
#[post("/api/workflows/{id}/runs")]
async fn start_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<StartRunRequest>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let inputs = req.into_inner().inputs;

    info!("Starting run of workflow: {}", workflow_id);

    let converted_inputs: HashMap<String, Value> = inputs
        .into_iter()
        .map(|(k, v)| (k, Value::Json(v)))
        .collect();

    match data.runtime.start_run(workflow_id, converted_inputs).await {
        Ok(run_id) => Ok(HttpResponse::Accepted().json(StartRunResponse { run_id })),
        Err(e) => {
            error!("Failed to start run of workflow {}: {}", workflow_id, e);
            Ok(engine_error_response(e))
        }
    }
}

/// Get the current state of a run
#[get("/api/runs/{id}")]
async fn get_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    match data.runtime.run(path.into_inner()).await {
        Ok(run) => Ok(HttpResponse::Ok().json(run)),
        Err(e) => Ok(engine_error_response(e)),
    }
}

/// Request cancellation of a run
#[post("/api/runs/{id}/cancel")]
async fn cancel_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();

    match data.runtime.cancel_run(run_id).await {
        Ok(()) => {
            info!("Cancellation requested for run {}", run_id);
            Ok(HttpResponse::Accepted().json(serde_json::json!({
                "message": "Cancellation requested"
            })))
        }
        Err(e) => Ok(engine_error_response(e)),
    }
}

/// Replay the execution log of a run
#[get("/api/runs/{id}/history")]
async fn run_history(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    match data.runtime.history(path.into_inner()).await {
        Ok(records) => Ok(HttpResponse::Ok().json(records)),
        Err(e) => Ok(engine_error_response(e)),
    }
}

/// WebSocket endpoint streaming a run's execution log live
#[get("/api/runs/{id}/events")]
async fn run_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<HttpResponse> {
    let run_id = path.into_inner();

    let mut log_stream = match data.runtime.subscribe(run_id).await {
        Ok(stream) => stream,
        Err(e) => return Ok(engine_error_response(e)),
    };

    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client subscribed to run {}", run_id);

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                record = log_stream.next() => {
                    match record {
                        Some(record) => {
                            if let Ok(json) = serde_json::to_string(&record) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        // Run reached a terminal state.
                        None => break,
                    }
                }

                // Handle incoming WebSocket messages (ping/pong)
                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client for run {} disconnected", run_id);
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List registered action kinds
#[get("/api/nodes")]
async fn list_action_kinds(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let catalog = data.runtime.catalog();

    let mut kinds = catalog.action_kinds();
    kinds.sort();

    let nodes: Vec<_> = kinds
        .iter()
        .filter_map(|kind| catalog.descriptor(kind))
        .map(|descriptor| {
            serde_json::json!({
                "action_kind": descriptor.action_kind,
                "description": descriptor.description,
                "category": descriptor.category,
                "inputs": descriptor.inputs,
                "outputs": descriptor.outputs,
                "retryable": descriptor.retryable,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(nodes))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("🚀 Starting Spool Server");

    // Create runtime with the standard handler library
    let mut catalog = HandlerCatalog::new();
    spoolnodes::register_all(&mut catalog);

    let runtime = WorkflowRuntime::with_config(Arc::new(catalog), EngineConfig::default());

    info!("✅ Runtime initialized with standard handlers");

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_workflows)
            .service(create_workflow)
            .service(get_workflow)
            .service(delete_workflow)
            .service(validate_workflow)
            .service(start_run)
            .service(get_run)
            .service(cancel_run)
            .service(run_history)
            .service(run_events)
            .service(list_action_kinds)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}

// crates/spoolcli/src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use spoolcore::{NodeExecStatus, RunStatus, Value, WorkflowDefinition};
use spoolengine::{EngineConfig, HandlerCatalog, WorkflowRuntime};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "spool")]
#[command(about = "Spool workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available action kinds
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

/// Convert a serde_json::Value to spoolcore::Value
fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                Value::Number(f)
            } else {
                Value::Number(n.as_i64().unwrap_or(0) as f64)
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(arr) => {
            Value::Array(arr.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(obj) => {
            let map: HashMap<String, Value> = obj
                .into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect();
            Value::Object(map)
        }
    }
}

fn standard_runtime() -> WorkflowRuntime {
    let mut catalog = HandlerCatalog::new();
    spoolnodes::register_all(&mut catalog);
    WorkflowRuntime::with_config(Arc::new(catalog), EngineConfig::default())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            verbose,
        } => {
            // Initialize logging
            if verbose {
                tracing_subscriber::fmt()
                    .with_max_level(tracing::Level::DEBUG)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_max_level(tracing::Level::WARN)
                    .init();
            }

            run_workflow(file, input).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn status_glyph(status: NodeExecStatus) -> &'static str {
    match status {
        NodeExecStatus::Queued => "📥",
        NodeExecStatus::Running => "⚡",
        NodeExecStatus::Succeeded => "✅",
        NodeExecStatus::Failed => "❌",
        NodeExecStatus::Skipped => "⏭️ ",
        NodeExecStatus::TimedOut => "⏰",
    }
}

async fn run_workflow(file: PathBuf, input: Option<String>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow_json = std::fs::read_to_string(&file)?;
    let workflow: WorkflowDefinition = serde_json::from_str(&workflow_json)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    // Parse input data as plain JSON and convert to engine values
    let inputs: HashMap<String, Value> = if let Some(input_str) = input {
        let json: serde_json::Value = serde_json::from_str(&input_str)?;

        if let serde_json::Value::Object(obj) = json {
            obj.into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect()
        } else {
            return Err(anyhow::anyhow!("Input must be a JSON object"));
        }
    } else {
        HashMap::new()
    };

    // Node names for friendlier output than raw ids
    let node_names: HashMap<_, _> = workflow
        .nodes
        .iter()
        .map(|n| {
            let label = n
                .name
                .clone()
                .unwrap_or_else(|| n.id.to_string());
            (n.id, label)
        })
        .collect();

    let runtime = standard_runtime();
    let workflow_id = runtime.register_workflow(workflow).await;

    let run_id = runtime.start_run(workflow_id, inputs).await?;
    println!("▶️  Run started: {}", run_id);

    // Stream the execution log until the run reaches a terminal state
    let mut stream = runtime.subscribe(run_id).await?;
    while let Some(record) = stream.next().await {
        let name = node_names
            .get(&record.node_id)
            .map(String::as_str)
            .unwrap_or("?");
        match record.status {
            NodeExecStatus::Running => {
                println!("  ⚡ {} (attempt {})", name, record.attempt);
            }
            status => {
                let glyph = status_glyph(status);
                match &record.error_message {
                    Some(error) => println!("  {} {}: {}", glyph, name, error),
                    None => println!("  {} {}", glyph, name),
                }
            }
        }
    }

    let run = runtime.run(run_id).await?;
    let history = runtime.history(run_id).await?;
    let succeeded = history
        .iter()
        .filter(|r| r.status == NodeExecStatus::Succeeded)
        .count();

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", run.id);
    println!("   Completed nodes: {}", succeeded);
    match run.status {
        RunStatus::Succeeded => println!("✨ Run completed successfully"),
        RunStatus::Failed => println!("💥 Run failed"),
        RunStatus::Cancelled => println!("🛑 Run cancelled"),
        other => println!("   Status: {:?}", other),
    }

    Ok(())
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow_json = std::fs::read_to_string(&file)?;
    let workflow: WorkflowDefinition = serde_json::from_str(&workflow_json)?;

    let errors = workflow.validate();
    if errors.is_empty() {
        println!("✅ Workflow is valid:");
        println!("   Name: {}", workflow.name);
        println!("   Nodes: {}", workflow.nodes.len());
        println!("   Connections: {}", workflow.connections.len());
        Ok(())
    } else {
        println!("❌ Workflow has {} error(s):", errors.len());
        for error in &errors {
            println!("   • {}", error);
        }
        Err(anyhow::anyhow!("workflow failed validation"))
    }
}

fn list_nodes() {
    println!("📦 Available Action Kinds:");
    println!();

    let mut catalog = HandlerCatalog::new();
    spoolnodes::register_all(&mut catalog);

    let mut kinds = catalog.action_kinds();
    kinds.sort();

    for kind in kinds {
        if let Some(descriptor) = catalog.descriptor(&kind) {
            println!("  • {} ({})", kind, descriptor.category);
            println!("    {}", descriptor.description);
        } else {
            println!("  • {}", kind);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    use spoolcore::NodeSpec;

    let mut workflow = WorkflowDefinition::new("Example HTTP Workflow");
    workflow.description = Some("Fetches data from an API and logs the result".to_string());

    // Create nodes
    let trigger_node = NodeSpec::trigger()
        .with_name("Start")
        .with_position(100.0, 100.0);

    let http_node = NodeSpec::action("http.request")
        .with_name("Fetch Data")
        .with_config("method", "GET")
        .with_position(300.0, 100.0);

    let debug_node = NodeSpec::action("debug.log")
        .with_name("Log Response")
        .with_position(500.0, 100.0);

    let trigger_id = workflow.add_node(trigger_node);
    let http_id = workflow.add_node(http_node);
    let debug_id = workflow.add_node(debug_node);

    // Connect them
    workflow.connect(trigger_id, "url", http_id, "url");
    workflow.connect(http_id, "body", debug_id, "message");

    // Save to file
    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  spool run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );

    Ok(())
}

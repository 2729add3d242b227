//! Slate CLI binary: inspect the loaded registries and drive a manager.
//!
//! Subcommands: `inventory` (list agents, tools, MCP servers), `validate`
//! (load everything, report problems, non-zero exit on hard errors), `run`
//! (run one manager config against a task; LLM responses come from a
//! scripted JSON file, which keeps the binary provider-free).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use slate::{
    build_instances, pipeline_state, AgentRegistry, ArtifactStore, Blackboard, DataType,
    HandlerRegistry, InMemoryEventHub, Manager, ManagerConfig, Message, MockLlm, NodeContext,
    RuntimePaths, StopReason, ToolRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "slate")]
#[command(about = "Slate — blackboard-driven multi-agent orchestration")]
struct Args {
    #[command(subcommand)]
    cmd: Command,

    /// Verbose: debug-level runtime logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List loaded agents, control nodes, tools, and MCP servers
    Inventory,
    /// Load all registries and report problems
    Validate,
    /// Run a manager config against a task message
    Run {
        /// Manager YAML file
        #[arg(value_name = "MANAGER_YAML")]
        manager: PathBuf,

        /// Task text handed to the first agent
        #[arg(short, long, value_name = "TEXT")]
        task: String,

        /// JSON file with an array of scripted LLM responses
        #[arg(long, value_name = "PATH")]
        llm_script: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "slate=debug,cli=debug" } else { "slate=info,cli=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

struct LoadedRegistries {
    agents: Arc<AgentRegistry>,
    tools: Arc<ToolRegistry>,
    mcp_servers: Arc<BTreeMap<String, slate::McpServerEntry>>,
    settings: config::Settings,
    problems: Vec<String>,
}

fn load_registries() -> Result<LoadedRegistries, Box<dyn std::error::Error>> {
    let settings = config::load_settings("slate")?;
    let mut problems = Vec::new();

    let mut agents = AgentRegistry::new(&settings.paths.agents_dir);
    agents.load()?;

    let mut tools = ToolRegistry::new();
    // Local tool implementations are registered by embedding binaries; the
    // stock CLI ships none, so only entries without factories would error.
    if settings.paths.tools_dir.exists() {
        if let Err(e) = tools.load_local_tools(&settings.paths.tools_dir) {
            return Err(Box::new(e));
        }
    }

    let (servers, directory_problems) =
        slate::registry::load_server_directory(&settings.paths.mcp_dir);
    problems.extend(directory_problems);
    problems.extend(tools.load_mcp_tools(&settings.paths.mcp_dir, &servers));

    Ok(LoadedRegistries {
        agents: Arc::new(agents),
        tools: Arc::new(tools),
        mcp_servers: Arc::new(servers),
        settings,
        problems,
    })
}

fn print_inventory(loaded: &LoadedRegistries) {
    println!("agents:");
    for name in loaded.agents.list_agents() {
        println!("  {name}");
    }
    println!("control nodes:");
    for name in loaded.agents.list() {
        if loaded.agents.is_control_node(&name) {
            println!("  {name}");
        }
    }
    println!("tools:");
    for name in loaded.tools.list() {
        println!("  {name}");
    }
    println!("mcp servers:");
    for (id, entry) in loaded.mcp_servers.iter() {
        let status = if entry.enabled { "enabled" } else { "disabled" };
        println!("  {id} ({status}, {})", entry.display_name);
    }
}

async fn run_manager(
    loaded: LoadedRegistries,
    manager_path: &PathBuf,
    task: &str,
    llm_script: &PathBuf,
) -> Result<i32, Box<dyn std::error::Error>> {
    let manager_config = ManagerConfig::from_yaml_file(manager_path)?;

    let script_text = std::fs::read_to_string(llm_script)?;
    let responses: Vec<serde_json::Value> = serde_json::from_str(&script_text)?;

    let instances = build_instances(&loaded.agents, &manager_config, Vec::new())?;
    let ctx = NodeContext {
        manager_name: manager_config.name.clone(),
        blackboard: Arc::new(Blackboard::new()),
        agents: loaded.agents,
        tools: loaded.tools,
        mcp_servers: loaded.mcp_servers,
        llm: Arc::new(MockLlm::new(responses)),
        hub: Arc::new(InMemoryEventHub::new()),
        rag: Arc::new(slate::external::NoopRag),
        entities: Arc::new(slate::external::NoopEntities),
        summarizer: Arc::new(slate::PassthroughSummarizer::default()),
        artifacts: ArtifactStore::new(&loaded.settings.paths.artifacts_dir),
        paths: RuntimePaths::new(
            &loaded.settings.paths.uploads_dir,
            &loaded.settings.paths.artifacts_dir,
        ),
        handlers: HandlerRegistry::new(),
        instances: Arc::new(instances),
    };

    let manager = Manager::new(manager_config, ctx);
    let initial = Message::new()
        .with_data_type(DataType::Task)
        .with_content(task);

    let outcome = match manager.run(initial).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_fatal() => slate::abort_process(&e),
        Err(e) => return Err(Box::new(e)),
    };

    slate::mcp::close_all_sessions();

    println!("stopped: {:?} after {} loops", outcome.reason, outcome.loops);
    if let Some(error) = &outcome.error_message {
        println!("error: {error}");
    }
    if let Some(result) = manager.context().blackboard.get_state_value("result") {
        println!("result: {result}");
    }
    if let Some(reference) = pipeline_state::last_tool_result_ref(&manager.context().blackboard) {
        println!("last tool result artifact: {}", reference.path);
    }

    Ok(match outcome.reason {
        StopReason::Exit => 0,
        StopReason::MaxLoops | StopReason::Cancelled => 0,
        StopReason::Error => 2,
    })
}


#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = config::load_and_apply("slate", None) {
        eprintln!("config load failed: {e}");
        std::process::exit(1);
    }

    let code = match args.cmd {
        Command::Inventory => match load_registries() {
            Ok(loaded) => {
                print_inventory(&loaded);
                0
            }
            Err(e) => {
                eprintln!("load failed: {e}");
                1
            }
        },
        Command::Validate => match load_registries() {
            Ok(loaded) => {
                if loaded.problems.is_empty() {
                    println!("ok");
                    0
                } else {
                    for problem in &loaded.problems {
                        println!("warning: {problem}");
                    }
                    0
                }
            }
            Err(e) => {
                eprintln!("invalid: {e}");
                1
            }
        },
        Command::Run {
            manager,
            task,
            llm_script,
        } => match load_registries() {
            Ok(loaded) => match run_manager(loaded, &manager, &task, &llm_script).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("run failed: {e}");
                    1
                }
            },
            Err(e) => {
                eprintln!("load failed: {e}");
                1
            }
        },
    };
    std::process::exit(code);
}

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use knowledge_kernel_api::{
    AddItemRequest, AddRuleRequest, KnowledgeApi, SelectRequest,
};
use knowledge_kernel_core::{ItemId, ItemType, KnowledgeTree, Priority, Scope};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "kk")]
#[command(about = "Knowledge Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./knowledge_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Tree {
        #[command(subcommand)]
        command: Box<TreeCommand>,
    },
    Item {
        #[command(subcommand)]
        command: Box<ItemCommand>,
    },
    Rule {
        #[command(subcommand)]
        command: Box<RuleCommand>,
    },
    Query {
        #[command(subcommand)]
        command: Box<QueryCommand>,
    },
    Prompt {
        #[command(subcommand)]
        command: Box<PromptCommand>,
    },
    Result {
        #[command(subcommand)]
        command: Box<ResultCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum TreeCommand {
    Show,
    Import(TreeImportArgs),
    Export(TreeExportArgs),
    AddDepartment(AddDepartmentArgs),
    AddSubDepartment(AddSubDepartmentArgs),
    AddWorkflow(AddWorkflowArgs),
}

#[derive(Debug, Args)]
struct TreeImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct TreeExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct AddDepartmentArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value_t = 1)]
    order: i64,
}

#[derive(Debug, Args)]
struct AddSubDepartmentArgs {
    #[arg(long)]
    department: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value_t = 1)]
    order: i64,
}

#[derive(Debug, Args)]
struct AddWorkflowArgs {
    #[arg(long)]
    department: String,
    #[arg(long)]
    sub_department: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value_t = 1)]
    order: i64,
}

#[derive(Debug, Subcommand)]
enum ItemCommand {
    Add(AddItemArgs),
    Remove(RemoveItemArgs),
}

#[derive(Debug, Args)]
struct AddItemArgs {
    #[arg(long)]
    department: String,
    #[arg(long)]
    sub_department: String,
    #[arg(long)]
    workflow: String,
    #[arg(long)]
    title: String,
    #[arg(long = "type")]
    item_type: ItemTypeArg,
    #[arg(long)]
    ai_instructions: Option<String>,
    #[arg(long)]
    command_body: Option<String>,
    #[arg(long)]
    content: Option<String>,
    #[arg(long = "role")]
    roles: Vec<String>,
    #[arg(long = "state")]
    states: Vec<String>,
    #[arg(long)]
    severity_max: Option<u8>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    priority: PriorityArg,
    #[arg(long, default_value_t = 1)]
    order: i64,
    #[arg(long)]
    effective: String,
    #[arg(long)]
    sunset: Option<String>,
    #[arg(long)]
    updated_by: String,
    #[arg(long)]
    change_note: Option<String>,
}

#[derive(Debug, Args)]
struct RemoveItemArgs {
    #[arg(long)]
    item_id: String,
}

#[derive(Debug, Subcommand)]
enum RuleCommand {
    Add(AddRuleArgs),
    List,
}

#[derive(Debug, Args)]
struct AddRuleArgs {
    #[arg(long = "path")]
    department_path: Vec<String>,
    #[arg(long)]
    title: String,
    #[arg(long)]
    ai_instructions: String,
    #[arg(long = "role")]
    roles: Vec<String>,
    #[arg(long = "state")]
    states: Vec<String>,
    #[arg(long)]
    severity_max: Option<u8>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    priority: PriorityArg,
    #[arg(long, default_value_t = 1)]
    order: i64,
    #[arg(long)]
    effective: String,
    #[arg(long)]
    sunset: Option<String>,
    #[arg(long)]
    updated_by: String,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Select(SelectArgs),
}

#[derive(Debug, Subcommand)]
enum PromptCommand {
    Generate(SelectArgs),
}

#[derive(Debug, Args)]
struct SelectArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_role: String,
    #[arg(long)]
    user_department: String,
    #[arg(long)]
    user_state: Option<String>,
    #[arg(long)]
    claim_severity: Option<u8>,
    #[arg(long)]
    intent: Option<String>,
    #[arg(long)]
    workflow_context: Option<String>,
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long, default_value_t = false)]
    legacy: bool,
}

#[derive(Debug, Subcommand)]
enum ResultCommand {
    Show(ResultShowArgs),
}

#[derive(Debug, Args)]
struct ResultShowArgs {
    #[arg(long)]
    selection_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ItemTypeArg {
    Rule,
    Command,
    SmartRule,
    Sop,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    High,
    Medium,
    Low,
}

impl ItemTypeArg {
    fn into_item_type(self) -> ItemType {
        match self {
            Self::Rule => ItemType::Rule,
            Self::Command => ItemType::Command,
            Self::SmartRule => ItemType::SmartRule,
            Self::Sop => ItemType::Sop,
        }
    }
}

impl PriorityArg {
    fn into_priority(self) -> Priority {
        match self {
            Self::High => Priority::High,
            Self::Medium => Priority::Medium,
            Self::Low => Priority::Low,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = KnowledgeApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Tree { command } => run_tree(*command, &api),
        Command::Item { command } => run_item(*command, &api),
        Command::Rule { command } => run_rule(*command, &api),
        Command::Query { command } => run_query(*command, &api),
        Command::Prompt { command } => run_prompt(*command, &api),
        Command::Result { command } => run_result(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &KnowledgeApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
    }
}

fn run_tree(command: TreeCommand, api: &KnowledgeApi) -> Result<()> {
    match command {
        TreeCommand::Show => {
            let tree = api.tree_show()?;
            emit_json(serde_json::json!({ "tree": tree }))
        }
        TreeCommand::Import(args) => {
            let body = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read tree file {}", args.file.display()))?;
            let tree: KnowledgeTree = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse tree JSON {}", args.file.display()))?;
            let imported = api.tree_import(&tree)?;
            emit_json(serde_json::json!({
                "imported_from": args.file,
                "tree_version": imported.version,
                "departments": imported.departments.len()
            }))
        }
        TreeCommand::Export(args) => {
            let tree = api.tree_show()?;
            let body =
                serde_json::to_vec_pretty(&tree).context("failed to serialize tree for export")?;
            fs::write(&args.out, body)
                .with_context(|| format!("failed to write tree file {}", args.out.display()))?;
            emit_json(serde_json::json!({
                "exported_to": args.out,
                "tree_version": tree.version
            }))
        }
        TreeCommand::AddDepartment(args) => {
            let result = api.add_department(&args.name, args.order)?;
            emit_json(serde_json::json!({
                "node_id": result.node_id.to_string(),
                "tree_version": result.tree_version
            }))
        }
        TreeCommand::AddSubDepartment(args) => {
            let result = api.add_sub_department(&args.department, &args.name, args.order)?;
            emit_json(serde_json::json!({
                "node_id": result.node_id.to_string(),
                "tree_version": result.tree_version
            }))
        }
        TreeCommand::AddWorkflow(args) => {
            let result =
                api.add_workflow(&args.department, &args.sub_department, &args.name, args.order)?;
            emit_json(serde_json::json!({
                "node_id": result.node_id.to_string(),
                "tree_version": result.tree_version
            }))
        }
    }
}

fn run_item(command: ItemCommand, api: &KnowledgeApi) -> Result<()> {
    match command {
        ItemCommand::Add(args) => {
            let item = api.add_item(AddItemRequest {
                department: args.department,
                sub_department: args.sub_department,
                workflow: args.workflow,
                title: args.title,
                item_type: args.item_type.into_item_type(),
                ai_instructions: args.ai_instructions,
                command_body: args.command_body,
                content: args.content,
                scope: Scope {
                    role: args.roles,
                    state: args.states,
                    severity_max: args.severity_max,
                    department: Vec::new(),
                },
                tags: args.tags,
                priority: args.priority.into_priority(),
                order: args.order,
                effective: args.effective,
                sunset: args.sunset,
                updated_by: args.updated_by,
                change_note: args.change_note,
            })?;
            emit_json(serde_json::to_value(&item).context("failed to serialize knowledge item")?)
        }
        ItemCommand::Remove(args) => {
            let item_id = parse_item_id(&args.item_id)?;
            let result = api.remove_item(item_id)?;
            emit_json(serde_json::json!({
                "removed_item_id": item_id.to_string(),
                "tree_version": result.tree_version
            }))
        }
    }
}

fn run_rule(command: RuleCommand, api: &KnowledgeApi) -> Result<()> {
    match command {
        RuleCommand::Add(args) => {
            if args.department_path.is_empty() {
                return Err(anyhow!("at least one --path segment is required"));
            }
            let rule = api.add_rule(AddRuleRequest {
                department_path: args.department_path,
                title: args.title,
                ai_instructions: args.ai_instructions,
                scope: Scope {
                    role: args.roles,
                    state: args.states,
                    severity_max: args.severity_max,
                    department: Vec::new(),
                },
                tags: args.tags,
                priority: args.priority.into_priority(),
                order: args.order,
                effective: args.effective,
                sunset: args.sunset,
                updated_by: args.updated_by,
            })?;
            emit_json(serde_json::to_value(&rule).context("failed to serialize flat rule")?)
        }
        RuleCommand::List => {
            let rules = api.list_rules()?;
            emit_json(serde_json::json!({ "rules": rules }))
        }
    }
}

fn run_query(command: QueryCommand, api: &KnowledgeApi) -> Result<()> {
    match command {
        QueryCommand::Select(args) => {
            let legacy = args.legacy;
            let request = build_select_request(args)?;
            let result = if legacy {
                api.query_select_legacy(request)?
            } else {
                api.query_select(request)?
            };
            emit_json(
                serde_json::to_value(&result).context("failed to serialize selection result")?,
            )
        }
    }
}

fn run_prompt(command: PromptCommand, api: &KnowledgeApi) -> Result<()> {
    match command {
        PromptCommand::Generate(args) => {
            if args.legacy {
                return Err(anyhow!("prompt generate does not support --legacy"));
            }
            let request = build_select_request(args)?;
            let result = api.prompt(request)?;
            emit_json(serde_json::json!({
                "selection_id": result.selection_id,
                "prompt": result.prompt
            }))
        }
    }
}

fn run_result(command: ResultCommand, api: &KnowledgeApi) -> Result<()> {
    match command {
        ResultCommand::Show(args) => {
            let result = api.result_show(&args.selection_id)?;
            emit_json(
                serde_json::to_value(&result).context("failed to serialize selection result")?,
            )
        }
    }
}

fn build_select_request(args: SelectArgs) -> Result<SelectRequest> {
    let as_of = args.as_of.as_deref().map(parse_rfc3339).transpose()?;
    Ok(SelectRequest {
        user_id: args.user_id,
        user_role: args.user_role,
        user_department: args.user_department,
        user_state: args.user_state,
        claim_severity: args.claim_severity,
        intent: args.intent,
        workflow_context: args.workflow_context,
        as_of,
    })
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn parse_item_id(value: &str) -> Result<ItemId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(ItemId(parsed))
}

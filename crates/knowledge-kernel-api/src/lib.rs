use std::path::PathBuf;

use anyhow::{anyhow, Result};
use knowledge_kernel_core::{
    generate_knowledge_prompt, select_flat_rules, select_knowledge_items, Department, FlatRule,
    ItemId, ItemType, KnowledgeItem, KnowledgeTree, NodeId, Priority, Scope, SelectionContext,
    SelectionResult, SubDepartment, Workflow,
};
use knowledge_kernel_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddNodeResult {
    pub node_id: NodeId,
    pub tree_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddItemRequest {
    pub department: String,
    pub sub_department: String,
    pub workflow: String,
    pub title: String,
    pub item_type: ItemType,
    pub ai_instructions: Option<String>,
    pub command_body: Option<String>,
    pub content: Option<String>,
    pub scope: Scope,
    pub tags: Vec<String>,
    pub priority: Priority,
    pub order: i64,
    pub effective: String,
    pub sunset: Option<String>,
    pub updated_by: String,
    pub change_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddRuleRequest {
    pub department_path: Vec<String>,
    pub title: String,
    pub ai_instructions: String,
    pub scope: Scope,
    pub tags: Vec<String>,
    pub priority: Priority,
    pub order: i64,
    pub effective: String,
    pub sunset: Option<String>,
    pub updated_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectRequest {
    pub user_id: String,
    pub user_role: String,
    pub user_department: String,
    pub user_state: Option<String>,
    pub claim_severity: Option<u8>,
    pub intent: Option<String>,
    pub workflow_context: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptResult {
    pub selection_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct KnowledgeApi {
    db_path: PathBuf,
}

impl KnowledgeApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Return the current knowledge tree, creating an empty one on first use.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn tree_show(&self) -> Result<KnowledgeTree> {
        let mut store = self.open_store()?;
        store.migrate()?;
        match store.load_tree()? {
            Some(tree) => Ok(tree),
            None => {
                let tree = KnowledgeTree::empty(OffsetDateTime::now_utc());
                store.save_tree(&tree)?;
                Ok(tree)
            }
        }
    }

    /// Replace the current knowledge tree wholesale with an imported snapshot.
    /// Every item in the snapshot is validated before anything is written.
    ///
    /// # Errors
    /// Returns an error when any item fails validation or persistence fails.
    pub fn tree_import(&self, tree: &KnowledgeTree) -> Result<KnowledgeTree> {
        for department in &tree.departments {
            for sub in &department.sub_departments {
                for workflow in &sub.workflows {
                    for item in &workflow.items {
                        item.validate().map_err(|err| {
                            anyhow!("imported item {} is invalid: {err}", item.item_id)
                        })?;
                    }
                }
            }
        }

        let mut store = self.open_store()?;
        store.migrate()?;
        let mut imported = tree.clone();
        imported.last_modified = OffsetDateTime::now_utc();
        store.save_tree(&imported)?;
        Ok(imported)
    }

    /// Create a department at the top level of the tree.
    ///
    /// # Errors
    /// Returns an error when a department with the same name exists or writes fail.
    pub fn add_department(&self, name: &str, order: i64) -> Result<AddNodeResult> {
        self.mutate_tree(|tree| {
            if tree.departments.iter().any(|department| department.name == name) {
                return Err(anyhow!("department already exists: {name}"));
            }
            let node_id = NodeId::new();
            tree.departments.push(Department {
                node_id,
                name: name.to_string(),
                order,
                sub_departments: Vec::new(),
            });
            Ok(node_id)
        })
    }

    /// Create a sub-department under an existing department.
    ///
    /// # Errors
    /// Returns an error when the parent is missing, the name collides, or writes fail.
    pub fn add_sub_department(
        &self,
        department: &str,
        name: &str,
        order: i64,
    ) -> Result<AddNodeResult> {
        self.mutate_tree(|tree| {
            let parent = find_department_mut(tree, department)?;
            if parent.sub_departments.iter().any(|sub| sub.name == name) {
                return Err(anyhow!("sub-department already exists: {name}"));
            }
            let node_id = NodeId::new();
            parent.sub_departments.push(SubDepartment {
                node_id,
                name: name.to_string(),
                order,
                workflows: Vec::new(),
            });
            Ok(node_id)
        })
    }

    /// Create a workflow under an existing sub-department.
    ///
    /// # Errors
    /// Returns an error when the parent chain is missing, the name collides, or writes fail.
    pub fn add_workflow(
        &self,
        department: &str,
        sub_department: &str,
        name: &str,
        order: i64,
    ) -> Result<AddNodeResult> {
        self.mutate_tree(|tree| {
            let parent = find_sub_department_mut(tree, department, sub_department)?;
            if parent.workflows.iter().any(|workflow| workflow.name == name) {
                return Err(anyhow!("workflow already exists: {name}"));
            }
            let node_id = NodeId::new();
            parent.workflows.push(Workflow {
                node_id,
                name: name.to_string(),
                order,
                items: Vec::new(),
            });
            Ok(node_id)
        })
    }

    /// Add one knowledge item to a workflow. The item is validated before the
    /// tree is touched; ids and provenance timestamps are generated here.
    ///
    /// # Errors
    /// Returns an error when the parent chain is missing, validation fails, or writes fail.
    pub fn add_item(&self, input: AddItemRequest) -> Result<KnowledgeItem> {
        let now = OffsetDateTime::now_utc();
        let item = KnowledgeItem {
            item_id: ItemId::new(),
            title: input.title,
            item_type: input.item_type,
            ai_instructions: input.ai_instructions,
            command_body: input.command_body,
            content: input.content,
            scope: input.scope,
            tags: input.tags,
            priority: input.priority,
            order: input.order,
            version: 1,
            effective: input.effective,
            sunset: input.sunset,
            is_active: true,
            created_at: now,
            updated_at: now,
            updated_by: input.updated_by,
            change_note: input.change_note,
        };
        item.validate().map_err(|err| anyhow!("item validation failed: {err}"))?;

        let stored = item.clone();
        self.mutate_tree(move |tree| {
            let parent = find_workflow_mut(
                tree,
                &input.department,
                &input.sub_department,
                &input.workflow,
            )?;
            parent.items.push(stored.clone());
            Ok(parent.node_id)
        })?;

        Ok(item)
    }

    /// Remove one knowledge item from the tree by id.
    ///
    /// # Errors
    /// Returns an error when the item does not exist or persistence fails.
    pub fn remove_item(&self, item_id: ItemId) -> Result<AddNodeResult> {
        self.mutate_tree(|tree| {
            for department in &mut tree.departments {
                for sub in &mut department.sub_departments {
                    for workflow in &mut sub.workflows {
                        let before = workflow.items.len();
                        workflow.items.retain(|item| item.item_id != item_id);
                        if workflow.items.len() < before {
                            return Ok(workflow.node_id);
                        }
                    }
                }
            }
            Err(anyhow!("item not found: {item_id}"))
        })
    }

    /// Add one legacy flat rule.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_rule(&self, input: AddRuleRequest) -> Result<FlatRule> {
        let now = OffsetDateTime::now_utc();
        let rule = FlatRule {
            department_path: input.department_path,
            item: KnowledgeItem {
                item_id: ItemId::new(),
                title: input.title,
                item_type: ItemType::Rule,
                ai_instructions: Some(input.ai_instructions),
                command_body: None,
                content: None,
                scope: input.scope,
                tags: input.tags,
                priority: input.priority,
                order: input.order,
                version: 1,
                effective: input.effective,
                sunset: input.sunset,
                is_active: true,
                created_at: now,
                updated_at: now,
                updated_by: input.updated_by,
                change_note: None,
            },
        };

        let mut store = self.open_store()?;
        store.migrate()?;
        store.write_flat_rule(&rule)?;
        Ok(rule)
    }

    /// List all persisted legacy flat rules.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_rules(&self) -> Result<Vec<FlatRule>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_flat_rules()
    }

    /// Run a selection against the current knowledge tree and persist the result.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the result cannot be saved.
    pub fn query_select(&self, input: SelectRequest) -> Result<SelectionResult> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let context = build_context(input);
        let tree = store.load_tree()?.unwrap_or_else(|| KnowledgeTree::empty(context.as_of));
        let mut result = select_knowledge_items(&tree, &context);
        result.selection_id = compute_selection_id(&context, &result);
        store.save_selection_result(&result)?;
        Ok(result)
    }

    /// Run a selection against the legacy flat rules and persist the result.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the result cannot be saved.
    pub fn query_select_legacy(&self, input: SelectRequest) -> Result<SelectionResult> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let context = build_context(input);
        let rules = store.list_flat_rules()?;
        let mut result = select_flat_rules(&rules, &context);
        result.selection_id = compute_selection_id(&context, &result);
        store.save_selection_result(&result)?;
        Ok(result)
    }

    /// Select from the tree and render the system-prompt block for the result.
    ///
    /// # Errors
    /// Returns an error when selection or persistence fails.
    pub fn prompt(&self, input: SelectRequest) -> Result<PromptResult> {
        let result = self.query_select(input)?;
        Ok(PromptResult {
            selection_id: result.selection_id.clone(),
            prompt: generate_knowledge_prompt(&result.selected_items),
        })
    }

    /// Fetch a previously persisted selection result.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the result does not exist.
    pub fn result_show(&self, selection_id: &str) -> Result<SelectionResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store
            .get_selection_result(selection_id)?
            .ok_or_else(|| anyhow!("selection result not found: {selection_id}"))
    }

    fn mutate_tree<F>(&self, apply: F) -> Result<AddNodeResult>
    where
        F: FnOnce(&mut KnowledgeTree) -> Result<NodeId>,
    {
        let mut store = self.open_store()?;
        store.migrate()?;
        let mut tree =
            store.load_tree()?.unwrap_or_else(|| KnowledgeTree::empty(OffsetDateTime::now_utc()));

        let node_id = apply(&mut tree)?;

        tree.version = tree.version.saturating_add(1);
        tree.last_modified = OffsetDateTime::now_utc();
        store.save_tree(&tree)?;
        Ok(AddNodeResult { node_id, tree_version: tree.version })
    }
}

fn build_context(input: SelectRequest) -> SelectionContext {
    SelectionContext {
        user_id: input.user_id,
        user_role: input.user_role,
        user_department: input.user_department,
        user_state: input.user_state,
        claim_severity: input.claim_severity,
        intent: input.intent,
        workflow_context: input.workflow_context,
        as_of: input.as_of.unwrap_or_else(OffsetDateTime::now_utc),
    }
}

fn find_department_mut<'t>(tree: &'t mut KnowledgeTree, name: &str) -> Result<&'t mut Department> {
    tree.departments
        .iter_mut()
        .find(|department| department.name == name)
        .ok_or_else(|| anyhow!("department not found: {name}"))
}

fn find_sub_department_mut<'t>(
    tree: &'t mut KnowledgeTree,
    department: &str,
    sub_department: &str,
) -> Result<&'t mut SubDepartment> {
    find_department_mut(tree, department)?
        .sub_departments
        .iter_mut()
        .find(|sub| sub.name == sub_department)
        .ok_or_else(|| anyhow!("sub-department not found: {sub_department}"))
}

fn find_workflow_mut<'t>(
    tree: &'t mut KnowledgeTree,
    department: &str,
    sub_department: &str,
    workflow: &str,
) -> Result<&'t mut Workflow> {
    find_sub_department_mut(tree, department, sub_department)?
        .workflows
        .iter_mut()
        .find(|candidate| candidate.name == workflow)
        .ok_or_else(|| anyhow!("workflow not found: {workflow}"))
}

fn compute_selection_id(context: &SelectionContext, result: &SelectionResult) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.user_id.as_bytes());
    hasher.update(context.user_role.as_bytes());
    hasher.update(context.user_department.as_bytes());
    if let Some(state) = &context.user_state {
        hasher.update(state.as_bytes());
    }
    if let Some(severity) = context.claim_severity {
        hasher.update([severity]);
    }
    if let Some(intent) = &context.intent {
        hasher.update(intent.as_bytes());
    }
    hasher.update(context.as_of.unix_timestamp().to_string().as_bytes());

    let mut sorted_ids = result
        .audit
        .candidate_ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    sorted_ids.sort_unstable();
    for value in sorted_ids {
        hasher.update(value.as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("sel_{}", &digest_hex[..16])
}

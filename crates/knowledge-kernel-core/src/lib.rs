use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
}

/// Maximum instruction length for `rule` items, enforced at write time only.
/// The selector never re-validates it.
pub const MAX_RULE_INSTRUCTION_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemId(pub Ulid);

impl ItemId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub Ulid);

impl NodeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ItemType {
    Rule,
    Command,
    SmartRule,
    Sop,
}

impl ItemType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Command => "command",
            Self::SmartRule => "smartRule",
            Self::Sop => "sop",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rule" => Some(Self::Rule),
            "command" => Some(Self::Command),
            "smartRule" => Some(Self::SmartRule),
            "sop" => Some(Self::Sop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "High" => Some(Self::High),
            "Medium" => Some(Self::Medium),
            "Low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Eligibility predicate attached to a knowledge item. Empty `role`/`state`
/// whitelists mean "applies to all"; absent arrays deserialize as empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    #[serde(default)]
    pub role: Vec<String>,
    #[serde(default)]
    pub state: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_max: Option<u8>,
    #[serde(default)]
    pub department: Vec<String>,
}

/// The atomic unit of guidance: an imperative rule, a structured command,
/// a smart rule (logic block plus resolved instruction), or a human-facing SOP.
///
/// `effective` and `sunset` are kept as raw ISO date strings exactly as the
/// editor persists them; they are parsed at selection time so that bad data
/// can be excluded fail-closed instead of crashing the selector.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeItem {
    #[serde(rename = "id")]
    pub item_id: ItemId,
    pub title: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub tags: Vec<String>,
    pub priority: Priority,
    pub order: i64,
    pub version: u32,
    pub effective: String,
    #[serde(default)]
    pub sunset: Option<String>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_note: Option<String>,
}

impl KnowledgeItem {
    /// Validate one item against entry-time invariants. Called by the editor
    /// surface on every write; selection never re-validates (fail-soft reads).
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when identity, accountability, or
    /// type-specific content constraints are violated.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.title.trim().is_empty() {
            return Err(KernelError::Validation("title MUST be non-empty".to_string()));
        }

        if self.version == 0 {
            return Err(KernelError::Validation("version MUST be >= 1".to_string()));
        }

        if self.updated_by.trim().is_empty() {
            return Err(KernelError::Validation(
                "updatedBy MUST be provided for every write".to_string(),
            ));
        }

        match self.item_type {
            ItemType::Rule => {
                let Some(instructions) = non_empty(self.ai_instructions.as_deref()) else {
                    return Err(KernelError::Validation(
                        "rule items MUST carry aiInstructions".to_string(),
                    ));
                };
                if instructions.chars().count() > MAX_RULE_INSTRUCTION_CHARS {
                    return Err(KernelError::Validation(format!(
                        "aiInstructions MUST be <= {MAX_RULE_INSTRUCTION_CHARS} characters"
                    )));
                }
            }
            ItemType::Command => {
                if non_empty(self.command_body.as_deref()).is_none() {
                    return Err(KernelError::Validation(
                        "command items MUST carry commandBody".to_string(),
                    ));
                }
            }
            ItemType::SmartRule => {
                if non_empty(self.content.as_deref()).is_none()
                    || non_empty(self.ai_instructions.as_deref()).is_none()
                {
                    return Err(KernelError::Validation(
                        "smartRule items MUST carry both content and aiInstructions".to_string(),
                    ));
                }
            }
            ItemType::Sop => {
                if non_empty(self.content.as_deref()).is_none() {
                    return Err(KernelError::Validation(
                        "sop items MUST carry content".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|trimmed| !trimmed.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(rename = "id")]
    pub node_id: NodeId,
    pub name: String,
    pub order: i64,
    #[serde(default)]
    pub items: Vec<KnowledgeItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubDepartment {
    #[serde(rename = "id")]
    pub node_id: NodeId,
    pub name: String,
    pub order: i64,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    #[serde(rename = "id")]
    pub node_id: NodeId,
    pub name: String,
    pub order: i64,
    #[serde(default)]
    pub sub_departments: Vec<SubDepartment>,
}

/// The full hierarchical knowledge base. `version` and `last_modified` are
/// owned by the external editor and bumped on every structural mutation;
/// selection only reads them.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeTree {
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    #[serde(default)]
    pub departments: Vec<Department>,
}

impl KnowledgeTree {
    #[must_use]
    pub fn empty(now: OffsetDateTime) -> Self {
        Self { version: 1, last_modified: now, departments: Vec::new() }
    }

    /// Iterate every item id in the tree in traversal order.
    pub fn item_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.departments
            .iter()
            .flat_map(|department| &department.sub_departments)
            .flat_map(|sub| &sub.workflows)
            .flat_map(|workflow| &workflow.items)
            .map(|item| item.item_id)
    }
}

/// Legacy flat rule: the pre-tree model where each rule carries its own
/// static department path instead of being placed in the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlatRule {
    #[serde(rename = "departmentPath", default)]
    pub department_path: Vec<String>,
    #[serde(flatten)]
    pub item: KnowledgeItem,
}

/// Per-query value object describing who is asking and under what
/// circumstances. `as_of` is the explicit clock: selection is a pure
/// function of the snapshot and this context.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectionContext {
    pub user_id: String,
    pub user_role: String,
    pub user_department: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_severity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_context: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

/// An item paired with the tree path through which it was reachable for this
/// query. The path is derived per selection, never stored on the entity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectedItem {
    pub item: KnowledgeItem,
    pub department_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Priority,
    Scope,
    Instruction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Error,
    Warning,
}

/// A pairwise advisory flag between two competing items. The kernel never
/// resolves conflicts; they are surfaced for human review only.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleConflict {
    pub first_item: KnowledgeItem,
    pub second_item: KnowledgeItem,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub path: String,
}

/// Replayable record of what was searched and what was returned.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectionAudit {
    pub context: SelectionContext,
    pub candidate_ids: Vec<ItemId>,
    pub selected_ids: Vec<ItemId>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub paths_searched: String,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResult {
    /// Assigned by the persistence layer; empty when produced by the pure core.
    pub selection_id: String,
    pub selected_items: Vec<SelectedItem>,
    pub conflicts: Vec<RuleConflict>,
    pub audit: SelectionAudit,
}

/// Candidates gathered by one collection strategy, plus the distinct tree
/// paths visited while gathering them.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    pub candidates: Vec<SelectedItem>,
    pub paths_searched: Vec<String>,
}

/// Candidate-collection strategy. The filtering, sorting, conflict-detection,
/// and audit stages are shared; only how candidates are discovered differs
/// between the hierarchical tree and the legacy flat rule list.
pub trait CandidateSource {
    fn collect(&self, context: &SelectionContext) -> CandidateSet;
}

/// Tree-walking candidate collection: department substring match, full
/// traversal of the matched department, then an optional whole-tree intent
/// scan over item tags.
#[derive(Debug, Clone, Copy)]
pub struct TreeCandidates<'a> {
    pub tree: &'a KnowledgeTree,
}

impl CandidateSource for TreeCandidates<'_> {
    fn collect(&self, context: &SelectionContext) -> CandidateSet {
        let mut candidates: Vec<SelectedItem> = Vec::new();
        let mut seen: BTreeSet<ItemId> = BTreeSet::new();
        let mut paths: Vec<String> = Vec::new();

        // Lenient bidirectional substring match tolerates naming variants
        // ("CAN program" vs "CAN Network (Coastal Adjuster Network)"). An
        // empty needle would match every department, so it matches none.
        let department_needle = context.user_department.trim().to_lowercase();
        if !department_needle.is_empty() {
            let matched = self.tree.departments.iter().find(|department| {
                let name = department.name.to_lowercase();
                name.contains(&department_needle) || department_needle.contains(&name)
            });

            if let Some(department) = matched {
                for sub in &department.sub_departments {
                    for workflow in &sub.workflows {
                        let path =
                            format!("{} > {} > {}", department.name, sub.name, workflow.name);
                        paths.push(path.clone());
                        for item in &workflow.items {
                            if seen.insert(item.item_id) {
                                candidates.push(SelectedItem {
                                    item: item.clone(),
                                    department_path: path.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        if let Some(intent) = context.intent.as_deref() {
            let intent_needle = intent.trim().to_lowercase();
            if !intent_needle.is_empty() {
                for department in &self.tree.departments {
                    for sub in &department.sub_departments {
                        for workflow in &sub.workflows {
                            let path =
                                format!("{} > {} > {}", department.name, sub.name, workflow.name);
                            for item in &workflow.items {
                                // Check-before-insert: an item already found by
                                // department traversal keeps its earlier path.
                                if tags_match_intent(&item.tags, &intent_needle)
                                    && seen.insert(item.item_id)
                                {
                                    candidates.push(SelectedItem {
                                        item: item.clone(),
                                        department_path: path.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        CandidateSet { candidates, paths_searched: paths }
    }
}

/// Legacy flat-list candidate collection: the department match is a substring
/// test against each rule's static path segments; the intent scan is the same
/// tag match as the tree strategy.
#[derive(Debug, Clone, Copy)]
pub struct FlatCandidates<'a> {
    pub rules: &'a [FlatRule],
}

impl CandidateSource for FlatCandidates<'_> {
    fn collect(&self, context: &SelectionContext) -> CandidateSet {
        let mut candidates: Vec<SelectedItem> = Vec::new();
        let mut seen: BTreeSet<ItemId> = BTreeSet::new();
        let mut paths: Vec<String> = Vec::new();

        let department_needle = context.user_department.trim().to_lowercase();
        if !department_needle.is_empty() {
            for rule in self.rules {
                let matched = rule.department_path.iter().any(|segment| {
                    let segment = segment.to_lowercase();
                    segment.contains(&department_needle) || department_needle.contains(&segment)
                });
                if matched && seen.insert(rule.item.item_id) {
                    let path = rule.department_path.join(" > ");
                    if !paths.contains(&path) {
                        paths.push(path.clone());
                    }
                    candidates.push(SelectedItem { item: rule.item.clone(), department_path: path });
                }
            }
        }

        if let Some(intent) = context.intent.as_deref() {
            let intent_needle = intent.trim().to_lowercase();
            if !intent_needle.is_empty() {
                for rule in self.rules {
                    if tags_match_intent(&rule.item.tags, &intent_needle)
                        && seen.insert(rule.item.item_id)
                    {
                        candidates.push(SelectedItem {
                            item: rule.item.clone(),
                            department_path: rule.department_path.join(" > "),
                        });
                    }
                }
            }
        }

        CandidateSet { candidates, paths_searched: paths }
    }
}

fn tags_match_intent(tags: &[String], intent_needle: &str) -> bool {
    tags.iter().any(|tag| {
        let tag = tag.to_lowercase();
        tag.contains(intent_needle) || intent_needle.contains(tag.as_str())
    })
}

/// Parse an item validity date: RFC 3339, or a bare `YYYY-MM-DD` calendar
/// date taken as midnight UTC.
#[must_use]
pub fn parse_validity_date(value: &str) -> Option<OffsetDateTime> {
    let trimmed = value.trim();
    if let Ok(parsed) =
        OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
    {
        return Some(parsed);
    }

    let mut parts = trimmed.splitn(3, '-');
    let year = parts.next()?.parse::<i32>().ok()?;
    let month = parts.next()?.parse::<u8>().ok()?;
    let day = parts.next()?.parse::<u8>().ok()?;
    let month = time::Month::try_from(month).ok()?;
    let date = time::Date::from_calendar_date(year, month, day).ok()?;
    Some(date.midnight().assume_utc())
}

fn scope_allows(scope: &Scope, context: &SelectionContext) -> bool {
    if !scope.role.is_empty() && !scope.role.iter().any(|role| role == &context.user_role) {
        return false;
    }

    if let Some(state) = &context.user_state {
        if !scope.state.is_empty() && !scope.state.iter().any(|entry| entry == state) {
            return false;
        }
    }

    if let (Some(severity), Some(ceiling)) = (context.claim_severity, scope.severity_max) {
        if severity > ceiling {
            return false;
        }
    }

    true
}

/// Active + temporal filter. Unparsable dates are treated as not currently
/// valid (fail closed) and surfaced through the audit notes.
fn is_currently_valid(item: &KnowledgeItem, as_of: OffsetDateTime, notes: &mut Vec<String>) -> bool {
    if !item.is_active {
        return false;
    }

    let Some(effective) = parse_validity_date(&item.effective) else {
        notes.push(format!(
            "item {} excluded: unparsable effective date `{}`",
            item.item_id, item.effective
        ));
        return false;
    };
    if effective > as_of {
        return false;
    }

    if let Some(raw_sunset) = &item.sunset {
        let Some(sunset) = parse_validity_date(raw_sunset) else {
            notes.push(format!(
                "item {} excluded: unparsable sunset date `{raw_sunset}`",
                item.item_id
            ));
            return false;
        };
        if sunset <= as_of {
            return false;
        }
    }

    true
}

/// Pluggable pairwise conflict test between two already-selected items.
pub trait ConflictPolicy {
    fn are_conflicting(&self, first: &KnowledgeItem, second: &KnowledgeItem) -> bool;
}

/// Coarse lexical-overlap heuristic: two instructions conflict when they
/// share more than `min_shared_tokens - 1` distinct whitespace tokens longer
/// than `min_token_chars - 1` characters. A proxy for human review, not a
/// semantic comparison.
#[derive(Debug, Clone, Copy)]
pub struct TokenOverlapPolicy {
    pub min_token_chars: usize,
    pub min_shared_tokens: usize,
}

impl Default for TokenOverlapPolicy {
    fn default() -> Self {
        // Shared tokens must be longer than 3 chars, and more than 2 of them.
        Self { min_token_chars: 4, min_shared_tokens: 3 }
    }
}

impl ConflictPolicy for TokenOverlapPolicy {
    fn are_conflicting(&self, first: &KnowledgeItem, second: &KnowledgeItem) -> bool {
        let (Some(first_text), Some(second_text)) =
            (first.ai_instructions.as_deref(), second.ai_instructions.as_deref())
        else {
            return false;
        };

        let first_tokens = instruction_tokens(first_text, self.min_token_chars);
        let second_tokens = instruction_tokens(second_text, self.min_token_chars);
        first_tokens.intersection(&second_tokens).count() >= self.min_shared_tokens
    }
}

fn instruction_tokens(text: &str, min_chars: usize) -> BTreeSet<String> {
    text.split_whitespace()
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() >= min_chars)
        .collect()
}

/// Scan the final sorted list for competing high-priority rule instructions.
/// Only fully-resolved imperative `rule` items participate; commands, smart
/// rules, and SOPs are never compared. O(n^2) over high-priority rules.
#[must_use]
pub fn detect_conflicts(items: &[SelectedItem], policy: &dyn ConflictPolicy) -> Vec<RuleConflict> {
    let high_rules: Vec<&SelectedItem> = items
        .iter()
        .filter(|selected| {
            selected.item.priority == Priority::High && selected.item.item_type == ItemType::Rule
        })
        .collect();

    let mut conflicts = Vec::new();
    for (index, first) in high_rules.iter().enumerate() {
        for second in &high_rules[index + 1..] {
            if policy.are_conflicting(&first.item, &second.item) {
                conflicts.push(RuleConflict {
                    first_item: first.item.clone(),
                    second_item: second.item.clone(),
                    conflict_type: ConflictType::Instruction,
                    severity: ConflictSeverity::Warning,
                    path: first.department_path.clone(),
                });
            }
        }
    }

    conflicts
}

/// Run the shared selection pipeline over one candidate source: collect,
/// scope-filter, temporal-filter, sort, detect conflicts, assemble the audit.
#[must_use]
pub fn run_selection<S: CandidateSource>(source: &S, context: &SelectionContext) -> SelectionResult {
    let CandidateSet { candidates, paths_searched } = source.collect(context);
    let candidate_ids: Vec<ItemId> =
        candidates.iter().map(|candidate| candidate.item.item_id).collect();

    let mut notes: Vec<String> = Vec::new();
    let mut selected: Vec<SelectedItem> = candidates
        .into_iter()
        .filter(|candidate| scope_allows(&candidate.item.scope, context))
        .filter(|candidate| is_currently_valid(&candidate.item, context.as_of, &mut notes))
        .collect();

    // Stable: full ties keep their candidate-collection order.
    selected.sort_by(|first, second| {
        second
            .item
            .priority
            .rank()
            .cmp(&first.item.priority.rank())
            .then_with(|| first.item.order.cmp(&second.item.order))
    });

    let conflicts = detect_conflicts(&selected, &TokenOverlapPolicy::default());
    let selected_ids: Vec<ItemId> =
        selected.iter().map(|candidate| candidate.item.item_id).collect();

    SelectionResult {
        selection_id: String::new(),
        selected_items: selected,
        conflicts,
        audit: SelectionAudit {
            context: context.clone(),
            candidate_ids,
            selected_ids,
            generated_at: context.as_of,
            paths_searched: paths_searched.join("; "),
            notes,
        },
    }
}

/// Select applicable items from the hierarchical knowledge tree.
#[must_use]
pub fn select_knowledge_items(
    tree: &KnowledgeTree,
    context: &SelectionContext,
) -> SelectionResult {
    run_selection(&TreeCandidates { tree }, context)
}

/// Select applicable rules from the legacy flat rule list.
#[must_use]
pub fn select_flat_rules(rules: &[FlatRule], context: &SelectionContext) -> SelectionResult {
    run_selection(&FlatCandidates { rules }, context)
}

pub const RULES_PROMPT_HEADER: &str =
    "Apply the following operating rules, in priority order:";
pub const COMMANDS_PROMPT_HEADER: &str =
    "The following commands are available when the adjuster asks for them:";

/// Render selected items into a plain-text system-prompt block. Rules are
/// numbered in the exact selection order (no re-sort); commands follow as a
/// bulleted list. SOPs and smart-rule logic blocks never surface here.
#[must_use]
pub fn generate_knowledge_prompt(items: &[SelectedItem]) -> String {
    let rules: Vec<&KnowledgeItem> = items
        .iter()
        .map(|selected| &selected.item)
        .filter(|item| {
            item.item_type == ItemType::Rule && non_empty(item.ai_instructions.as_deref()).is_some()
        })
        .collect();
    let commands: Vec<&KnowledgeItem> = items
        .iter()
        .map(|selected| &selected.item)
        .filter(|item| item.item_type == ItemType::Command)
        .collect();

    let mut sections: Vec<String> = Vec::new();

    if !rules.is_empty() {
        let mut block = String::from(RULES_PROMPT_HEADER);
        for (index, rule) in rules.iter().enumerate() {
            let instructions = rule.ai_instructions.as_deref().unwrap_or_default().trim();
            let _ = write!(block, "\n{}. {instructions}", index + 1);
        }
        sections.push(block);
    }

    if !commands.is_empty() {
        let mut block = String::from(COMMANDS_PROMPT_HEADER);
        for command in &commands {
            let body = command.command_body.as_deref().unwrap_or_default().trim();
            let _ = write!(block, "\n- {}: {body}", command.title);
        }
        sections.push(block);
    }

    sections.join("\n\n")
}
